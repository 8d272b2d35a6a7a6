//! Sparse and volume extents.
//!
//! Two kinds of extent information feed the hasher:
//!
//! * [`SparseExtent`]: a byte range that reads as zero without backing
//!   storage.  Produced lazily, in increasing offset order, by an
//!   [`ExtentSource`].
//! * [`FileExtent`]: a contiguous run of a file mapped onto volume-relative
//!   storage (change-block-tracking data).  Only used to compute index
//!   positions; never read through.
//!
//! # Descriptor format
//! Transports that report holes as a side file use a flat stream of
//! 16-byte little-endian records `{offset: i64, size: i64}`.  A record with
//! `offset == -1` (or the end of the stream) terminates the list.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

#[cfg(target_os = "linux")]
mod holes;
#[cfg(target_os = "linux")]
pub use holes::HoleIterator;

/// Wire size of one descriptor record.
pub const SPARSE_EXTENT_RECORD_SIZE: usize = 16;

// ── SparseExtent ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SparseExtent {
    pub offset: i64,
    pub size:   i64,
}

impl SparseExtent {
    /// Terminator used by the descriptor stream.
    pub const END: SparseExtent = SparseExtent { offset: -1, size: -1 };

    pub fn new(offset: i64, size: i64) -> Self {
        Self { offset, size }
    }

    pub fn is_end(&self) -> bool {
        self.offset == -1
    }

    pub fn end(&self) -> i64 {
        self.offset + self.size
    }

    /// True when `[pos, pos + len)` lies entirely inside this extent.
    pub fn covers(&self, pos: i64, len: i64) -> bool {
        !self.is_end() && self.offset <= pos && self.end() >= pos + len
    }
}

/// Lazy, finite, monotonically increasing sequence of sparse extents.
pub trait ExtentSource {
    /// `None` once the sequence is exhausted.
    fn next_extent(&mut self) -> io::Result<Option<SparseExtent>>;
}

/// Extent source over an in-memory list.
#[derive(Debug, Clone, Default)]
pub struct VecExtents {
    extents: Vec<SparseExtent>,
    next:    usize,
}

impl VecExtents {
    pub fn new(mut extents: Vec<SparseExtent>) -> Self {
        extents.sort_by_key(|e| e.offset);
        Self { extents, next: 0 }
    }
}

impl ExtentSource for VecExtents {
    fn next_extent(&mut self) -> io::Result<Option<SparseExtent>> {
        let e = self.extents.get(self.next).copied();
        if e.is_some() {
            self.next += 1;
        }
        Ok(e)
    }
}

/// Source with no sparse regions.
pub struct NoExtents;

impl ExtentSource for NoExtents {
    fn next_extent(&mut self) -> io::Result<Option<SparseExtent>> {
        Ok(None)
    }
}

// ── SparseExtentCursor ────────────────────────────────────────────────────────

/// Tracks the current sparse extent while a caller walks forward through a file.
///
/// Extent source errors end the sequence: a missed hole only costs a read.
pub struct SparseExtentCursor<'a> {
    source:  Box<dyn ExtentSource + 'a>,
    current: Option<SparseExtent>,
}

impl<'a> SparseExtentCursor<'a> {
    pub fn new(mut source: Box<dyn ExtentSource + 'a>) -> Self {
        let current = pull(source.as_mut());
        Self { source, current }
    }

    /// Discard extents ending before `pos` and return the current one.
    pub fn advance_to(&mut self, pos: i64) -> Option<SparseExtent> {
        while let Some(e) = self.current {
            if e.end() >= pos {
                break;
            }
            self.current = pull(self.source.as_mut());
        }
        self.current
    }

    /// True when the block `[pos, pos + len)` is entirely sparse.
    pub fn covers(&mut self, pos: i64, len: i64) -> bool {
        self.advance_to(pos).map_or(false, |e| e.covers(pos, len))
    }
}

fn pull(source: &mut (dyn ExtentSource + '_)) -> Option<SparseExtent> {
    match source.next_extent() {
        Ok(Some(e)) if !e.is_end() => Some(e),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "sparse extent source failed, treating file as dense");
            None
        }
    }
}

// ── FileExtent ────────────────────────────────────────────────────────────────

/// A run of file bytes mapped to volume storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    pub offset:        i64,
    pub size:          i64,
    /// Negative when the run has no volume mapping.
    pub volume_offset: i64,
    pub flags:         u32,
}

impl FileExtent {
    /// Allocated but never written: logically zero.
    pub const FLAG_UNWRITTEN: u32 = 0x1;

    pub fn end(&self) -> i64 {
        self.offset + self.size
    }

    pub fn is_unwritten(&self) -> bool {
        self.flags & Self::FLAG_UNWRITTEN != 0
    }

    /// Whether this extent may back a CBT shortcut for `[pos, pos + len)`.
    pub fn eligible_for(&self, pos: i64, len: i64, valid_data_length: i64) -> bool {
        self.volume_offset >= 0
            && !self.is_unwritten()
            && self.offset <= pos
            && self.end() >= pos + len
            && self.end() <= valid_data_length
    }

    /// Volume position of file offset `pos` (caller checks containment).
    pub fn volume_pos(&self, pos: i64) -> i64 {
        self.volume_offset + (pos - self.offset)
    }
}

// ── Descriptor codec ──────────────────────────────────────────────────────────

/// Write `extents` followed by the terminator record.
pub fn encode_sparse_extents<W: Write>(mut w: W, extents: &[SparseExtent]) -> io::Result<()> {
    for e in extents {
        w.write_i64::<LittleEndian>(e.offset)?;
        w.write_i64::<LittleEndian>(e.size)?;
    }
    w.write_i64::<LittleEndian>(SparseExtent::END.offset)?;
    w.write_i64::<LittleEndian>(SparseExtent::END.size)?;
    Ok(())
}

/// Streaming reader for the descriptor format.
pub struct SparseExtentReader<R: Read> {
    inner: R,
    done:  bool,
}

impl<R: Read> SparseExtentReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }
}

impl<R: Read> ExtentSource for SparseExtentReader<R> {
    fn next_extent(&mut self) -> io::Result<Option<SparseExtent>> {
        if self.done {
            return Ok(None);
        }
        let offset = match self.inner.read_i64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let size = self.inner.read_i64::<LittleEndian>()?;
        let e = SparseExtent { offset, size };
        if e.is_end() {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(e))
    }
}

/// Read a whole descriptor into memory.
pub fn decode_sparse_extents<R: Read>(r: R) -> io::Result<Vec<SparseExtent>> {
    let mut reader = SparseExtentReader::new(r);
    let mut out = Vec::new();
    while let Some(e) = reader.next_extent()? {
        out.push(e);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_skips_extents_behind_position() {
        let src = VecExtents::new(vec![
            SparseExtent::new(0, 100),
            SparseExtent::new(200, 1000),
            SparseExtent::new(4096, 4096),
        ]);
        let mut cur = SparseExtentCursor::new(Box::new(src));
        assert!(cur.covers(0, 100));
        assert!(!cur.covers(0, 101));
        assert!(cur.covers(200, 512));
        assert_eq!(cur.advance_to(1201), Some(SparseExtent::new(4096, 4096)));
        assert!(cur.covers(4096, 4096));
        assert_eq!(cur.advance_to(9000), None);
        assert!(!cur.covers(9000, 1));
    }

    #[test]
    fn descriptor_stops_at_terminator() {
        let extents = vec![SparseExtent::new(0, 4096), SparseExtent::new(8192, 4096)];
        let mut buf = Vec::new();
        encode_sparse_extents(&mut buf, &extents).unwrap();
        assert_eq!(buf.len(), 3 * SPARSE_EXTENT_RECORD_SIZE);
        // Trailing garbage after the terminator is never read.
        buf.extend_from_slice(&[0xFF; 7]);
        assert_eq!(decode_sparse_extents(&buf[..]).unwrap(), extents);
    }

    #[test]
    fn descriptor_without_terminator_ends_at_eof() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&512i64.to_le_bytes());
        buf.extend_from_slice(&1024i64.to_le_bytes());
        assert_eq!(decode_sparse_extents(&buf[..]).unwrap(), vec![SparseExtent::new(512, 1024)]);
    }

    #[test]
    fn file_extent_eligibility() {
        let e = FileExtent { offset: 0, size: 1 << 20, volume_offset: 4096, flags: 0 };
        assert!(e.eligible_for(0, 512 * 1024, 1 << 20));
        assert!(!e.eligible_for(0, 512 * 1024, (1 << 20) - 1));
        assert!(!FileExtent { flags: FileExtent::FLAG_UNWRITTEN, ..e }.eligible_for(0, 4096, 1 << 20));
        assert!(!FileExtent { volume_offset: -1, ..e }.eligible_for(0, 4096, 1 << 20));
        assert_eq!(e.volume_pos(100), 4196);
    }
}
