//! Persistent checkpoint hash index.
//!
//! A flat side file of fixed-size records, one per checkpoint window of the
//! *volume* (not of a file): record `i` lives at byte `i * record_size` and
//! describes the window starting at volume offset `i * checkpoint_size`.
//! There is no header; the record count is implied by the file length and
//! records never written read back as all-zero, which means "absent".
//!
//! # Record layout
//! See [`crate::settings`]: `u16 LE sector offset ‖ strong hash ‖ u32 LE small hashes`.
//!
//! # Invalidation
//! An external rebuild bumps the shared [`IndexGeneration`].  Readers and
//! writers compare the live value with the reference they captured and stop
//! trusting the file as soon as the two differ; no lock is taken on the file.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::hash::CheckpointHash;
use crate::settings::ChunkSettings;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error on index {path}: {source}")]
    Io {
        path:   String,
        #[source]
        source: io::Error,
    },
    #[error("record {index} has {got} small hashes, expected {expected}")]
    RecordShape { index: u64, got: usize, expected: usize },
}

// ── IndexGeneration ───────────────────────────────────────────────────────────

/// Process-wide invalidation counter shared by all hashers of one index.
#[derive(Debug, Clone, Default)]
pub struct IndexGeneration(Arc<AtomicU64>);

impl IndexGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate every snapshot taken so far.  Returns the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn snapshot(&self) -> GenerationSnapshot {
        GenerationSnapshot { live: self.clone(), reference: self.current() }
    }
}

/// Live counter plus the value captured when the snapshot was taken.
#[derive(Debug, Clone)]
pub struct GenerationSnapshot {
    live:      IndexGeneration,
    reference: u64,
}

impl GenerationSnapshot {
    pub fn is_current(&self) -> bool {
        self.live.current() == self.reference
    }
}

// ── ChunkHashRecord ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHashRecord {
    /// Offset, in 512-byte sectors, of the hashed window inside its checkpoint.
    pub sector_offset: u16,
    pub hash:          CheckpointHash,
}

impl ChunkHashRecord {
    pub fn encode(&self, settings: &ChunkSettings) -> io::Result<Vec<u8>> {
        let expected = settings.small_hashes_per_checkpoint();
        if self.hash.small.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("record carries {} small hashes, expected {}", self.hash.small.len(), expected),
            ));
        }
        let mut buf = Vec::with_capacity(settings.record_size());
        buf.write_u16::<LittleEndian>(self.sector_offset)?;
        buf.write_all(&self.hash.strong)?;
        for h in &self.hash.small {
            buf.write_u32::<LittleEndian>(*h)?;
        }
        Ok(buf)
    }

    /// Decode one record.  All-zero bytes (a never-written slot) decode to `None`.
    pub fn decode(buf: &[u8], settings: &ChunkSettings) -> Option<Self> {
        if buf.len() != settings.record_size() || buf.iter().all(|&b| b == 0) {
            return None;
        }
        let mut r = Cursor::new(buf);
        let sector_offset = r.read_u16::<LittleEndian>().ok()?;
        let mut strong = [0u8; 16];
        r.read_exact(&mut strong).ok()?;
        let mut small = Vec::with_capacity(settings.small_hashes_per_checkpoint());
        for _ in 0..settings.small_hashes_per_checkpoint() {
            small.push(r.read_u32::<LittleEndian>().ok()?);
        }
        Some(Self { sector_offset, hash: CheckpointHash { strong, small } })
    }
}

// ── ChunkHashIndex ────────────────────────────────────────────────────────────

pub struct ChunkHashIndex {
    file:     File,
    path:     PathBuf,
    settings: ChunkSettings,
}

impl ChunkHashIndex {
    /// Open (creating if needed) an index file for read/write.
    pub fn open(path: &Path, settings: ChunkSettings) -> Result<Self, IndexError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| IndexError::Io { path: path.display().to_string(), source })?;
        Ok(Self { file, path: path.to_path_buf(), settings })
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record slot for a volume-relative byte position.
    pub fn record_index(&self, volume_pos: u64) -> u64 {
        volume_pos / self.settings.checkpoint_size
    }

    pub fn byte_offset(&self, record_index: u64) -> u64 {
        record_index * self.settings.record_size() as u64
    }

    /// Number of record slots the file currently spans (including absent ones).
    pub fn record_count(&self) -> Result<u64, IndexError> {
        let len = self.file.metadata().map_err(|e| self.io_err(e))?.len();
        Ok(len / self.settings.record_size() as u64)
    }

    /// Read one record.  Slots past end of file and all-zero slots are `None`.
    pub fn read_record(&mut self, record_index: u64) -> Result<Option<ChunkHashRecord>, IndexError> {
        let mut buf = vec![0u8; self.settings.record_size()];
        self.file
            .seek(SeekFrom::Start(self.byte_offset(record_index)))
            .map_err(|e| self.io_err(e))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => return Ok(None),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.io_err(e)),
            }
        }
        Ok(ChunkHashRecord::decode(&buf, &self.settings))
    }

    pub fn write_record(&mut self, record_index: u64, record: &ChunkHashRecord) -> Result<(), IndexError> {
        let expected = self.settings.small_hashes_per_checkpoint();
        if record.hash.small.len() != expected {
            return Err(IndexError::RecordShape {
                index: record_index,
                got: record.hash.small.len(),
                expected,
            });
        }
        let buf = record.encode(&self.settings).map_err(|e| self.io_err(e))?;
        self.file
            .seek(SeekFrom::Start(self.byte_offset(record_index)))
            .map_err(|e| self.io_err(e))?;
        self.file.write_all(&buf).map_err(|e| self.io_err(e))?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), IndexError> {
        self.file.sync_data().map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: io::Error) -> IndexError {
        IndexError::Io { path: self.path.display().to_string(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn record(settings: &ChunkSettings, seed: u32) -> ChunkHashRecord {
        ChunkHashRecord {
            sector_offset: 3,
            hash: CheckpointHash {
                strong: [seed as u8; 16],
                small:  (0..settings.small_hashes_per_checkpoint() as u32).map(|i| i ^ seed).collect(),
            },
        }
    }

    #[test]
    fn write_then_read_sparse_slots() {
        let tmp = NamedTempFile::new().unwrap();
        let s = ChunkSettings::default();
        let mut idx = ChunkHashIndex::open(tmp.path(), s).unwrap();

        let r = record(&s, 0x55);
        idx.write_record(4, &r).unwrap();
        assert_eq!(idx.record_count().unwrap(), 5);
        assert_eq!(idx.read_record(4).unwrap(), Some(r));
        // Slots before the written one are holes of zeros.
        assert_eq!(idx.read_record(0).unwrap(), None);
        assert_eq!(idx.read_record(3).unwrap(), None);
        // Past EOF.
        assert_eq!(idx.read_record(5).unwrap(), None);
    }

    #[test]
    fn layout_is_fixed() {
        let s = ChunkSettings::default();
        let r = record(&s, 1);
        let buf = r.encode(&s).unwrap();
        assert_eq!(buf.len(), 530);
        assert_eq!(&buf[0..2], &3u16.to_le_bytes());
        assert_eq!(&buf[2..18], &[1u8; 16]);
        assert_eq!(&buf[18..22], &1u32.to_le_bytes());

        let tmp = NamedTempFile::new().unwrap();
        let idx = ChunkHashIndex::open(tmp.path(), s).unwrap();
        assert_eq!(idx.byte_offset(7), 7 * 530);
        assert_eq!(idx.record_index(3 * 512 * 1024 + 17), 3);
    }

    #[test]
    fn rejects_wrong_record_shape() {
        let tmp = NamedTempFile::new().unwrap();
        let s = ChunkSettings::default();
        let mut idx = ChunkHashIndex::open(tmp.path(), s).unwrap();
        let bad = ChunkHashRecord { sector_offset: 0, hash: CheckpointHash { strong: [1; 16], small: vec![1] } };
        assert!(matches!(idx.write_record(0, &bad), Err(IndexError::RecordShape { .. })));
    }

    #[test]
    fn generation_snapshot_goes_stale() {
        let generation = IndexGeneration::new();
        let snap = generation.snapshot();
        assert!(snap.is_current());
        assert_eq!(generation.bump(), 1);
        assert!(!snap.is_current());
        assert!(generation.snapshot().is_current());
    }
}
