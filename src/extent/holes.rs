//! Hole discovery on Linux through `SEEK_HOLE` / `SEEK_DATA`.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use super::{ExtentSource, SparseExtent};

/// Lazily walks the holes of an open file.
///
/// Holes are shrunk to `block_size` alignment so every reported extent covers
/// whole blocks; a hole running to end of file keeps the file size as its end.
/// Each step moves the descriptor's file offset, so readers of `file` must use
/// positional I/O.
pub struct HoleIterator<'a> {
    file:       &'a File,
    size:       i64,
    block_size: i64,
    pos:        i64,
}

impl<'a> HoleIterator<'a> {
    pub fn new(file: &'a File, block_size: u64) -> io::Result<Self> {
        let size = file.metadata()?.len() as i64;
        Ok(Self { file, size, block_size: block_size.max(1) as i64, pos: 0 })
    }

    fn seek(&self, from: i64, whence: libc::c_int) -> io::Result<Option<i64>> {
        // SAFETY: lseek only inspects the descriptor, which `self.file` keeps open.
        let r = unsafe { libc::lseek(self.file.as_raw_fd(), from as libc::off_t, whence) };
        if r < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(r as i64))
    }
}

impl<'a> ExtentSource for HoleIterator<'a> {
    fn next_extent(&mut self) -> io::Result<Option<SparseExtent>> {
        while self.pos < self.size {
            let hole_start = match self.seek(self.pos, libc::SEEK_HOLE)? {
                Some(p) if p < self.size => p,
                _ => {
                    self.pos = self.size;
                    return Ok(None);
                }
            };
            let hole_end = self.seek(hole_start, libc::SEEK_DATA)?.unwrap_or(self.size);
            self.pos = hole_end.max(hole_start + 1);

            let start = (hole_start + self.block_size - 1) / self.block_size * self.block_size;
            let end = if hole_end >= self.size {
                self.size
            } else {
                hole_end / self.block_size * self.block_size
            };
            if end > start {
                return Ok(Some(SparseExtent::new(start, end - start)));
            }
        }
        Ok(None)
    }
}
