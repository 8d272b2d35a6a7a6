//! Checkpoint geometry shared by the hasher, the index file and the transport.
//!
//! A file is hashed in *checkpoint windows*.  Each window carries one strong
//! digest (MD5) and one Adler-32 per *small block*.  The defaults match the
//! production wire format: 512 KiB windows split into 4 KiB small blocks,
//! which gives 128 small hashes and a 530-byte index record.
//!
//! # Record layout
//! ```text
//! [0..2)                 u16 LE   sector offset (512-byte units) inside the checkpoint
//! [2..18)                [u8;16]  strong hash
//! [18..18+4*n)           u32 LE   small hashes, n = checkpoint_size / small_block_size
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Strong (whole checkpoint) digest width in bytes.
pub const BIG_HASH_SIZE: usize = 16;
/// Default checkpoint window: 512 KiB.
pub const DEFAULT_CHECKPOINT_SIZE: u64 = 512 * 1024;
/// Default small block: 4 KiB.
pub const DEFAULT_SMALL_BLOCK_SIZE: u64 = 4 * 1024;
/// Granularity of the sector offset stored in every index record.
pub const SECTOR_SIZE: u64 = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GeometryError {
    #[error("small block size must be non-zero")]
    ZeroSmallBlock,
    #[error("checkpoint size {checkpoint} is not a multiple of small block size {small}")]
    Misaligned { checkpoint: u64, small: u64 },
    #[error("checkpoint size {0} is not a multiple of the {SECTOR_SIZE}-byte sector")]
    NotSectorAligned(u64),
    #[error("checkpoint size {0} does not fit a u16 sector offset")]
    TooLarge(u64),
}

/// Checkpoint/small-block geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub checkpoint_size:  u64,
    pub small_block_size: u64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            checkpoint_size:  DEFAULT_CHECKPOINT_SIZE,
            small_block_size: DEFAULT_SMALL_BLOCK_SIZE,
        }
    }
}

impl ChunkSettings {
    pub fn new(checkpoint_size: u64, small_block_size: u64) -> Result<Self, GeometryError> {
        let s = Self { checkpoint_size, small_block_size };
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.small_block_size == 0 {
            return Err(GeometryError::ZeroSmallBlock);
        }
        if self.checkpoint_size == 0 || self.checkpoint_size % self.small_block_size != 0 {
            return Err(GeometryError::Misaligned {
                checkpoint: self.checkpoint_size,
                small:      self.small_block_size,
            });
        }
        if self.checkpoint_size % SECTOR_SIZE != 0 {
            return Err(GeometryError::NotSectorAligned(self.checkpoint_size));
        }
        if self.checkpoint_size / SECTOR_SIZE > u16::MAX as u64 + 1 {
            return Err(GeometryError::TooLarge(self.checkpoint_size));
        }
        Ok(())
    }

    /// Small hashes carried by one checkpoint.
    pub fn small_hashes_per_checkpoint(&self) -> usize {
        (self.checkpoint_size / self.small_block_size) as usize
    }

    /// Strong hash plus all small hashes, without the sector offset.
    pub fn payload_size(&self) -> usize {
        BIG_HASH_SIZE + self.small_hashes_per_checkpoint() * 4
    }

    /// Size of one index record on disk.
    pub fn record_size(&self) -> usize {
        2 + self.payload_size()
    }

    /// Sector offset of `volume_pos` inside its checkpoint.
    pub fn sector_offset(&self, volume_pos: u64) -> u16 {
        ((volume_pos % self.checkpoint_size) / SECTOR_SIZE) as u16
    }
}
