//! Two-level checkpoint hashing.
//!
//! Every checkpoint window gets an MD5 over its bytes plus one Adler-32 per
//! small block.  The whole-file digest is MD5 over the sequence of checkpoint
//! payloads (`strong ‖ small hashes LE`), so a window can be contributed in
//! three equivalent ways:
//!
//! 1. raw bytes through [`HashSink::add_data`],
//! 2. a sparse run through [`HashSink::add_sparse_run`] (all-zero content),
//! 3. a cached payload through [`HashSink::add_checkpoint`].
//!
//! All three produce the same digest for the same logical content.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::extent::SparseExtent;
use crate::settings::{ChunkSettings, BIG_HASH_SIZE};

mod adler;
pub use adler::{adler32, ADLER32_INIT};

// ── CheckpointHash ────────────────────────────────────────────────────────────

/// Strong hash plus small-block checksums of one checkpoint window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHash {
    pub strong: [u8; BIG_HASH_SIZE],
    pub small:  Vec<u32>,
}

impl CheckpointHash {
    /// Payload bytes as stored in the index (without sector offset).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BIG_HASH_SIZE + self.small.len() * 4);
        out.extend_from_slice(&self.strong);
        for h in &self.small {
            out.extend_from_slice(&h.to_le_bytes());
        }
        out
    }

    /// Parse a payload; `None` when the length is not `16 + 4*k`.
    pub fn from_payload(buf: &[u8]) -> Option<Self> {
        if buf.len() < BIG_HASH_SIZE || (buf.len() - BIG_HASH_SIZE) % 4 != 0 {
            return None;
        }
        let mut strong = [0u8; BIG_HASH_SIZE];
        strong.copy_from_slice(&buf[..BIG_HASH_SIZE]);
        let small = buf[BIG_HASH_SIZE..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { strong, small })
    }
}

static ZERO_CHECKPOINTS: OnceLock<Mutex<HashMap<ChunkSettings, Arc<CheckpointHash>>>> = OnceLock::new();

/// Hash of a checkpoint window that is entirely zero.
///
/// Computed on first use for each geometry and kept for the process lifetime.
pub fn zero_checkpoint(settings: &ChunkSettings) -> Arc<CheckpointHash> {
    let map = ZERO_CHECKPOINTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = map.lock();
    Arc::clone(map.entry(*settings).or_insert_with(|| Arc::new(build_zero_checkpoint(settings))))
}

fn build_zero_checkpoint(settings: &ChunkSettings) -> CheckpointHash {
    let zeros = vec![0u8; settings.small_block_size as usize];
    let small_hash = adler32(ADLER32_INIT, &zeros);
    let n = settings.small_hashes_per_checkpoint();
    let mut md5 = Md5::new();
    for _ in 0..n {
        md5.update(&zeros);
    }
    CheckpointHash { strong: md5_bytes(md5), small: vec![small_hash; n] }
}

fn md5_bytes(md5: Md5) -> [u8; BIG_HASH_SIZE] {
    let mut out = [0u8; BIG_HASH_SIZE];
    out.copy_from_slice(&md5.finalize());
    out
}

// ── HashSink ──────────────────────────────────────────────────────────────────

/// Consumer of the hasher's output stream.
pub trait HashSink {
    /// Hash raw bytes.  Every checkpoint window completed by this call is
    /// reported to `on_checkpoint` in order.
    fn add_data(&mut self, data: &[u8], on_checkpoint: &mut dyn FnMut(&CheckpointHash));

    /// `len` bytes starting at `offset` are logically zero.
    fn add_sparse_run(&mut self, offset: u64, len: u64);

    /// A whole checkpoint window of `len` bytes, taken from a cache instead
    /// of being read.
    fn add_checkpoint(&mut self, hash: &CheckpointHash, len: u64);
}

// ── TreeHashSink ──────────────────────────────────────────────────────────────

/// Finished whole-file hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    pub digest:      [u8; BIG_HASH_SIZE],
    pub size:        u64,
    pub checkpoints: Vec<CheckpointHash>,
    pub sparse_runs: Vec<SparseExtent>,
}

impl FileHash {
    pub fn hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Serialise the checkpoint list as consecutive payloads, i.e. the
    /// `chunkhashes` stream a chunked transfer sends ahead of the data.
    pub fn write_chunkhashes<W: Write>(&self, mut w: W) -> io::Result<()> {
        for ck in &self.checkpoints {
            w.write_all(&ck.to_payload())?;
        }
        w.flush()
    }
}

/// Reference sink: builds checkpoint hashes and the whole-file digest.
pub struct TreeHashSink {
    settings:    ChunkSettings,
    window:      Md5,
    window_fill: u64,
    small:       Vec<u32>,
    small_hash:  u32,
    small_fill:  u64,
    pos:         u64,
    file:        Md5,
    checkpoints: Vec<CheckpointHash>,
    sparse_runs: Vec<SparseExtent>,
}

impl TreeHashSink {
    pub fn new(settings: ChunkSettings) -> Self {
        Self {
            settings,
            window:      Md5::new(),
            window_fill: 0,
            small:       Vec::with_capacity(settings.small_hashes_per_checkpoint()),
            small_hash:  ADLER32_INIT,
            small_fill:  0,
            pos:         0,
            file:        Md5::new(),
            checkpoints: Vec::new(),
            sparse_runs: Vec::new(),
        }
    }

    fn push_checkpoint(&mut self, ck: CheckpointHash) {
        self.file.update(ck.to_payload());
        self.checkpoints.push(ck);
    }

    fn close_window(&mut self) -> CheckpointHash {
        if self.small_fill > 0 {
            self.small.push(self.small_hash);
            self.small_hash = ADLER32_INIT;
            self.small_fill = 0;
        }
        let mut strong = [0u8; BIG_HASH_SIZE];
        strong.copy_from_slice(&self.window.finalize_reset());
        self.window_fill = 0;
        CheckpointHash { strong, small: std::mem::take(&mut self.small) }
    }

    fn feed_zeros(&mut self, mut len: u64) {
        let zeros = vec![0u8; self.settings.small_block_size as usize];
        while len > 0 {
            let n = len.min(zeros.len() as u64) as usize;
            self.add_data(&zeros[..n], &mut |_| {});
            len -= n as u64;
        }
    }

    pub fn finish(mut self) -> FileHash {
        if self.window_fill > 0 {
            let ck = self.close_window();
            self.push_checkpoint(ck);
        }
        FileHash {
            digest:      md5_bytes(self.file),
            size:        self.pos,
            checkpoints: self.checkpoints,
            sparse_runs: self.sparse_runs,
        }
    }
}

impl HashSink for TreeHashSink {
    fn add_data(&mut self, mut data: &[u8], on_checkpoint: &mut dyn FnMut(&CheckpointHash)) {
        let small = self.settings.small_block_size;
        while !data.is_empty() {
            let take = ((small - self.small_fill) as usize).min(data.len());
            let (head, rest) = data.split_at(take);
            self.window.update(head);
            self.small_hash = adler32(self.small_hash, head);
            self.small_fill += take as u64;
            self.window_fill += take as u64;
            self.pos += take as u64;
            data = rest;

            if self.small_fill == small {
                self.small.push(self.small_hash);
                self.small_hash = ADLER32_INIT;
                self.small_fill = 0;
            }
            if self.window_fill == self.settings.checkpoint_size {
                let ck = self.close_window();
                on_checkpoint(&ck);
                self.push_checkpoint(ck);
            }
        }
    }

    fn add_sparse_run(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        self.sparse_runs.push(SparseExtent::new(offset as i64, len as i64));

        let checkpoint = self.settings.checkpoint_size;
        let mut remaining = len;
        if self.window_fill == 0 {
            let zero = zero_checkpoint(&self.settings);
            while remaining >= checkpoint {
                self.push_checkpoint((*zero).clone());
                self.pos += checkpoint;
                remaining -= checkpoint;
            }
        }
        self.feed_zeros(remaining);
    }

    fn add_checkpoint(&mut self, hash: &CheckpointHash, len: u64) {
        debug_assert_eq!(self.window_fill, 0, "cached checkpoint must start on a window boundary");
        self.push_checkpoint(hash.clone());
        self.pos += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> ChunkSettings {
        ChunkSettings::new(8192, 1024).unwrap()
    }

    fn hash_all(settings: ChunkSettings, data: &[u8]) -> FileHash {
        let mut sink = TreeHashSink::new(settings);
        sink.add_data(data, &mut |_| {});
        sink.finish()
    }

    #[test]
    fn zero_checkpoint_matches_hashed_zeros() {
        let s = small_settings();
        let mut sink = TreeHashSink::new(s);
        let mut seen = Vec::new();
        sink.add_data(&vec![0u8; 8192], &mut |ck| seen.push(ck.clone()));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], *zero_checkpoint(&s));
        assert!(Arc::ptr_eq(&zero_checkpoint(&s), &zero_checkpoint(&s)));
    }

    #[test]
    fn sparse_run_equals_zero_bytes() {
        let s = small_settings();
        let mut data = vec![7u8; 8192];
        data.extend(vec![0u8; 3 * 8192]);
        data.extend(vec![9u8; 100]);
        let reference = hash_all(s, &data);

        let mut sink = TreeHashSink::new(s);
        sink.add_data(&data[..8192], &mut |_| {});
        sink.add_sparse_run(8192, 3 * 8192);
        sink.add_data(&data[4 * 8192..], &mut |_| {});
        let sparse = sink.finish();

        assert_eq!(sparse.digest, reference.digest);
        assert_eq!(sparse.checkpoints, reference.checkpoints);
        assert_eq!(sparse.sparse_runs, vec![SparseExtent::new(8192, 3 * 8192)]);
        assert_eq!(sparse.size, data.len() as u64);
    }

    #[test]
    fn cached_checkpoint_equals_data() {
        let s = small_settings();
        let data: Vec<u8> = (0..2 * 8192u32).map(|i| (i * 31 % 251) as u8).collect();
        let reference = hash_all(s, &data);

        let mut sink = TreeHashSink::new(s);
        sink.add_checkpoint(&reference.checkpoints[0], 8192);
        sink.add_data(&data[8192..], &mut |_| {});
        assert_eq!(sink.finish().digest, reference.digest);
    }

    #[test]
    fn split_feeding_is_irrelevant() {
        let s = small_settings();
        let data: Vec<u8> = (0..20000u32).map(|i| (i % 253) as u8).collect();
        let whole = hash_all(s, &data);
        let mut sink = TreeHashSink::new(s);
        for chunk in data.chunks(777) {
            sink.add_data(chunk, &mut |_| {});
        }
        assert_eq!(sink.finish(), whole);
        // Last window is partial: 20000 - 2*8192 = 3616 bytes → 4 small hashes.
        assert_eq!(whole.checkpoints.len(), 3);
        assert_eq!(whole.checkpoints[2].small.len(), 4);
    }

    #[test]
    fn payload_parse() {
        let ck = CheckpointHash { strong: [3u8; 16], small: vec![1, 2, 0xDEADBEEF] };
        let payload = ck.to_payload();
        assert_eq!(payload.len(), 28);
        assert_eq!(&payload[16..20], &1u32.to_le_bytes());
        assert_eq!(CheckpointHash::from_payload(&payload), Some(ck));
        assert_eq!(CheckpointHash::from_payload(&payload[..17]), None);
    }

    #[test]
    fn chunkhashes_stream_is_concatenated_payloads() {
        let s = small_settings();
        let h = hash_all(s, &vec![1u8; 8192 + 10]);
        let mut out = Vec::new();
        h.write_chunkhashes(&mut out).unwrap();
        assert_eq!(out.len(), s.payload_size() + 16 + 4);
    }
}
