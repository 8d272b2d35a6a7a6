//! Checkpointed content hasher.
//!
//! Walks a file one checkpoint window at a time and decides per block
//! whether to skip it (sparse), reuse it (CBT says the volume blocks behind
//! it are unchanged and the index holds their hash) or read and hash it.
//! Whatever path a block takes, the [`HashSink`] sees a stream equivalent to
//! hashing every byte in order.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::config::ConfigError;
use crate::context::SyncContext;
use crate::extent::{ExtentSource, FileExtent, NoExtents, SparseExtentCursor};
use crate::hash::{zero_checkpoint, CheckpointHash, HashSink};
use crate::index::{ChunkHashIndex, ChunkHashRecord, GenerationSnapshot};
use crate::settings::ChunkSettings;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("cannot open {path}: {source}")]
    Open {
        path:   String,
        #[source]
        source: io::Error,
    },
    #[error("read error while hashing {name} at offset {pos}: {source}")]
    Read {
        name:   String,
        pos:    u64,
        #[source]
        source: io::Error,
    },
    #[error("index geometry {index:?} does not match hasher geometry {hasher:?}")]
    IndexGeometry { index: ChunkSettings, hasher: ChunkSettings },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

// ── SourceFile ────────────────────────────────────────────────────────────────

/// Per-volume valid-data-length cache, shared across the files of one run.
#[derive(Debug, Default)]
pub struct VdlCache {
    volumes: HashMap<String, i64>,
}

impl VdlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(&mut self, volume: &str, f: impl FnOnce() -> i64) -> i64 {
        *self.volumes.entry(volume.to_string()).or_insert_with(f)
    }
}

/// Everything the hasher needs from a file it hashes.
pub trait SourceFile {
    fn size(&self) -> u64;

    /// Positional read; `Ok(0)` means end of file.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Sparse regions in increasing offset order, aligned to `block_size`.
    fn sparse_extents(&self, block_size: u64) -> Box<dyn ExtentSource + '_>;

    /// File-to-volume mapping starting at `start`.  The flag is true when more
    /// extents follow the returned page.
    fn file_extents(&self, start: u64, block_size: u64) -> io::Result<(Vec<FileExtent>, bool)>;

    /// Valid data length, negative when unknown.
    fn valid_data_length(&self, cache: &mut VdlCache) -> i64;
}

/// A plain local file.  Sparse regions come from the filesystem; there is
/// no change-block-tracking data.
pub struct LocalSourceFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl LocalSourceFile {
    pub fn open(path: &Path) -> Result<Self, HashError> {
        let open_err = |source| HashError::Open { path: path.display().to_string(), source };
        let file = File::open(path).map_err(open_err)?;
        let size = file.metadata().map_err(open_err)?.len();
        Ok(Self { file, path: path.to_path_buf(), size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceFile for LocalSourceFile {
    fn size(&self) -> u64 {
        self.size
    }

    #[cfg(unix)]
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, pos)
    }

    #[cfg(windows)]
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, pos)
    }

    #[cfg(target_os = "linux")]
    fn sparse_extents(&self, block_size: u64) -> Box<dyn ExtentSource + '_> {
        match crate::extent::HoleIterator::new(&self.file, block_size) {
            Ok(it) => Box::new(it),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "hole detection unavailable");
                Box::new(NoExtents)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sparse_extents(&self, _block_size: u64) -> Box<dyn ExtentSource + '_> {
        Box::new(NoExtents)
    }

    fn file_extents(&self, _start: u64, _block_size: u64) -> io::Result<(Vec<FileExtent>, bool)> {
        Ok((Vec::new(), false))
    }

    fn valid_data_length(&self, _cache: &mut VdlCache) -> i64 {
        -1
    }
}

// ── ContentHasher ─────────────────────────────────────────────────────────────

/// Per-run counters, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashStats {
    /// Blocks physically read.
    pub blocks_read:     u64,
    /// Blocks skipped through sparse extents or zero detection.
    pub blocks_sparse:   u64,
    /// Blocks whose hash came from the index.
    pub blocks_cached:   u64,
    pub records_written: u64,
}

/// Where a CBT-eligible block lives in the index.
#[derive(Debug, Clone, Copy)]
struct IndexSlot {
    record: u64,
    sector: u16,
}

enum CbtLookup {
    /// Index says the block is all zero.
    Zero,
    Cached(ChunkHashRecord),
    /// No usable record, but the block may be recorded here after hashing.
    Slot(IndexSlot),
    Miss,
}

/// Paged walk over a file's volume mapping.
struct ExtentPager {
    extents:  Vec<FileExtent>,
    idx:      usize,
    has_more: bool,
}

impl ExtentPager {
    fn start(file: &dyn SourceFile, block_size: u64) -> Self {
        let (extents, has_more) = file.file_extents(0, block_size).unwrap_or_else(|e| {
            debug!(error = %e, "no file extents");
            (Vec::new(), false)
        });
        Self { extents, idx: 0, has_more }
    }

    fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Move past extents that end at or before `pos`, fetching the next page when
    /// the current one runs out.
    fn seek(&mut self, file: &dyn SourceFile, pos: u64, block_size: u64) -> Option<FileExtent> {
        while self.idx < self.extents.len() && self.extents[self.idx].end() <= pos as i64 {
            self.idx += 1;
            if self.idx >= self.extents.len() && self.has_more {
                match file.file_extents(pos, block_size) {
                    Ok((next, more)) => {
                        self.extents = next;
                        self.has_more = more;
                    }
                    Err(e) => {
                        debug!(pos, error = %e, "file extent paging failed");
                        self.extents.clear();
                        self.has_more = false;
                    }
                }
                self.idx = 0;
            }
        }
        self.extents.get(self.idx).copied()
    }
}

pub struct ContentHasher {
    settings:         ChunkSettings,
    index:            Option<ChunkHashIndex>,
    generation:       Option<GenerationSnapshot>,
    index_block_size: u64,
    vdl_cache:        Option<VdlCache>,
    stats:            HashStats,
}

impl ContentHasher {
    /// Hasher without an index: CBT requests are ignored.
    pub fn new(settings: ChunkSettings) -> Self {
        Self {
            settings,
            index: None,
            generation: None,
            index_block_size: crate::config::DEFAULT_INDEX_BLOCK_SIZE,
            vdl_cache: None,
            stats: HashStats::default(),
        }
    }

    /// Attach a checkpoint index.  `generation` must have been captured when
    /// this hasher's trust in the index was established.
    pub fn with_index(
        mut self,
        index: ChunkHashIndex,
        generation: GenerationSnapshot,
    ) -> Result<Self, HashError> {
        if *index.settings() != self.settings {
            return Err(HashError::IndexGeometry { index: *index.settings(), hasher: self.settings });
        }
        self.index = Some(index);
        self.generation = Some(generation);
        Ok(self)
    }

    pub fn with_index_block_size(mut self, block_size: u64) -> Self {
        self.index_block_size = block_size.max(1);
        self
    }

    /// Build from a context, capturing the current index generation.
    pub fn from_context(ctx: &SyncContext, index: Option<ChunkHashIndex>) -> Result<Self, HashError> {
        let config = ctx.config()?;
        let hasher = Self::new(config.chunk).with_index_block_size(config.index_block_size);
        match index {
            Some(index) => hasher.with_index(index, ctx.generation.snapshot()),
            None => Ok(hasher),
        }
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    /// Counters of the most recent `hash` call.
    pub fn stats(&self) -> HashStats {
        self.stats
    }

    pub fn into_index(self) -> Option<ChunkHashIndex> {
        self.index
    }

    pub fn hash_file(&mut self, path: &Path, sink: &mut dyn HashSink, with_cbt: bool) -> Result<(), HashError> {
        let mut file = LocalSourceFile::open(path)?;
        let name = path.display().to_string();
        self.hash(&mut file, &name, sink, with_cbt)
    }

    pub fn hash<F: SourceFile>(
        &mut self,
        file: &mut F,
        name: &str,
        sink: &mut dyn HashSink,
        with_cbt: bool,
    ) -> Result<(), HashError> {
        self.stats = HashStats::default();
        let file: &dyn SourceFile = &*file;
        let bsize = self.settings.checkpoint_size;
        let size = file.size();

        let mut sparse = SparseExtentCursor::new(file.sparse_extents(bsize));
        let mut buf = vec![0u8; bsize as usize];
        let mut skip_start: Option<u64> = None;

        let cbt = with_cbt && size > bsize && self.index.is_some() && self.generation.is_some();
        let mut pager = None;
        let mut max_vdl = size as i64;
        if cbt {
            pager = Some(ExtentPager::start(file, self.index_block_size));
            let cache = self.vdl_cache.get_or_insert_with(VdlCache::new);
            let vdl = file.valid_data_length(cache);
            if vdl >= 0 {
                max_vdl = vdl;
            }
        }

        let mut pos = 0u64;
        while pos < size {
            let block_len = bsize.min(size - pos);

            if sparse.covers(pos as i64, bsize as i64) {
                trace!(pos, "sparse extent");
                skip_start.get_or_insert(pos);
                self.stats.blocks_sparse += 1;
                pos += bsize;
                continue;
            }

            let mut slot = None;
            if let Some(pager) = pager.as_mut().filter(|p| !p.is_empty()) {
                if pos % bsize == 0 && block_len == bsize {
                    match self.lookup_cbt(file, pager, pos, max_vdl) {
                        CbtLookup::Zero => {
                            trace!(pos, "sparse extent from CBT data");
                            skip_start.get_or_insert(pos);
                            self.stats.blocks_sparse += 1;
                            pos += bsize;
                            continue;
                        }
                        CbtLookup::Cached(record) => {
                            trace!(pos, "hash data from CBT data");
                            flush_skip(sink, &mut skip_start, pos, size);
                            sink.add_checkpoint(&record.hash, bsize);
                            self.stats.blocks_cached += 1;
                            pos += bsize;
                            continue;
                        }
                        CbtLookup::Slot(s) => slot = Some(s),
                        CbtLookup::Miss => {}
                    }
                }
            }

            let block = &mut buf[..block_len as usize];
            if let Err(source) = read_full(file, pos, block) {
                error!(
                    file = name,
                    pos,
                    os_error = ?source.raw_os_error(),
                    error = %source,
                    "read error while hashing"
                );
                return Err(HashError::Read { name: name.to_string(), pos, source });
            }
            self.stats.blocks_read += 1;

            if block_len == bsize && block.iter().all(|&b| b == 0) {
                trace!(pos, "sparse extent (zeroes)");
                skip_start.get_or_insert(pos);
                self.stats.blocks_sparse += 1;
                if let Some(slot) = slot {
                    let zero = zero_checkpoint(&self.settings);
                    self.store_record(slot, &zero);
                }
                pos += bsize;
                continue;
            }

            flush_skip(sink, &mut skip_start, pos, size);

            let mut finished: Option<CheckpointHash> = None;
            sink.add_data(block, &mut |ck| finished = Some(ck.clone()));
            if let (Some(slot), Some(ck)) = (slot, finished) {
                self.store_record(slot, &ck);
            }
            pos += block_len;
        }

        flush_skip(sink, &mut skip_start, pos, size);
        debug!(file = name, size, stats = ?self.stats, "hashed");
        Ok(())
    }

    fn generation_current(&self) -> bool {
        self.generation.as_ref().map_or(false, |g| g.is_current())
    }

    fn lookup_cbt(&mut self, file: &dyn SourceFile, pager: &mut ExtentPager, pos: u64, max_vdl: i64) -> CbtLookup {
        let bsize = self.settings.checkpoint_size;
        let extent = match pager.seek(file, pos, self.index_block_size) {
            Some(e) if e.eligible_for(pos as i64, bsize as i64, max_vdl) => e,
            _ => return CbtLookup::Miss,
        };
        let volume_pos = extent.volume_pos(pos as i64) as u64;
        let slot = IndexSlot {
            record: volume_pos / bsize,
            sector: self.settings.sector_offset(volume_pos),
        };

        if !self.generation_current() {
            return CbtLookup::Miss;
        }
        let Some(index) = self.index.as_mut() else {
            return CbtLookup::Miss;
        };
        match index.read_record(slot.record) {
            Ok(Some(record)) if record.sector_offset == slot.sector => {
                if record.hash == *zero_checkpoint(&self.settings) {
                    CbtLookup::Zero
                } else {
                    CbtLookup::Cached(record)
                }
            }
            Ok(_) => CbtLookup::Slot(slot),
            Err(e) => {
                debug!(record = slot.record, error = %e, "index read failed");
                CbtLookup::Slot(slot)
            }
        }
    }

    fn store_record(&mut self, slot: IndexSlot, hash: &CheckpointHash) {
        if !self.generation_current() {
            return;
        }
        let Some(index) = self.index.as_mut() else {
            return;
        };
        let record = ChunkHashRecord { sector_offset: slot.sector, hash: hash.clone() };
        match index.write_record(slot.record, &record) {
            Ok(()) => self.stats.records_written += 1,
            Err(e) => warn!(record = slot.record, error = %e, "index write failed"),
        }
    }
}

fn flush_skip(sink: &mut dyn HashSink, skip_start: &mut Option<u64>, pos: u64, size: u64) {
    if let Some(start) = skip_start.take() {
        let end = pos.min(size);
        if end > start {
            sink.add_sparse_run(start, end - start);
        }
    }
}

fn read_full(file: &dyn SourceFile, pos: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(pos + filled as u64, &mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file ended after {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
