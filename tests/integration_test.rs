use ckptsync::config::{Config, QueueSettings};
use ckptsync::context::SyncContext;
use ckptsync::extent::{ExtentSource, FileExtent, SparseExtent, VecExtents};
use ckptsync::hash::{FileHash, HashSink, TreeHashSink};
use ckptsync::hasher::{ContentHasher, SourceFile, VdlCache};
use ckptsync::index::{ChunkHashIndex, IndexGeneration};
use ckptsync::settings::ChunkSettings;
use ckptsync::transfer::{
    ChunkedDownload, ChunkedFileClient, ChunkedOutcome, ChunkedRequest, ChunkedTransferStrategy, FileClient,
    FileRequest, FullDownload, FullTransferStrategy, RenameLog, TransferCode, TransferQueue, WorkFile,
};
use ckptsync::RestoreOrchestrator;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const CK: u64 = 16 * 1024;

fn geometry() -> ChunkSettings {
    ChunkSettings::new(CK, 2048).unwrap()
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// In-memory source with scripted holes and a contiguous volume mapping.
struct ImageFile {
    data:          Vec<u8>,
    holes:         Vec<SparseExtent>,
    volume_offset: Option<i64>,
    reads:         AtomicUsize,
}

impl ImageFile {
    fn new(data: Vec<u8>) -> Self {
        Self { data, holes: Vec::new(), volume_offset: None, reads: AtomicUsize::new(0) }
    }

    fn on_volume(data: Vec<u8>, volume_offset: i64) -> Self {
        Self { volume_offset: Some(volume_offset), ..Self::new(data) }
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl SourceFile for ImageFile {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let start = (pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn sparse_extents(&self, _block_size: u64) -> Box<dyn ExtentSource + '_> {
        Box::new(VecExtents::new(self.holes.clone()))
    }

    fn file_extents(&self, _start: u64, _block_size: u64) -> io::Result<(Vec<FileExtent>, bool)> {
        let extents = self
            .volume_offset
            .map(|v| vec![FileExtent { offset: 0, size: self.data.len() as i64, volume_offset: v, flags: 0 }])
            .unwrap_or_default();
        Ok((extents, false))
    }

    fn valid_data_length(&self, _cache: &mut VdlCache) -> i64 {
        self.data.len() as i64
    }
}

fn reference_hash(data: &[u8]) -> FileHash {
    let mut sink = TreeHashSink::new(geometry());
    sink.add_data(data, &mut |_| {});
    sink.finish()
}

fn hash_with(hasher: &mut ContentHasher, file: &mut ImageFile, cbt: bool) -> FileHash {
    let mut sink = TreeHashSink::new(geometry());
    hasher.hash(file, "image", &mut sink, cbt).unwrap();
    sink.finish()
}

fn noisy(len: usize, seed: u8) -> Vec<u8> {
    // Never zero, so no block is mistaken for a hole.
    (0..len).map(|i| (((i as u32).wrapping_mul(2_654_435_761) >> 24) as u8 ^ seed) | 1).collect()
}

/// Transport double: records every request, answers `Success`.
#[derive(Clone, Default)]
struct RecordingClient {
    calls:    Arc<Mutex<Vec<String>>>,
    informed: Arc<AtomicUsize>,
}

impl FileClient for RecordingClient {
    fn get_file(&mut self, req: &FileRequest<'_>, dest: Option<&mut WorkFile>) -> TransferCode {
        self.calls.lock().push(req.remote_name.to_string());
        if let Some(f) = dest {
            if f.write_all(req.remote_name.as_bytes()).is_err() {
                return TransferCode::Error;
            }
        }
        TransferCode::Success
    }

    fn inform_metadata_stream_end(&mut self, _client_token: &str) -> TransferCode {
        self.informed.fetch_add(1, Ordering::SeqCst);
        TransferCode::Success
    }

    fn finish_script(&mut self, _remote_name: &str) -> TransferCode {
        TransferCode::Success
    }

    fn shutdown(&mut self) {}
}

/// Chunked transport double that fills the destination and reports holes.
struct HoleyPatcher {
    extra_bytes: usize,
    holes:       Vec<SparseExtent>,
}

impl ChunkedFileClient for HoleyPatcher {
    fn get_file_chunked(&mut self, req: &ChunkedRequest<'_>, dest: &mut WorkFile, _hashes: &mut File) -> ChunkedOutcome {
        let len = req.predicted_size as usize + self.extra_bytes;
        if dest.seek(SeekFrom::Start(0)).is_err() || dest.write_all(&vec![0xC3u8; len]).is_err() {
            return ChunkedOutcome::new(TransferCode::Error);
        }
        ChunkedOutcome { code: TransferCode::Success, sparse_extents: Some(self.holes.clone()) }
    }
}

fn meta_item(id: u64, name: &str) -> FullDownload {
    FullDownload { metadata_only: true, ..FullDownload::new(id, name, name) }
}

fn strategies(
    client: RecordingClient,
    settings: &QueueSettings,
) -> (FullTransferStrategy<RecordingClient>, ChunkedTransferStrategy<HoleyPatcher>) {
    (
        FullTransferStrategy::new(client, settings.clone(), Arc::new(RenameLog::default()), false, "token"),
        ChunkedTransferStrategy::new(HoleyPatcher { extra_bytes: 0, holes: Vec::new() }, settings.clone()),
    )
}

// ── hashing ──────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn dense_files_match_sequential_reference(data in proptest::collection::vec(1u8..=255, 0..(5 * CK as usize))) {
        let mut file = ImageFile::new(data.clone());
        let out = hash_with(&mut ContentHasher::new(geometry()), &mut file, false);
        prop_assert_eq!(out, reference_hash(&data));
    }
}

#[test]
fn test_sparse_file_and_zero_file_hash_identically() {
    let dir = tempfile::tempdir().unwrap();
    let head = noisy(CK as usize, 0);
    let tail = noisy(CK as usize / 2, 7);

    // Holes left by seeking past the end.
    let sparse = dir.path().join("sparse");
    {
        let mut f = File::create(&sparse).unwrap();
        f.write_all(&head).unwrap();
        f.seek(SeekFrom::Start(4 * CK)).unwrap();
        f.write_all(&tail).unwrap();
    }
    // Same content with the zeros physically written.
    let dense = dir.path().join("dense");
    {
        let mut f = File::create(&dense).unwrap();
        f.write_all(&head).unwrap();
        f.write_all(&vec![0u8; 3 * CK as usize]).unwrap();
        f.write_all(&tail).unwrap();
    }

    let hash_path = |p: &std::path::Path| {
        let mut sink = TreeHashSink::new(geometry());
        ContentHasher::new(geometry()).hash_file(p, &mut sink, false).unwrap();
        sink.finish()
    };
    let a = hash_path(&sparse);
    let b = hash_path(&dense);
    assert_eq!(a, b);
    assert_eq!(a.sparse_runs, vec![SparseExtent::new(CK as i64, 3 * CK as i64)]);

    let mut logical = head.clone();
    logical.extend(vec![0u8; 3 * CK as usize]);
    logical.extend(&tail);
    assert_eq!(a.digest, reference_hash(&logical).digest);
}

#[test]
fn test_index_makes_second_run_cheap_and_identical() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("volume.idx");
    let generation = IndexGeneration::new();
    let data = noisy(6 * CK as usize + 321, 3);

    let run = |file: &mut ImageFile| {
        let index = ChunkHashIndex::open(&index_path, geometry()).unwrap();
        let mut hasher = ContentHasher::new(geometry()).with_index(index, generation.snapshot()).unwrap();
        let out = hash_with(&mut hasher, file, true);
        (out, hasher.stats())
    };

    let mut file = ImageFile::on_volume(data.clone(), 40 * CK as i64);
    let (first, first_stats) = run(&mut file);
    assert_eq!(first_stats.records_written, 6);

    let reads_before = file.reads();
    let (second, second_stats) = run(&mut file);
    assert_eq!(second.digest, first.digest);
    assert_eq!(second.digest, reference_hash(&data).digest);
    assert_eq!(second_stats.blocks_cached, 6);
    // Only the partial last block is read again.
    assert_eq!(file.reads() - reads_before, 1);
}

#[test]
fn test_generation_bump_forces_physical_reads() {
    let generation = IndexGeneration::new();
    let tmp = NamedTempFile::new().unwrap();
    let data = noisy(4 * CK as usize, 9);
    let mut file = ImageFile::on_volume(data.clone(), 0);

    let index = ChunkHashIndex::open(tmp.path(), geometry()).unwrap();
    let mut hasher = ContentHasher::new(geometry()).with_index(index, generation.snapshot()).unwrap();
    hash_with(&mut hasher, &mut file, true);

    generation.bump();
    let reads_before = file.reads();
    let out = hash_with(&mut hasher, &mut file, true);
    assert_eq!(hasher.stats().blocks_cached, 0);
    assert_eq!(file.reads() - reads_before, 4);
    assert_eq!(out.digest, reference_hash(&data).digest);
}

#[test]
fn test_context_builds_hasher_with_configured_geometry() {
    let config = Config { chunk: geometry(), ..Config::default() };
    let ctx = SyncContext::with_config(config);
    let tmp = NamedTempFile::new().unwrap();
    let index = ChunkHashIndex::open(tmp.path(), geometry()).unwrap();
    let hasher = ContentHasher::from_context(&ctx, Some(index)).unwrap();
    assert_eq!(*hasher.settings(), geometry());

    let wrong = ChunkHashIndex::open(tmp.path(), ChunkSettings::default()).unwrap();
    assert!(ContentHasher::from_context(&ctx, Some(wrong)).is_err());
}

// ── download queue ───────────────────────────────────────────────────────────

#[test]
fn test_skip_preempts_queued_items() {
    let settings = QueueSettings::default();
    let q = TransferQueue::new(settings.clone());
    q.enqueue_full(meta_item(10, "A"));
    q.enqueue_full(meta_item(11, "B"));
    q.enqueue_full(meta_item(12, "C"));
    q.queue_skip();
    q.queue_stop();

    let client = RecordingClient::default();
    let (mut full, mut chunked) = strategies(client.clone(), &settings);
    let outcome = q.run(&mut full, &mut chunked);

    assert!(client.calls.lock().is_empty());
    assert_eq!(q.failed_ids(), vec![10, 11, 12]);
    assert!(q.has_error());
    assert!(outcome.skipping);
    assert_eq!(client.informed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_waits_for_items_queued_after_it() {
    let settings = QueueSettings::default();
    let q = TransferQueue::new(settings.clone());
    q.enqueue_full(meta_item(1, "A"));
    q.queue_stop();
    q.enqueue_full(meta_item(2, "B"));

    let client = RecordingClient::default();
    let (mut full, mut chunked) = strategies(client.clone(), &settings);
    q.run(&mut full, &mut chunked);

    assert_eq!(*client.calls.lock(), vec!["A".to_string(), "B".to_string()]);
    assert!(!q.has_error());
    assert_eq!(client.informed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_producer_blocks_above_high_water_mark() {
    let settings = QueueSettings { high_water_mark: 3, poll_interval_ms: 50, ..QueueSettings::default() };
    let q = Arc::new(TransferQueue::new(settings.clone()));
    let done = Arc::new(AtomicUsize::new(0));

    let producer = {
        let q = Arc::clone(&q);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            for id in 0..6 {
                q.enqueue_full(meta_item(id, &format!("f{id}")));
                done.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    std::thread::sleep(Duration::from_millis(200));
    // The fourth push lifts the weight to 4 > 3 and has not returned.
    assert_eq!(done.load(Ordering::SeqCst), 3);
    assert_eq!(q.weight(), 4);

    let start = Instant::now();
    let consumer = {
        let q = Arc::clone(&q);
        let settings = settings.clone();
        std::thread::spawn(move || {
            let (mut full, mut chunked) = strategies(RecordingClient::default(), &settings);
            q.run(&mut full, &mut chunked)
        })
    };

    // Draining below the mark releases the producer on its next re-check.
    while done.load(Ordering::SeqCst) < 4 {
        assert!(start.elapsed() < Duration::from_secs(5), "producer never unblocked");
        std::thread::sleep(Duration::from_millis(1));
    }
    let woke_after = start.elapsed();
    assert!(
        woke_after < settings.poll_interval() * 3,
        "producer took {woke_after:?} to unblock, poll interval {:?}",
        settings.poll_interval()
    );

    while done.load(Ordering::SeqCst) < 6 {
        assert!(start.elapsed() < Duration::from_secs(5), "producer stalled");
        std::thread::sleep(Duration::from_millis(5));
    }
    producer.join().unwrap();
    q.queue_stop();
    let outcome = consumer.join().unwrap();
    assert_eq!(outcome.processed, 6);
    assert!(!q.has_error());
}

#[test]
fn test_chunked_transfer_reconstructs_holes() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("restored.bin");
    std::fs::write(&dest, vec![0x11u8; 100]).unwrap();

    let ctx = SyncContext::default();
    let patcher = HoleyPatcher {
        extra_bytes: 3000,
        holes:       vec![SparseExtent::new(0, 4096), SparseExtent::new(8192, 4096)],
    };
    let session = RestoreOrchestrator::start(&ctx, RecordingClient::default(), patcher, "token").unwrap();

    let mut hashes = NamedTempFile::new().unwrap();
    hashes.write_all(&[0u8; 64]).unwrap();
    let hashes_path = hashes.path().to_path_buf();
    session.enqueue_chunked(ChunkedDownload::new(0, "restored.bin", WorkFile::open_existing(&dest).unwrap(), hashes, 16384));

    let outcome = session.finish().unwrap();
    assert!(!outcome.has_error());

    let data = std::fs::read(&dest).unwrap();
    assert_eq!(data.len(), 16384);
    assert!(data[0..4096].iter().all(|&b| b == 0));
    assert!(data[4096..8192].iter().all(|&b| b == 0xC3));
    assert!(data[8192..12288].iter().all(|&b| b == 0));
    assert!(data[12288..].iter().all(|&b| b == 0xC3));
    assert!(!hashes_path.exists());
}

#[test]
fn test_orchestrator_reports_failures_and_informs_stream_end() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = SyncContext::default();
    let client = RecordingClient::default();
    let session = RestoreOrchestrator::start(
        &ctx,
        client.clone(),
        HoleyPatcher { extra_bytes: 0, holes: Vec::new() },
        "token",
    )
    .unwrap();

    session.enqueue_full(FullDownload::new(0, "one", dir.path().join("one")));
    session.enqueue_full(meta_item(1, "meta"));
    let outcome = session.finish().unwrap();

    assert!(!outcome.has_error());
    assert_eq!(outcome.run.processed, 2);
    assert_eq!(std::fs::read(dir.path().join("one")).unwrap(), b"one");
    assert_eq!(client.informed.load(Ordering::SeqCst), 1);
    assert!(outcome.rename_queue.is_empty());
}
