//! Weighted multi-producer / single-consumer download queue.
//!
//! Producers push items at the tail and block (by polling) while the
//! weighted size is above the high water mark.  One consumer drains the
//! queue through [`TransferQueue::run`].  `Skip` jumps to the head and fails
//! everything after it; `Quit` waits until everything before *and* after it
//! has drained.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;

use super::{
    ChunkedFileClient, ChunkedTransferStrategy, FileClient, FileMetadata, FullTransferStrategy,
    QueueCallback, QueuedChunked, QueuedFull, WorkFile,
};

// ── Items ─────────────────────────────────────────────────────────────────────

/// Request to download a whole file.
#[derive(Debug)]
pub struct FullDownload {
    pub id:             u64,
    pub remote_name:    String,
    pub dest_name:      PathBuf,
    pub predicted_size: u64,
    pub metadata:       FileMetadata,
    pub is_script:      bool,
    pub metadata_only:  bool,
    pub folder_items:   usize,
    /// Already opened destination; opened from `dest_name` when absent.
    pub orig_file:      Option<WorkFile>,
    /// Claimed by the transport's look-ahead.
    pub queued:         bool,
}

impl FullDownload {
    pub fn new(id: u64, remote_name: impl Into<String>, dest_name: impl Into<PathBuf>) -> Self {
        Self {
            id,
            remote_name:    remote_name.into(),
            dest_name:      dest_name.into(),
            predicted_size: 0,
            metadata:       FileMetadata::default(),
            is_script:      false,
            metadata_only:  false,
            folder_items:   0,
            orig_file:      None,
            queued:         false,
        }
    }
}

/// Request to patch an existing file with changed chunks only.
#[derive(Debug)]
pub struct ChunkedDownload {
    pub id:             u64,
    pub remote_name:    String,
    pub dest_name:      PathBuf,
    pub predicted_size: u64,
    pub metadata:       FileMetadata,
    pub is_script:      bool,
    pub orig_file:      WorkFile,
    /// Checkpoint hashes of `orig_file`; deleted when the item is dropped.
    pub chunkhashes:    NamedTempFile,
    pub queued:         bool,
}

impl ChunkedDownload {
    pub fn new(
        id: u64,
        remote_name: impl Into<String>,
        orig_file: WorkFile,
        chunkhashes: NamedTempFile,
        predicted_size: u64,
    ) -> Self {
        Self {
            id,
            remote_name: remote_name.into(),
            dest_name: orig_file.path().to_path_buf(),
            predicted_size,
            metadata: FileMetadata::default(),
            is_script: false,
            orig_file,
            chunkhashes,
            queued: false,
        }
    }
}

#[derive(Debug)]
pub enum QueueItem {
    Full(FullDownload),
    Chunked(ChunkedDownload),
    Skip,
    Quit,
}

impl QueueItem {
    pub fn id(&self) -> Option<u64> {
        match self {
            QueueItem::Full(d)    => Some(d.id),
            QueueItem::Chunked(d) => Some(d.id),
            _                     => None,
        }
    }

    fn weight(&self, settings: &QueueSettings) -> usize {
        match self {
            QueueItem::Full(_)    => settings.full_weight,
            QueueItem::Chunked(_) => settings.chunked_weight,
            _                     => 0,
        }
    }
}

// ── TransferQueue ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    items:    VecDeque<QueueItem>,
    weight:   usize,
    failed:   Vec<u64>,
    skipping: bool,
    offline:  bool,
}

/// How the consumer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub processed: usize,
    pub failed:    usize,
    pub offline:   bool,
    pub skipping:  bool,
}

pub struct TransferQueue {
    state:    Mutex<State>,
    cond:     Condvar,
    settings: QueueSettings,
}

impl TransferQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self { state: Mutex::new(State::default()), cond: Condvar::new(), settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn enqueue_full(&self, item: FullDownload) {
        self.push_back(QueueItem::Full(item));
    }

    pub fn enqueue_chunked(&self, item: ChunkedDownload) {
        self.push_back(QueueItem::Chunked(item));
    }

    /// Fail everything still queued and everything queued later.
    pub fn queue_skip(&self) {
        let mut st = self.state.lock();
        st.items.push_front(QueueItem::Skip);
        self.cond.notify_one();
    }

    /// Stop the consumer once the queue has fully drained.
    pub fn queue_stop(&self) {
        let mut st = self.state.lock();
        st.items.push_back(QueueItem::Quit);
        self.cond.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Current weighted size.
    pub fn weight(&self) -> usize {
        self.state.lock().weight
    }

    pub fn has_error(&self) -> bool {
        !self.state.lock().failed.is_empty()
    }

    /// Ids of failed items in the order they failed.
    pub fn failed_ids(&self) -> Vec<u64> {
        self.state.lock().failed.clone()
    }

    pub fn is_offline(&self) -> bool {
        self.state.lock().offline
    }

    pub fn is_skipping(&self) -> bool {
        self.state.lock().skipping
    }

    fn push_back(&self, item: QueueItem) {
        let weight = item.weight(&self.settings);
        let mut st = self.state.lock();
        st.items.push_back(item);
        self.cond.notify_one();
        st.weight += weight;
        self.wait_below_mark(&mut st);
    }

    fn wait_below_mark(&self, st: &mut MutexGuard<'_, State>) {
        if st.weight > self.settings.high_water_mark {
            debug!(weight = st.weight, mark = self.settings.high_water_mark, "download queue full");
        }
        while st.weight > self.settings.high_water_mark {
            MutexGuard::unlocked(st, || thread::sleep(self.settings.poll_interval()));
        }
    }

    fn pop(&self) -> QueueItem {
        let mut st = self.state.lock();
        loop {
            if let Some(item) = st.items.pop_front() {
                let weight = item.weight(&self.settings);
                st.weight = st.weight.saturating_sub(weight);
                return item;
            }
            self.cond.wait(&mut st);
        }
    }

    /// Consumer loop.  Returns after a `Quit` found the queue empty.
    pub fn run<F: FileClient, C: ChunkedFileClient>(
        &self,
        full: &mut FullTransferStrategy<F>,
        chunked: &mut ChunkedTransferStrategy<C>,
    ) -> RunOutcome {
        let mut processed = 0;
        loop {
            let item = self.pop();
            let id = match &item {
                QueueItem::Quit => {
                    let mut st = self.state.lock();
                    if st.items.iter().all(|i| matches!(i, QueueItem::Quit)) {
                        st.items.clear();
                        break;
                    }
                    st.items.push_back(QueueItem::Quit);
                    continue;
                }
                QueueItem::Skip => {
                    info!("skipping remaining downloads");
                    self.state.lock().skipping = true;
                    continue;
                }
                QueueItem::Full(d)    => d.id,
                QueueItem::Chunked(d) => d.id,
            };

            {
                let mut st = self.state.lock();
                if st.offline || st.skipping {
                    debug!(id, offline = st.offline, "download not attempted");
                    st.failed.push(id);
                    // Dropping the item closes its handles and deletes its chunk hashes.
                    drop(st);
                    drop(item);
                    continue;
                }
            }

            let result = match item {
                QueueItem::Full(d)    => full.transfer(d),
                QueueItem::Chunked(d) => chunked.transfer(d),
                QueueItem::Skip | QueueItem::Quit => continue,
            };
            processed += 1;

            if let Err(e) = result {
                error!(id, error = %e, "download failed, treating transport as offline");
                let mut st = self.state.lock();
                st.failed.push(id);
                st.offline = true;
            }
        }

        let (offline, skipping, failed) = {
            let st = self.state.lock();
            (st.offline, st.skipping, st.failed.len())
        };
        if !offline && !skipping {
            let code = full.inform_metadata_stream_end();
            if !code.is_success() {
                warn!(%code, code_num = code.code(), "error informing client about metadata stream end");
            }
        }
        RunOutcome { processed, failed, offline, skipping }
    }

    fn scan_mut<T>(&self, mut f: impl FnMut(&mut QueueItem) -> Option<T>) -> Option<T> {
        let mut st = self.state.lock();
        st.items.iter_mut().find_map(|item| f(item))
    }
}

impl QueueCallback for TransferQueue {
    fn next_queued_full(&self) -> Option<QueuedFull> {
        self.scan_mut(|item| match item {
            QueueItem::Full(d) if !d.queued => {
                d.queued = true;
                Some(QueuedFull {
                    remote_name:   d.remote_name.clone(),
                    metadata_only: d.metadata_only,
                    folder_items:  d.folder_items,
                    file_id:       d.id + 1,
                })
            }
            _ => None,
        })
    }

    fn unqueue_full(&self, remote_name: &str) {
        self.scan_mut(|item| match item {
            QueueItem::Full(d) if d.queued && d.remote_name == remote_name => {
                d.queued = false;
                Some(())
            }
            _ => None,
        });
    }

    fn reset_queue_full(&self) {
        let mut st = self.state.lock();
        for item in st.items.iter_mut() {
            if let QueueItem::Full(d) = item {
                d.queued = false;
            }
        }
    }

    fn next_queued_chunked(&self) -> Option<QueuedChunked> {
        self.scan_mut(|item| match item {
            QueueItem::Chunked(d) if !d.queued && d.predicted_size > 0 => {
                d.queued = true;
                Some(QueuedChunked {
                    remote_name:    d.remote_name.clone(),
                    dest_path:      d.orig_file.path().to_path_buf(),
                    chunkhashes:    d.chunkhashes.path().to_path_buf(),
                    predicted_size: d.predicted_size,
                    file_id:        d.id + 1,
                })
            }
            _ => None,
        })
    }

    fn unqueue_chunked(&self, remote_name: &str) {
        self.scan_mut(|item| match item {
            QueueItem::Chunked(d) if d.queued && d.remote_name == remote_name => {
                d.queued = false;
                Some(())
            }
            _ => None,
        });
    }

    fn reset_queue_chunked(&self) {
        let mut st = self.state.lock();
        for item in st.items.iter_mut() {
            if let QueueItem::Chunked(d) = item {
                d.queued = false;
            }
        }
    }
}
