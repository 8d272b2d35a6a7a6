//! One restore session: a download queue plus the thread that drains it.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::context::SyncContext;
use crate::transfer::{
    ChunkedDownload, ChunkedFileClient, ChunkedTransferStrategy, FileClient, FullDownload, FullTransferStrategy,
    QueueCallback, RenameLog, RunOutcome, TransferQueue,
};

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot start download thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("download thread panicked")]
    ConsumerPanicked,
}

/// What a finished session reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub run:                   RunOutcome,
    pub failed_ids:            Vec<u64>,
    /// `(written_as, intended)` pairs the caller still has to rename.
    pub rename_queue:          Vec<(PathBuf, PathBuf)>,
    pub metadata_path_mapping: HashMap<PathBuf, PathBuf>,
}

impl RestoreOutcome {
    pub fn has_error(&self) -> bool {
        !self.failed_ids.is_empty()
    }
}

pub struct RestoreOrchestrator {
    queue:    Arc<TransferQueue>,
    renames:  Arc<RenameLog>,
    consumer: Option<JoinHandle<RunOutcome>>,
}

impl RestoreOrchestrator {
    /// Wire both transports to a fresh queue and start the consumer thread.
    pub fn start<F, C>(
        ctx: &SyncContext,
        mut full_client: F,
        mut chunked_client: C,
        client_token: &str,
    ) -> Result<Self, RestoreError>
    where
        F: FileClient + 'static,
        C: ChunkedFileClient + 'static,
    {
        let config = ctx.config()?;
        let queue = Arc::new(TransferQueue::new(config.queue.clone()));
        let renames = Arc::new(RenameLog::default());

        let callback: Arc<dyn QueueCallback> = queue.clone();
        full_client.set_queue_callback(Arc::clone(&callback));
        chunked_client.set_queue_callback(callback);

        let mut full = FullTransferStrategy::new(
            full_client,
            config.queue.clone(),
            Arc::clone(&renames),
            config.rename_on_collision,
            client_token,
        );
        let mut chunked = ChunkedTransferStrategy::new(chunked_client, config.queue.clone());

        let consumer_queue = Arc::clone(&queue);
        let consumer = thread::Builder::new()
            .name("restore-download".into())
            .spawn(move || {
                let outcome = consumer_queue.run(&mut full, &mut chunked);
                full.client_mut().shutdown();
                outcome
            })
            .map_err(RestoreError::Spawn)?;

        info!(token = client_token, "restore download thread started");
        Ok(Self { queue, renames, consumer: Some(consumer) })
    }

    pub fn queue(&self) -> &Arc<TransferQueue> {
        &self.queue
    }

    pub fn enqueue_full(&self, item: FullDownload) {
        self.queue.enqueue_full(item);
    }

    pub fn enqueue_chunked(&self, item: ChunkedDownload) {
        self.queue.enqueue_chunked(item);
    }

    pub fn skip_remaining(&self) {
        self.queue.queue_skip();
    }

    pub fn is_renamed_file(&self, path: &Path) -> bool {
        self.renames.is_renamed_file(path)
    }

    pub fn has_error(&self) -> bool {
        self.queue.has_error()
    }

    /// Let the queue drain, stop the consumer and collect the results.
    pub fn finish(mut self) -> Result<RestoreOutcome, RestoreError> {
        self.queue.queue_stop();
        let run = match self.consumer.take() {
            Some(handle) => handle.join().map_err(|_| RestoreError::ConsumerPanicked)?,
            None => return Err(RestoreError::ConsumerPanicked),
        };
        let outcome = RestoreOutcome {
            run,
            failed_ids:            self.queue.failed_ids(),
            rename_queue:          self.renames.rename_queue(),
            metadata_path_mapping: self.renames.metadata_path_mapping(),
        };
        if outcome.has_error() {
            warn!(failed = outcome.failed_ids.len(), "restore finished with errors");
        } else {
            info!(processed = outcome.run.processed, "restore finished");
        }
        Ok(outcome)
    }
}

impl Drop for RestoreOrchestrator {
    /// An unfinished session fails whatever is still queued.
    fn drop(&mut self) {
        if let Some(handle) = self.consumer.take() {
            self.queue.queue_skip();
            self.queue.queue_stop();
            if handle.join().is_err() {
                warn!("download thread panicked during shutdown");
            }
        }
    }
}
