//! Restore download plumbing.
//!
//! The queue and its two strategies talk to the network only through the
//! [`FileClient`] and [`ChunkedFileClient`] traits; destination files move
//! through the queue as owned [`WorkFile`] handles.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extent::SparseExtent;

pub mod chunked;
pub mod full;
pub mod queue;

pub use chunked::ChunkedTransferStrategy;
pub use full::{FullTransferStrategy, RenameLog};
pub use queue::{ChunkedDownload, FullDownload, QueueItem, RunOutcome, TransferQueue};

// ── TransferCode ──────────────────────────────────────────────────────────────

/// Result of one transport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferCode {
    Success,
    /// Received data did not match its hash; the request may be repeated.
    HashMismatch,
    ConnectionLost,
    Timeout,
    RemoteError,
    Error,
}

impl TransferCode {
    /// Stable numeric code used in log lines.
    pub fn code(self) -> u32 {
        match self {
            TransferCode::Success        => 0,
            TransferCode::Timeout        => 1,
            TransferCode::ConnectionLost => 2,
            TransferCode::RemoteError    => 3,
            TransferCode::HashMismatch   => 4,
            TransferCode::Error          => 5,
        }
    }

    pub fn is_success(self) -> bool {
        self == TransferCode::Success
    }

    pub fn is_retryable(self) -> bool {
        self == TransferCode::HashMismatch
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferCode::Success        => "success",
            TransferCode::HashMismatch   => "hash mismatch",
            TransferCode::ConnectionLost => "connection lost",
            TransferCode::Timeout        => "timeout",
            TransferCode::RemoteError    => "remote error",
            TransferCode::Error          => "error",
        };
        f.write_str(s)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("cannot open {path} for writing: {source}")]
    Open {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot restrict permissions of {path}: {source}")]
    Permissions {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("error loading {path}: {code} (code: {})", .code.code())]
    Transport { path: PathBuf, code: TransferCode },
    #[error("error zeroing {len} bytes at {offset} in {path}: {source}")]
    Zeroing {
        path:   PathBuf,
        offset: u64,
        len:    u64,
        #[source]
        source: io::Error,
    },
    #[error("error truncating {path} to {size}: {source}")]
    Truncate {
        path:   PathBuf,
        size:   u64,
        #[source]
        source: io::Error,
    },
    #[error("IO error on {path}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
}

// ── FileMetadata ──────────────────────────────────────────────────────────────

/// Attributes restored alongside a file.  Applying them is up to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    pub mode:        Option<u32>,
    pub modified:    Option<i64>,
    pub created:     Option<i64>,
    pub accessed:    Option<i64>,
    /// Path on the machine the backup was taken from.
    pub orig_path:   Option<String>,
    pub extra:       BTreeMap<String, String>,
}

// ── WorkFile ──────────────────────────────────────────────────────────────────

/// Owned read/write handle on a destination file.  Dropping it closes the file.
#[derive(Debug)]
pub struct WorkFile {
    file: File,
    path: PathBuf,
}

impl WorkFile {
    /// Create or truncate `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Open an existing file for patching in place.
    pub fn open_existing(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek_to(&mut self, pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Deallocate `[offset, offset + len)` without changing the file size.
    /// Returns `false` when the filesystem or platform cannot do it.
    #[cfg(target_os = "linux")]
    pub fn punch_hole(&self, offset: u64, len: u64) -> bool {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor stays open for the duration of the call.
        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc != 0 {
            tracing::debug!(
                path = %self.path.display(),
                offset,
                len,
                error = %io::Error::last_os_error(),
                "punching hole failed"
            );
        }
        rc == 0
    }

    #[cfg(not(target_os = "linux"))]
    pub fn punch_hole(&self, _offset: u64, _len: u64) -> bool {
        false
    }
}

impl Read for WorkFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for WorkFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for WorkFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

// ── Transport seam ────────────────────────────────────────────────────────────

/// Parameters of a whole-file request.
#[derive(Debug, Clone, Copy)]
pub struct FileRequest<'a> {
    pub remote_name:   &'a str,
    /// Id as sent on the wire (queue id + 1).
    pub file_id:       u64,
    pub metadata_only: bool,
    pub folder_items:  usize,
    pub is_script:     bool,
}

/// Parameters of a patch request against an existing file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedRequest<'a> {
    pub remote_name:    &'a str,
    pub file_id:        u64,
    pub predicted_size: u64,
    pub is_script:      bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedOutcome {
    pub code:           TransferCode,
    /// Holes of the source that the destination must reproduce.
    pub sparse_extents: Option<Vec<SparseExtent>>,
}

impl ChunkedOutcome {
    pub fn new(code: TransferCode) -> Self {
        Self { code, sparse_extents: None }
    }
}

/// Whole-file transport.
pub trait FileClient: Send {
    /// Download `req.remote_name` into `dest`; `dest` is `None` for
    /// metadata-only requests.
    fn get_file(&mut self, req: &FileRequest<'_>, dest: Option<&mut WorkFile>) -> TransferCode;

    /// Tell the peer no more metadata will be requested in this session.
    fn inform_metadata_stream_end(&mut self, client_token: &str) -> TransferCode;

    fn finish_script(&mut self, remote_name: &str) -> TransferCode;

    fn shutdown(&mut self);

    /// Let the transport look ahead in the queue to pipeline requests.
    fn set_queue_callback(&mut self, _callback: Arc<dyn QueueCallback>) {}
}

/// Patch transport: sends `chunkhashes` for the existing destination and
/// receives only changed data.
pub trait ChunkedFileClient: Send {
    fn get_file_chunked(
        &mut self,
        req: &ChunkedRequest<'_>,
        dest: &mut WorkFile,
        chunkhashes: &mut File,
    ) -> ChunkedOutcome;

    fn set_queue_callback(&mut self, _callback: Arc<dyn QueueCallback>) {}
}

// ── Queue look-ahead ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFull {
    pub remote_name:   String,
    pub metadata_only: bool,
    pub folder_items:  usize,
    pub file_id:       u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedChunked {
    pub remote_name:    String,
    pub dest_path:      PathBuf,
    pub chunkhashes:    PathBuf,
    pub predicted_size: u64,
    pub file_id:        u64,
}

/// Peer lookup into items that are queued but not yet being processed.
///
/// Claimed items stay in the queue; the flag only hides them from further
/// `next_*` calls until they are unqueued or reset.
pub trait QueueCallback: Send + Sync {
    fn next_queued_full(&self) -> Option<QueuedFull>;
    fn unqueue_full(&self, remote_name: &str);
    fn reset_queue_full(&self);

    /// Only items with a positive predicted size are offered.
    fn next_queued_chunked(&self) -> Option<QueuedChunked>;
    fn unqueue_chunked(&self, remote_name: &str);
    fn reset_queue_chunked(&self);
}

/// Run `attempt` once and repeat it while it reports a hash mismatch, at most
/// `retries` more times.  `rewind` runs before every repeat.
pub(crate) fn with_hash_retries<S: ?Sized, T>(
    retries: u32,
    state: &mut S,
    mut attempt: impl FnMut(&mut S) -> T,
    code_of: impl Fn(&T) -> TransferCode,
    mut rewind: impl FnMut(&mut S),
) -> T {
    let mut result = attempt(state);
    let mut left = retries;
    while code_of(&result).is_retryable() && left > 0 {
        tracing::debug!(retries_left = left, "hash mismatch, retrying");
        rewind(state);
        result = attempt(state);
        left -= 1;
    }
    result
}
