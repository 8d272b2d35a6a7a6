//! Patch downloads against an existing destination.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, error, warn};

use crate::config::QueueSettings;
use crate::extent::SparseExtent;

use super::queue::ChunkedDownload;
use super::{with_hash_retries, ChunkedFileClient, ChunkedOutcome, ChunkedRequest, TransferCode, TransferError, WorkFile};

pub struct ChunkedTransferStrategy<C: ChunkedFileClient> {
    client:   C,
    settings: QueueSettings,
}

impl<C: ChunkedFileClient> ChunkedTransferStrategy<C> {
    pub fn new(client: C, settings: QueueSettings) -> Self {
        Self { client, settings }
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn into_client(self) -> C {
        self.client
    }

    /// Fetch changed chunks into `item.orig_file`, reproduce the source's
    /// holes and cut stale trailing data.  The chunk hash file is deleted on
    /// every path out of here.
    pub fn transfer(&mut self, item: ChunkedDownload) -> Result<(), TransferError> {
        let ChunkedDownload { id, remote_name, dest_name, predicted_size, is_script, mut orig_file, mut chunkhashes, .. } =
            item;

        let req = ChunkedRequest { remote_name: &remote_name, file_id: id + 1, predicted_size, is_script };
        let client = &mut self.client;
        let mut files = (&mut orig_file, chunkhashes.as_file_mut());
        let outcome = with_hash_retries(
            self.settings.hash_retries,
            &mut files,
            |(dest, hashes)| client.get_file_chunked(&req, dest, hashes),
            |o: &ChunkedOutcome| o.code,
            |(dest, _)| {
                if let Err(e) = dest.seek_to(0) {
                    debug!(path = %dest.path().display(), error = %e, "rewind before retry failed");
                }
            },
        );

        let mut code = outcome.code;
        for extent in outcome.sparse_extents.iter().flatten() {
            if let Err(e) = self.apply_hole(&mut orig_file, extent) {
                error!(path = %orig_file.path().display(), error = %e, "error zeroing data after punching hole failed");
                code = TransferCode::Error;
            }
        }

        let size = orig_file.size();
        drop(orig_file);

        if code.is_success() {
            match size {
                Ok(size) if size > predicted_size => {
                    if let Err(e) = truncate(&dest_name, predicted_size) {
                        error!(
                            path = %dest_name.display(),
                            size = predicted_size,
                            os_error = ?e.raw_os_error(),
                            error = %e,
                            "error truncating file"
                        );
                        return Err(TransferError::Truncate { path: dest_name, size: predicted_size, source: e });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(path = %dest_name.display(), error = %e, "cannot read size of patched file");
                    return Err(TransferError::Io { path: dest_name, source: e });
                }
            }
            debug!(id, path = %dest_name.display(), "patched");
            return Ok(());
        }

        error!(path = %dest_name.display(), %code, code_num = code.code(), "error loading file");
        Err(TransferError::Transport { path: dest_name, code })
    }

    fn apply_hole(&self, file: &mut WorkFile, extent: &SparseExtent) -> Result<(), TransferError> {
        if extent.offset < 0 || extent.size <= 0 {
            warn!(offset = extent.offset, size = extent.size, "ignoring malformed sparse extent");
            return Ok(());
        }
        let (offset, len) = (extent.offset as u64, extent.size as u64);
        if self.settings.punch_holes && file.punch_hole(offset, len) {
            return Ok(());
        }
        zero_range(file, offset, len, self.settings.zero_buffer_size).map_err(|source| TransferError::Zeroing {
            path: file.path().to_path_buf(),
            offset,
            len,
            source,
        })
    }
}

/// Overwrite `[offset, offset + len)` with zeros, `buf_size` bytes at a time.
pub fn zero_range(file: &mut WorkFile, offset: u64, len: u64, buf_size: usize) -> io::Result<()> {
    let zeros = vec![0u8; buf_size.max(1)];
    file.seek_to(offset)?;
    let mut written = 0u64;
    while written < len {
        let n = (len - written).min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..n])?;
        written += n as u64;
    }
    Ok(())
}

fn truncate(path: &Path, size: u64) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(size)
}
