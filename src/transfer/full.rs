//! Whole-file downloads.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::QueueSettings;
use crate::permissions;

use super::queue::FullDownload;
use super::{with_hash_retries, FileClient, FileRequest, TransferCode, TransferError, WorkFile};

/// Attempts at `<name>_0 … <name>_99` when the destination cannot be opened.
pub const MAX_RENAME_ATTEMPTS: usize = 100;

// ── RenameLog ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RenameState {
    /// `(written_as, intended)` pairs, in order.
    queue:            Vec<(PathBuf, PathBuf)>,
    renamed:          HashSet<PathBuf>,
    metadata_mapping: HashMap<PathBuf, PathBuf>,
}

/// Files that had to be written under a different name because the intended
/// destination was busy.  The caller renames them once the restore is done.
#[derive(Debug, Default)]
pub struct RenameLog {
    inner: Mutex<RenameState>,
}

impl RenameLog {
    fn record(&self, written_as: &Path, intended: &Path) {
        let mut st = self.inner.lock();
        st.renamed.insert(written_as.to_path_buf());
        st.queue.push((written_as.to_path_buf(), intended.to_path_buf()));
        st.metadata_mapping.insert(intended.to_path_buf(), written_as.to_path_buf());
    }

    pub fn rename_queue(&self) -> Vec<(PathBuf, PathBuf)> {
        self.inner.lock().queue.clone()
    }

    pub fn is_renamed_file(&self, path: &Path) -> bool {
        self.inner.lock().renamed.contains(path)
    }

    /// Intended path → path the data was written to.
    pub fn metadata_path_mapping(&self) -> HashMap<PathBuf, PathBuf> {
        self.inner.lock().metadata_mapping.clone()
    }
}

fn suffixed(path: &Path, idx: usize) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(format!("_{idx}"));
    PathBuf::from(name)
}

// ── FullTransferStrategy ──────────────────────────────────────────────────────

pub struct FullTransferStrategy<C: FileClient> {
    client:              C,
    settings:            QueueSettings,
    renames:             Arc<RenameLog>,
    rename_on_collision: bool,
    client_token:        String,
}

impl<C: FileClient> FullTransferStrategy<C> {
    pub fn new(
        client: C,
        settings: QueueSettings,
        renames: Arc<RenameLog>,
        rename_on_collision: bool,
        client_token: impl Into<String>,
    ) -> Self {
        Self { client, settings, renames, rename_on_collision, client_token: client_token.into() }
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn into_client(self) -> C {
        self.client
    }

    pub fn inform_metadata_stream_end(&mut self) -> TransferCode {
        self.client.inform_metadata_stream_end(&self.client_token)
    }

    /// Open the destination, trying suffixed names if allowed.
    fn open_dest(&self, item: &mut FullDownload) -> Result<WorkFile, TransferError> {
        let first_err = match WorkFile::create(&item.dest_name) {
            Ok(f) => return Ok(f),
            Err(e) => e,
        };
        if self.rename_on_collision {
            let intended = item.dest_name.clone();
            for idx in 0..MAX_RENAME_ATTEMPTS {
                let candidate = suffixed(&intended, idx);
                if let Ok(f) = WorkFile::create(&candidate) {
                    info!(intended = %intended.display(), written_as = %candidate.display(), "destination busy, writing under new name");
                    self.renames.record(&candidate, &intended);
                    item.dest_name = candidate;
                    return Ok(f);
                }
            }
        }
        error!(
            path = %item.dest_name.display(),
            os_error = ?first_err.raw_os_error(),
            error = %first_err,
            "cannot open for writing"
        );
        Err(TransferError::Open { path: item.dest_name.clone(), source: first_err })
    }

    pub fn transfer(&mut self, mut item: FullDownload) -> Result<(), TransferError> {
        let mut dest = None;
        if !item.metadata_only {
            let file = match item.orig_file.take() {
                Some(f) => f,
                None => self.open_dest(&mut item)?,
            };
            if let Err(e) = permissions::set_admin_only(file.path()) {
                error!(path = %item.dest_name.display(), error = %e, "cannot change file permissions to admin only");
                return Err(TransferError::Permissions { path: item.dest_name.clone(), source: e });
            }
            dest = Some(file);
        }

        let req = FileRequest {
            remote_name:   &item.remote_name,
            file_id:       item.id + 1,
            metadata_only: item.metadata_only,
            folder_items:  item.folder_items,
            is_script:     item.is_script,
        };
        let client = &mut self.client;
        let code = with_hash_retries(
            self.settings.hash_retries,
            &mut dest,
            |dest| client.get_file(&req, dest.as_mut()),
            |code| *code,
            |dest| {
                if let Some(f) = dest.as_mut() {
                    if let Err(e) = f.seek_to(0) {
                        debug!(path = %f.path().display(), error = %e, "rewind before retry failed");
                    }
                }
            },
        );

        if !code.is_success() {
            error!(path = %item.dest_name.display(), %code, code_num = code.code(), "error loading file");
            return Err(TransferError::Transport { path: item.dest_name, code });
        }

        if item.is_script {
            let code = self.client.finish_script(&item.remote_name);
            if !code.is_success() {
                error!(remote = %item.remote_name, %code, code_num = code.code(), "error finishing script");
                return Err(TransferError::Transport { path: item.dest_name, code });
            }
        }
        debug!(id = item.id, path = %item.dest_name.display(), "downloaded");
        Ok(())
    }
}
