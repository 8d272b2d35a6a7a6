//! Access restriction for files that are still being written.

use std::io;
use std::path::Path;

/// Owner-only mode for partially restored files.
pub const ADMIN_ONLY_MODE: u32 = 0o600;

/// Restrict `path` to its owner until the restore has finished with it.
#[cfg(unix)]
pub fn set_admin_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(ADMIN_ONLY_MODE))
}

/// ACL editing is not supported here; the file keeps the inherited ACL.
#[cfg(not(unix))]
pub fn set_admin_only(path: &Path) -> io::Result<()> {
    tracing::debug!(path = %path.display(), "admin-only permissions not applied on this platform");
    Ok(())
}
