//! File permission utilities for restricting access to sensitive files.

use std::path::Path;

/// Set restrictive permissions (owner-only read/write) on a file.
///
/// On Unix systems this sets mode 0o600. On other platforms this is a no-op
/// since the permission model differs.
pub fn restrict_file_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}

/// Return the file's mode bits when they grant anything beyond owner
/// read/write, `None` when the file is private (or on non-Unix platforms).
pub fn broader_than_owner(path: &Path) -> std::io::Result<Option<u32>> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & !0o600 != 0 {
            return Ok(Some(mode));
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(None)
}
