//! Utility functions for directory management and file writes
//!
//! # Directory Structure
//!
//! - State: `~/.local/state/hostprep/` - audit log (for root: `/root/.local/state/hostprep/`)

use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "hostprep", "hostprep")
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

pub fn ensure_state_dir() -> std::io::Result<Option<PathBuf>> {
    let Some(dir) = get_state_dir() else {
        return Ok(None);
    };

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(&dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(&dir)?;
    }

    Ok(Some(dir))
}

/// Replaces `path` with `contents` atomically.
///
/// 1. Writes to a temporary file in the same directory.
/// 2. Sets `mode` on it before any data is visible at `path`.
/// 3. Renames it over the target.
///
/// The parent directory is created if missing. Any previous file at `path` is
/// replaced without a backup.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// SHA-256 of `data` as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
