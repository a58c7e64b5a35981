//! Privilege checks
//!
//! hostprep never elevates on its own: it must be started as root
//! (`sudo hostprep`). The check runs before any step so an unprivileged run
//! leaves the host untouched.

use crate::core::error::{Error, Result};
use std::path::Path;

/// Returns whether the effective user is root.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Fails with [`Error::Privilege`] unless `is_root` is true.
///
/// Takes the answer as a parameter so callers decide how it is obtained.
pub fn ensure_root(is_root: bool) -> Result<()> {
    if is_root { Ok(()) } else { Err(Error::Privilege) }
}

/// Checks if a binary exists in PATH, or at `name` if it contains a slash
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Returns the tools from `names` that cannot be found.
pub fn missing_binaries<'a>(names: &[&'a str]) -> Vec<&'a str> {
    names
        .iter()
        .copied()
        .filter(|name| !binary_exists(name))
        .collect()
}
