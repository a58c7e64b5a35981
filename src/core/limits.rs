//! Open-file limits in `/etc/security/limits.conf`

use crate::core::error::Result;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub const DEFAULT_LIMITS_PATH: &str = "/etc/security/limits.conf";

/// Soft and hard `nofile` limit for all users
pub const NOFILE_LIMIT: u32 = 65535;

/// The two lines raising the open-file limit
pub fn nofile_lines(limit: u32) -> [String; 2] {
    [
        format!("* soft nofile {limit}"),
        format!("* hard nofile {limit}"),
    ]
}

/// Appends the `nofile` lines to `path`, skipping any line already present.
///
/// A missing file is created. Returns how many lines were appended.
pub async fn raise_nofile(path: &Path, limit: u32) -> Result<usize> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let missing: Vec<String> = nofile_lines(limit)
        .into_iter()
        .filter(|line| !existing.lines().any(|l| l.trim() == line))
        .collect();

    if missing.is_empty() {
        info!("{} already raises nofile to {limit}", path.display());
        return Ok(0);
    }

    let mut chunk = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        chunk.push('\n');
    }
    for line in &missing {
        chunk.push_str(line);
        chunk.push('\n');
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(chunk.as_bytes()).await?;
    file.sync_all().await?;

    info!("Appended {} line(s) to {}", missing.len(), path.display());
    Ok(missing.len())
}
