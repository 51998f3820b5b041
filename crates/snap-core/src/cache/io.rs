//! Filesystem layer of the response cache.
//!
//! Entries live at `<dir>/<fp[0..2]>/<fp>.json`. Writes go to a temp file
//! first and are renamed into place so a reader never sees half an entry.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;

use crate::errors::{SnapError, SnapResult};

use super::CacheEntry;

pub(crate) fn entry_path(dir: &Path, fingerprint: &str) -> PathBuf {
    let shard = fingerprint.get(..2).unwrap_or("xx");
    dir.join(shard).join(format!("{fingerprint}.json"))
}

pub(crate) async fn write_atomic(path: &Path, content: &str) -> SnapResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| SnapError::cache(format!("failed to create cache directory: {}", e)))?;
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .await
        .map_err(|e| SnapError::cache(format!("failed to write temp file: {}", e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| SnapError::cache(format!("failed to rename temp file: {}", e)))?;
    Ok(())
}

/// Read one entry. Missing files are `None`; unparseable files are logged
/// and treated as missing so the next store overwrites them.
pub(crate) async fn read_entry(path: &Path) -> SnapResult<Option<CacheEntry>> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SnapError::cache(format!(
                "failed to read cache entry {}: {}",
                path.display(),
                e
            )))
        }
    };
    match serde_json::from_str(&content) {
        Ok(entry) => Ok(Some(entry)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt cache entry");
            Ok(None)
        }
    }
}

pub(crate) async fn remove_entry(path: &Path) -> SnapResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SnapError::cache(format!(
            "failed to remove cache entry {}: {}",
            path.display(),
            e
        ))),
    }
}

/// All entry files under `dir` (two levels: shard directory, entry file).
pub(crate) async fn list_entries(dir: &Path) -> SnapResult<Vec<PathBuf>> {
    let mut result = Vec::new();
    if !dir.exists() {
        return Ok(result);
    }

    let read_err = |e: std::io::Error| SnapError::cache(format!("failed to read cache directory: {}", e));
    let mut shards = fs::read_dir(dir).await.map_err(read_err)?;
    while let Some(shard) = shards.next_entry().await.map_err(read_err)? {
        let shard_path = shard.path();
        if !shard_path.is_dir() {
            continue;
        }
        let mut files = fs::read_dir(&shard_path).await.map_err(read_err)?;
        while let Some(file) = files.next_entry().await.map_err(read_err)? {
            let path = file.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                result.push(path);
            }
        }
    }
    Ok(result)
}
