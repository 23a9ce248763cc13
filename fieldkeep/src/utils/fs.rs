//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! keep persisted state files from being left half-written.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    ensure_dir_all(parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// The document is written to a sibling `.tmp` file first and renamed over
/// the target, so readers never observe a partial write.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path).await?;

    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");

    tokio::fs::write(&tmp_path, json)
        .await
        .map_err(|e| io_error("writing", &tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| io_error("renaming", path, e))?;

    Ok(())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub async fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("reading", path, e)),
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(&content)?))
}

/// Remove a directory tree; a missing directory is not an error.
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing directory", path, e)),
    }
}
