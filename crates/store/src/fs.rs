//! Atomic file primitives shared by the stores.
//!
//! A write lands in a `.swp` sibling first and is moved into place with a
//! single rename, so a reader observes either the previous document or
//! the new one, never a truncated mix.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::Result;

pub(crate) fn swap_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".swp");
    path.with_file_name(name)
}

/// Write `content` to `path` atomically.
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let swap = swap_path(path);
    fs::write(&swap, content).await?;
    fs::rename(&swap, path).await?;
    Ok(())
}

/// Serialize `value` as JSON and write it atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec(value)?;
    write_atomic(path, &content).await
}

/// Read and parse a JSON document, `None` if the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
