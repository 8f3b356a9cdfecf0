//! Build log blobs, addressed as `builds/{build_id}/{stream}`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }

    pub fn blob_key(self, build_id: i64) -> String {
        format!("builds/{build_id}/{}", self.as_str())
    }
}

/// Append-only log storage. Appending never truncates earlier output.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, build_id: i64, stream: LogStream, text: &str) -> StoreResult<()>;

    /// Read a whole stream; a stream never written reads as empty.
    async fn read(&self, build_id: i64, stream: LogStream) -> StoreResult<String>;
}

/// Log blobs as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsLogStore {
    root: PathBuf,
}

impl FsLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, build_id: i64, stream: LogStream) -> PathBuf {
        self.root.join(stream.blob_key(build_id))
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn append(&self, build_id: i64, stream: LogStream, text: &str) -> StoreResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        let path = self.path(build_id, stream);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, build_id: i64, stream: LogStream) -> StoreResult<String> {
        match tokio::fs::read(self.path(build_id, stream)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Log blobs kept in memory, keyed by blob key.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    blobs: Mutex<HashMap<String, String>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, build_id: i64, stream: LogStream, text: &str) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs
            .entry(stream.blob_key(build_id))
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn read(&self, build_id: i64, stream: LogStream) -> StoreResult<String> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(&stream.blob_key(build_id)).cloned().unwrap_or_default())
    }
}
