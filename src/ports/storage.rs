use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Worth retrying: network resets, throttling, timeouts.
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage object not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Download the object referenced by `source_ref` to a local path
    async fn download(&self, source_ref: &str, local_path: &Path) -> Result<(), StorageError>;

    /// Upload a local file under `key`, returning a locator callers can use to fetch it
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, StorageError>;
}
