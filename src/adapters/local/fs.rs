//! Local storage: objects live under a root directory, sources may also be
//! fetched over HTTP(S).

use crate::ports::storage::{StorageError, StoragePort};
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: Option<String>,
    http: reqwest::Client,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Map an object reference onto a path below the root.
    fn resolve(&self, reference: &str) -> Result<PathBuf, StorageError> {
        let relative = reference
            .strip_prefix("file://")
            .unwrap_or(reference)
            .trim_start_matches('/');
        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(StorageError::Permanent(format!(
                "'{}' does not name an object below the storage root",
                reference
            )));
        }
        Ok(self.root.join(relative))
    }

    fn locator(&self, key: &str, path: &Path) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => {
                let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
                format!("file://{}", absolute.display())
            }
        }
    }

    async fn fetch(&self, url: &str, local_path: &Path) -> Result<(), StorageError> {
        let mut response = self.http.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.to_string()));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StorageError::Transient(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(StorageError::Permanent(format!("{} returned {}", url, status)));
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| io_error(local_path, e))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(local_path, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(local_path, e))?;
        debug!("Fetched {} bytes from {}", written, url);
        Ok(())
    }
}

fn request_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        StorageError::Transient(e.to_string())
    } else {
        StorageError::Permanent(e.to_string())
    }
}

fn io_error(path: &Path, e: io::Error) -> StorageError {
    let message = format!("{}: {}", path.display(), e);
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound(message),
        io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
            StorageError::Permanent(message)
        }
        _ => StorageError::Transient(message),
    }
}

#[async_trait]
impl StoragePort for LocalStorage {
    async fn download(&self, source_ref: &str, local_path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        if source_ref.starts_with("http://") || source_ref.starts_with("https://") {
            return self.fetch(source_ref, local_path).await;
        }

        let source = self.resolve(source_ref)?;
        tokio::fs::copy(&source, local_path)
            .await
            .map_err(|e| io_error(&source, e))?;
        debug!("Copied {} to {}", source.display(), local_path.display());
        Ok(())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, StorageError> {
        let destination = self.resolve(key)?;
        let parent = destination
            .parent()
            .ok_or_else(|| StorageError::Permanent(format!("invalid key '{}'", key)))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_error(&parent, e))?;

        // Readers never observe a half-written object.
        let staged = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| io_error(&parent, e))?
            .into_temp_path();
        tokio::fs::copy(local_path, &staged)
            .await
            .map_err(|e| io_error(local_path, e))?;
        staged
            .persist(&destination)
            .map_err(|e| io_error(&destination, e.error))?;

        let locator = self.locator(key, &destination);
        info!("Stored {} as {}", local_path.display(), locator);
        Ok(locator)
    }
}
