use crate::ports::storage::{StorageError, StoragePort};
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// S3Storage implements StoragePort for AWS S3.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Build a client from the ambient AWS configuration.
    pub async fn from_env(bucket: String) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config), bucket)
    }
}

/// Split `s3://bucket/key` references; bare keys use the default bucket.
fn split_reference<'a>(default_bucket: &'a str, reference: &'a str) -> (&'a str, &'a str) {
    match reference.strip_prefix("s3://") {
        Some(rest) => match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        },
        None => (default_bucket, reference.trim_start_matches('/')),
    }
}

fn classify<E>(err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Transient(message)
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let code = context.err().code().unwrap_or_default();
            if status == 404 || matches!(code, "NoSuchKey" | "NotFound" | "NoSuchBucket") {
                StorageError::NotFound(message)
            } else if status >= 500 || matches!(code, "SlowDown" | "RequestTimeout") {
                StorageError::Transient(message)
            } else {
                StorageError::Permanent(message)
            }
        }
        _ => StorageError::Permanent(message),
    }
}

#[async_trait]
impl StoragePort for S3Storage {
    async fn download(&self, source_ref: &str, local_path: &Path) -> Result<(), StorageError> {
        let (bucket, key) = split_reference(&self.bucket, source_ref);
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        let io_err = |e: std::io::Error| StorageError::Transient(format!("{}: {}", local_path.display(), e));
        let mut file = tokio::fs::File::create(local_path).await.map_err(io_err)?;
        let mut body = resp.body;
        while let Some(bytes) = body
            .try_next()
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?
        {
            file.write_all(&bytes).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        debug!("Downloaded s3://{}/{}", bucket, key);
        Ok(())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, StorageError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Permanent(format!("{}: {}", local_path.display(), e)))?;
        let content_type = match local_path.extension().and_then(|e| e.to_str()) {
            Some("webm") => "video/webm",
            _ => "video/mp4",
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let locator = format!("s3://{}/{}", self.bucket, key);
        info!("Uploaded {}", locator);
        Ok(locator)
    }
}
