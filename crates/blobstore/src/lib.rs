//! Object storage for finished and in-flight captures.
//!
//! One narrow seam: stream a reader into a keyed object, or put a small
//! blob (remuxer log, thumbnail). Every object is stored with an `inline`
//! content disposition so browsers render it instead of downloading. The
//! production implementation is an S3-compatible bucket; tests use the
//! in-memory store.

use async_trait::async_trait;
use parking_lot::Mutex;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

const INLINE_DISPOSITION: &str = "inline";

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("invalid object-store credentials: {reason}")]
    Credentials { reason: String },

    #[error("object store rejected the request with HTTP {status}")]
    UploadStatus { status: u16 },

    #[error("object store error: {source}")]
    S3 {
        #[from]
        source: S3Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl BlobError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Credentials { .. } => false,
            Self::UploadStatus { status } => *status >= 500 || *status == 429,
            Self::S3 { source } => match source {
                S3Error::HttpFailWithBody(status, _) => *status >= 500 || *status == 429,
                _ => true,
            },
            Self::Io { .. } => true,
        }
    }
}

/// Streaming upload seam. `put_stream` completes only once the reader
/// returns EOF, which is what lets a capture pipeline upload an object
/// that is still growing at the tail.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<u64, BlobError>;

    async fn put_bytes(&self, key: &str, data: &[u8], content_type: &str)
    -> Result<(), BlobError>;
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub key_id: String,
    pub application_key: String,
    /// Attempts for small-object puts; streamed uploads are single-shot
    /// because the reader cannot be rewound.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl S3Config {
    pub fn new(
        bucket: impl Into<String>,
        endpoint: impl Into<String>,
        region: impl Into<String>,
        key_id: impl Into<String>,
        application_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: endpoint.into(),
            region: region.into(),
            key_id: key_id.into(),
            application_key: application_key.into(),
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// S3-compatible bucket client (path-style addressing, custom endpoint).
/// The `Content-Disposition: inline` header rides on every put.
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    config: S3Config,
}

impl S3BlobStore {
    pub fn new(config: S3Config) -> Result<Self, BlobError> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };
        let credentials = Credentials::new(
            Some(&config.key_id),
            Some(&config.application_key),
            None,
            None,
            None,
        )
        .map_err(|e| BlobError::Credentials {
            reason: e.to_string(),
        })?;
        let mut bucket = Bucket::new(&config.bucket, region, credentials)?.with_path_style();
        bucket.add_header("Content-Disposition", INLINE_DISPOSITION);
        Ok(Self { bucket, config })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_stream(
        &self,
        key: &str,
        mut reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<u64, BlobError> {
        let response = self
            .bucket
            .put_object_stream_with_content_type(&mut reader, key, content_type)
            .await?;
        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(BlobError::UploadStatus { status });
        }
        let uploaded = response.uploaded_bytes() as u64;
        info!(key, bytes = uploaded, "uploaded object");
        Ok(uploaded)
    }

    async fn put_bytes(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), BlobError> {
        let mut attempt = 0;
        loop {
            let result = self
                .bucket
                .put_object_with_content_type(key, data, content_type)
                .await
                .map_err(BlobError::from)
                .and_then(|response| {
                    let status = response.status_code();
                    if (200..300).contains(&status) {
                        Ok(())
                    } else {
                        Err(BlobError::UploadStatus { status })
                    }
                });

            match result {
                Ok(()) => {
                    info!(key, bytes = data.len(), "uploaded object");
                    return Ok(());
                }
                Err(error) if error.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(key, attempt, %error, "object upload failed, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    content_type: String,
    disposition: String,
    data: Vec<u8>,
}

/// In-memory store for tests and local runs. Mirrors the production
/// client's header behavior so tests can pin the contract.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).map(|o| o.data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|o| o.content_type.clone())
    }

    pub fn content_disposition(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|o| o.disposition.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn store(&self, key: &str, content_type: &str, data: Vec<u8>) {
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                disposition: INLINE_DISPOSITION.to_string(),
                data,
            },
        );
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_stream(
        &self,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
    ) -> Result<u64, BlobError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        self.store(key, content_type, data);
        Ok(len)
    }

    async fn put_bytes(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), BlobError> {
        self.store(key, content_type, data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_completes_stream_uploads_on_eof() {
        let store = MemoryBlobStore::new();
        let (mut writer, mut reader) = tokio::io::duplex(16);

        let upload = tokio::spawn(async move {
            let store = store;
            let uploaded = store
                .put_stream("abc.mp4", &mut reader, "video/mp4")
                .await
                .unwrap();
            (store, uploaded)
        });

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"growing object")
            .await
            .unwrap();
        drop(writer);

        let (store, uploaded) = upload.await.unwrap();
        assert_eq!(uploaded, 14);
        assert_eq!(store.object("abc.mp4").unwrap(), b"growing object");
        assert_eq!(store.content_type("abc.mp4").unwrap(), "video/mp4");
        assert_eq!(store.content_disposition("abc.mp4").unwrap(), "inline");
    }

    #[tokio::test]
    async fn small_objects_carry_the_inline_disposition_too() {
        let store = MemoryBlobStore::new();
        store
            .put_bytes("abc.log", b"line", "text/plain")
            .await
            .unwrap();
        assert_eq!(store.content_disposition("abc.log").unwrap(), "inline");
        assert_eq!(store.content_type("abc.log").unwrap(), "text/plain");
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!BlobError::UploadStatus { status: 403 }.is_retryable());
        assert!(BlobError::UploadStatus { status: 503 }.is_retryable());
        assert!(BlobError::UploadStatus { status: 429 }.is_retryable());
    }
}
