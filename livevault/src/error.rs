//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog error: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),

    #[error("resolver error: {0}")]
    Resolver(#[from] media_resolver::ResolverError),

    #[error("object store error: {0}")]
    Blob(#[from] blobstore::BlobError),

    #[error("capture error: {0}")]
    Capture(#[from] crate::capture::CaptureError),

    #[error("feed error: {0}")]
    Feed(#[from] crate::feeder::FeedError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}
