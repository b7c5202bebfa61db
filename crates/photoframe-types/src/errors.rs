use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = PhotoframeError> = std::result::Result<T, E>;

/// Unified error type covering common failure scenarios across subsystems.
#[derive(Debug, Error)]
pub enum PhotoframeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("unsupported image format: {path:?}")]
    UnsupportedFormat { path: PathBuf },
    #[error("must start with chunk 0")]
    Sequence,
    #[error("no photos found in bucket {bucket}")]
    NoContent { bucket: String },
    #[error("n out of range (0-{last}): {index}", last = .total.saturating_sub(1))]
    Range { index: i64, total: usize },
    #[error("raster for {width}x{height} must be {expected} bytes, got {actual}")]
    RasterSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("unknown bucket {bucket}")]
    UnknownBucket { bucket: String },
    #[error("invalid image name {name:?}")]
    InvalidImageName { name: String },
    #[error("no image {name} in bucket {bucket}")]
    ImageNotFound { bucket: String, name: String },
    #[error("photo library i/o error: {0}")]
    LibraryIo(String),
    #[error("cache i/o error: {0}")]
    CacheIo(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhotoframeError {
    /// Errors that exclude a source image from selection instead of failing the server.
    pub fn is_image_rejection(&self) -> bool {
        matches!(
            self,
            PhotoframeError::Decode { .. } | PhotoframeError::UnsupportedFormat { .. }
        )
    }
}
