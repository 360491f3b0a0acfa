//! Collaborators the ingest workers call out to: date extraction, thumbnails
//! and embeddings. Each one is a trait so tests and alternative backends can
//! be swapped in.

pub mod metadata;
pub mod thumbnails;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::{DateSource, PhotoId};
use crate::scanner::Fingerprint;

pub use metadata::ExifDateExtractor;
pub use thumbnails::ImageThumbnailer;

/// Best-effort capture date. Never fails: falls back to `mtime`.
pub trait DateExtractor: Send + Sync {
    fn extract_date(&self, path: &Path, mtime: DateTime<Utc>) -> (DateTime<Utc>, DateSource);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailHandle {
    pub path: PathBuf,
    /// Dimensions of the original image.
    pub width: u32,
    pub height: u32,
}

#[derive(Error, Debug)]
pub enum ThumbnailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot decode image: {0}")]
    Decode(String),
}

impl ThumbnailError {
    pub fn is_transient(&self) -> bool {
        match self {
            ThumbnailError::Io(e) => is_transient_io(e),
            ThumbnailError::Decode(_) => false,
        }
    }
}

pub trait Thumbnailer: Send + Sync {
    /// Produce (or reuse) the cached thumbnail for this photo id and fingerprint.
    fn generate(
        &self,
        photo_id: PhotoId,
        fingerprint: &Fingerprint,
        path: &Path,
    ) -> Result<ThumbnailHandle, ThumbnailError>;

    /// Drop every cached thumbnail for a photo.
    fn evict(&self, photo_id: PhotoId);
}

#[derive(Error, Debug)]
pub enum EmbedError {
    /// No model is loaded; content search stays off system-wide.
    #[error("Embedding model unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        match self {
            EmbedError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Black-box model mapping an image to a fixed-length vector.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed(&self, path: &Path) -> Result<Vec<f32>, EmbedError>;
}

/// Errors worth retrying: the file may be briefly locked or the device slow.
pub fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
