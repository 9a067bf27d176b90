//! Error types shared across the gallery core.

use std::path::PathBuf;

use thiserror::Error;

use crate::library::AuthorizationStatus;

/// Terminal failure of one image request.
///
/// Cloned into every subscriber of a delivery channel, so it carries
/// rendered messages rather than source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("image request was cancelled")]
    Cancelled,

    #[error("asset is unavailable: {path:?}")]
    Unavailable { path: PathBuf },

    #[error("failed to decode {path:?}: {message}")]
    Decode { path: PathBuf, message: String },
}

impl ImageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImageError::Cancelled)
    }
}

/// Errors surfaced to callers of the library-facing operations.
#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("photo library access not granted ({0:?})")]
    AuthorizationDenied(AuthorizationStatus),

    #[error("unknown album: {0}")]
    UnknownAlbum(String),

    #[error(transparent)]
    Library(#[from] anyhow::Error),
}

pub type GalleryResult<T> = std::result::Result<T, GalleryError>;
