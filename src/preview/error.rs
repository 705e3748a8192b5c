//! Error taxonomy for the preview pipeline

use std::path::{Path, PathBuf};

/// Errors produced while generating a preview.
///
/// `Cancelled` is the normal outcome of a superseded request. It is never
/// shown to the user and never logged above `debug`.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decode: {0}")]
    Decode(String),

    #[error("cache write to {path:?} failed: {source}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl PreviewError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<image::ImageError> for PreviewError {
    fn from(err: image::ImageError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<zip::result::ZipError> for PreviewError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<calamine::Error> for PreviewError {
    fn from(err: calamine::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
