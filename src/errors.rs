use crate::backends::BackendError;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors surfaced to the caller of the snapshot uploader.
#[derive(Debug, Error)]
pub enum UploaderError {
    #[error("object key `{0}` is not a safe relative path")]
    InvalidObjectKey(String),

    #[error("{kind} `{value}` is not a valid path segment")]
    InvalidIdentifier { kind: &'static str, value: String },

    /// A backend failure other than "absent" while freshening.
    #[error("{operation} failed for `{path}`: {source}")]
    Backend {
        operation: &'static str,
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("upload of `{path}` failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: BackendError,
    },

    #[error("interrupted while waiting for {operation}")]
    Interrupted { operation: &'static str },

    #[error("cannot read local file `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UploaderError {
    /// Whether retrying the whole object may succeed.
    ///
    /// Interruption is never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploaderError::Backend { source, .. } | UploaderError::Upload { source, .. } => {
                source.is_retryable()
            }
            UploaderError::InvalidObjectKey(_)
            | UploaderError::InvalidIdentifier { .. }
            | UploaderError::Interrupted { .. }
            | UploaderError::Io { .. } => false,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, UploaderError::Interrupted { .. })
    }
}

pub type UploaderResult<T> = Result<T, UploaderError>;

/// Failure of the best-effort stale upload cleanup. Logged, never returned
/// from session teardown.
#[derive(Debug, Error)]
pub enum CleanupFailure {
    #[error("listing multipart uploads under `{prefix}` failed: {source}")]
    Listing {
        prefix: String,
        #[source]
        source: BackendError,
    },

    #[error("multipart cleanup interrupted")]
    Interrupted,
}
