//! The object-store capability the uploader consumes, plus the pieces every
//! provider shares: the error model, progress notification and part
//! splitting of a length-checked body stream.

use crate::models::{
    multipart::{ListingCursor, MultipartUploadListing},
    transfer::{CopyInPlaceRequest, ProgressEvent, PutObjectRequest},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
};
use thiserror::Error;

pub mod memory;
pub mod s3;

/// Body of a put request. Providers must consume exactly the declared size.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend returned status {status}{}: {message}", code_suffix(.code))]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("body declared {declared} bytes but yielded {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("backend response missing {0}")]
    MalformedResponse(&'static str),

    #[error("object store client has been shut down")]
    ShutDown,

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transient failures worth retrying at the object level: throttling,
    /// server errors, transport failures and interrupted I/O.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::Transport(_) => true,
            BackendError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),
            BackendError::LengthMismatch { .. }
            | BackendError::MalformedResponse(_)
            | BackendError::ShutDown => false,
        }
    }
}

/// Observer for transfer progress. Must be cheap; it runs on the transfer path.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Deliver a progress event, swallowing any panic raised by the listener so
/// that it cannot unwind through the transfer.
pub fn notify_progress(listener: &dyn ProgressListener, event: ProgressEvent) {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_progress(&event)));
    if delivered.is_err() {
        tracing::warn!("progress listener panicked on {:?}; continuing transfer", event);
    }
}

/// Remote object storage as seen by the uploader.
///
/// One implementation per provider; the controller and reaper are written
/// once against this trait.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Copy `request.path` onto itself. A missing object surfaces as a
    /// `Status` error (404, or 403 under restrictive policies).
    async fn copy_in_place(&self, request: &CopyInPlaceRequest) -> Result<(), BackendError>;

    /// Upload exactly `request.size` bytes from `body`, splitting into parts
    /// as the provider sees fit and reporting each completed part.
    ///
    /// A multipart upload opened by a put that fails, or whose future is
    /// dropped, is aborted by the provider.
    async fn put_object(
        &self,
        request: &PutObjectRequest,
        body: BodyStream,
        listener: &dyn ProgressListener,
    ) -> Result<(), BackendError>;

    async fn list_incomplete_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<ListingCursor>,
    ) -> Result<MultipartUploadListing, BackendError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackendError>;

    /// Release pooled connections. Later requests fail with `ShutDown`.
    async fn shutdown(&self);
}

/// Splits a body stream into parts of `part_size` bytes while enforcing
/// the declared length.
pub struct PartReader {
    body: BodyStream,
    declared: u64,
    part_size: usize,
    consumed: u64,
    pending: BytesMut,
    exhausted: bool,
}

impl PartReader {
    pub fn new(body: BodyStream, declared: u64, part_size: usize) -> Self {
        Self {
            body,
            declared,
            part_size: part_size.max(1),
            consumed: 0,
            pending: BytesMut::new(),
            exhausted: false,
        }
    }

    /// Next full part (the final one may be shorter), or `None` once the
    /// stream is drained and its length matched the declaration.
    pub async fn next_part(&mut self) -> Result<Option<Bytes>, BackendError> {
        while !self.exhausted && self.pending.len() < self.part_size {
            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.consumed += chunk.len() as u64;
                    if self.consumed > self.declared {
                        return Err(BackendError::LengthMismatch {
                            declared: self.declared,
                            actual: self.consumed,
                        });
                    }
                    self.pending.extend_from_slice(&chunk);
                }
                None => self.exhausted = true,
            }
        }

        if self.exhausted && self.consumed != self.declared {
            return Err(BackendError::LengthMismatch {
                declared: self.declared,
                actual: self.consumed,
            });
        }

        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.pending.len().min(self.part_size);
        Ok(Some(self.pending.split_to(take).freeze()))
    }

    /// Drain the whole body into one buffer; used for single-request puts.
    pub async fn read_all(mut self) -> Result<Bytes, BackendError> {
        let mut all = BytesMut::with_capacity(self.declared.min(self.part_size as u64) as usize);
        while let Some(part) = self.next_part().await? {
            all.extend_from_slice(&part);
        }
        Ok(all.freeze())
    }
}
