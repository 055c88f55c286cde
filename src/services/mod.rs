//! Remote-object lifecycle: freshen-or-upload, streamed uploads and the
//! stale multipart upload reaper, tied together by `SnapshotUploader`.

use crate::{
    errors::{UploaderError, UploaderResult},
    models::transfer::{CopyInPlaceRequest, PutObjectRequest},
};
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub mod freshen;
pub mod reaper;
pub mod upload;
pub mod uploader;

/// Bucket-level settings attached to every request of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectTarget {
    pub bucket: String,
    pub storage_class: Option<String>,
    pub kms_key_id: Option<String>,
}

impl ObjectTarget {
    pub fn copy_in_place(&self, path: &str) -> CopyInPlaceRequest {
        CopyInPlaceRequest {
            bucket: self.bucket.clone(),
            path: path.to_string(),
            replace_metadata: true,
            storage_class: self.storage_class.clone(),
            kms_key_id: self.kms_key_id.clone(),
        }
    }

    pub fn put(&self, path: &str, size: u64) -> PutObjectRequest {
        PutObjectRequest {
            bucket: self.bucket.clone(),
            path: path.to_string(),
            size,
            storage_class: self.storage_class.clone(),
            kms_key_id: self.kms_key_id.clone(),
        }
    }
}

/// Await `fut` unless `cancel` fires first. Dropping the backend future
/// abandons the request.
pub(crate) async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    operation: &'static str,
    fut: F,
) -> UploaderResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploaderError::Interrupted { operation }),
        output = fut => Ok(output),
    }
}
