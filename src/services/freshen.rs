//! Decide whether a remote copy can be refreshed in place.

use super::{ObjectTarget, until_cancelled};
use crate::{
    backends::{BackendError, ObjectStoreClient},
    errors::{UploaderError, UploaderResult},
    metrics::{Counter, MetricsSink},
    models::{remote_object::RemoteObjectReference, transfer::FreshenResult},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct FreshenController {
    client: Arc<dyn ObjectStoreClient>,
    target: ObjectTarget,
    metrics: Arc<dyn MetricsSink>,
}

impl FreshenController {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        target: ObjectTarget,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            target,
            metrics,
        }
    }

    /// Copy the object onto itself with replaced metadata so its retention
    /// restarts without moving any bytes.
    ///
    /// Absence (404, or 403 under policies that hide missing keys) means an
    /// upload is required. Any other failure is returned to the caller.
    pub async fn freshen(
        &self,
        reference: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> UploaderResult<FreshenResult> {
        let request = self.target.copy_in_place(&reference.canonical_path);
        let copied = until_cancelled(
            cancel,
            "in-place copy",
            self.client.copy_in_place(&request),
        )
        .await?;

        match copied {
            Ok(()) => {
                debug!("freshened {}", reference);
                self.metrics.increment(Counter::ObjectsFreshened, 1);
                Ok(FreshenResult::Freshened)
            }
            Err(err) if indicates_absence(&err) => {
                debug!("{} not present remotely ({}); upload required", reference, err);
                self.metrics.increment(Counter::UploadsRequired, 1);
                Ok(FreshenResult::UploadRequired)
            }
            Err(source) => Err(UploaderError::Backend {
                operation: "in-place copy",
                path: reference.canonical_path.clone(),
                source,
            }),
        }
    }
}

/// Some S3 configurations answer AccessDenied instead of NoSuchKey when the
/// caller may not list the bucket, so both count as "absent".
fn indicates_absence(err: &BackendError) -> bool {
    matches!(err.status(), Some(404 | 403))
}
