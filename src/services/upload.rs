//! Streamed upload of a snapshot file of known length.

use super::{ObjectTarget, until_cancelled};
use crate::{
    backends::{ObjectStoreClient, ProgressListener},
    errors::{UploaderError, UploaderResult},
    metrics::{Counter, MetricsSink},
    models::{remote_object::RemoteObjectReference, transfer::ProgressEvent},
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::debug;

pub struct UploadExecutor {
    client: Arc<dyn ObjectStoreClient>,
    target: ObjectTarget,
    metrics: Arc<dyn MetricsSink>,
}

impl UploadExecutor {
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

    /// Upload exactly `size` bytes from `reader` to the reference's path and
    /// wait for the backend to confirm the whole object.
    ///
    /// The backend rejects a reader that yields a different byte count.
    pub async fn upload<R>(
        &self,
        size: u64,
        reader: R,
        reference: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> UploaderResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let request = self.target.put(&reference.canonical_path, size);
        let body = ReaderStream::new(reader).boxed();
        let observer = PartLogger {
            path: &reference.canonical_path,
            metrics: self.metrics.as_ref(),
        };

        let transfer = self.client.put_object(&request, body, &observer);
        match until_cancelled(cancel, "upload", transfer).await? {
            Ok(()) => {
                debug!("uploaded {} ({} bytes)", reference, size);
                self.metrics.increment(Counter::ObjectsUploaded, 1);
                self.metrics.increment(Counter::BytesUploaded, size);
                Ok(())
            }
            Err(source) => {
                self.metrics.increment(Counter::UploadFailures, 1);
                Err(UploaderError::Upload {
                    path: reference.canonical_path.clone(),
                    source,
                })
            }
        }
    }
}

struct PartLogger<'a> {
    path: &'a str,
    metrics: &'a dyn MetricsSink,
}

impl ProgressListener for PartLogger<'_> {
    fn on_progress(&self, event: &ProgressEvent) {
        if let ProgressEvent::PartCompleted { part_number, bytes } = event {
            debug!(
                "Successfully uploaded part {} ({} bytes) for {}.",
                part_number, bytes, self.path
            );
            self.metrics.increment(Counter::PartsCompleted, 1);
        }
    }
}
