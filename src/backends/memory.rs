//! In-process object store.
//!
//! Keeps object payloads and open multipart uploads in memory. Listing
//! follows `ListMultipartUploads` ordering (key, then upload id) with
//! key/upload-id markers, so the reaper's pagination runs unchanged against
//! it. Used for dry runs and tests.

use super::{
    BackendError, BodyStream, ObjectStoreClient, PartReader, ProgressListener, notify_progress,
};
use crate::models::{
    multipart::{ListingCursor, MultipartUploadListing, MultipartUploadRecord},
    transfer::{CopyInPlaceRequest, ProgressEvent, PutObjectRequest},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_MAX_UPLOADS: usize = 1000;

/// A stored object and the metadata the last write or refresh left on it.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub storage_class: String,
    pub kms_key_id: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// (bucket, key, upload id)
type UploadId = (String, String, String);

#[derive(Default)]
struct State {
    /// (bucket, path) -> object
    objects: HashMap<(String, String), StoredObject>,
    uploads: BTreeMap<UploadId, MultipartUploadRecord>,
    closed: bool,
}

pub struct MemoryObjectStore {
    state: Arc<Mutex<State>>,
    part_size: usize,
    max_uploads: usize,
    restrictive_policy: bool,
}

impl MemoryObjectStore {
    pub fn new(part_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            part_size: part_size.max(1),
            max_uploads: DEFAULT_MAX_UPLOADS,
            restrictive_policy: false,
        }
    }

    /// Page size for multipart listings.
    pub fn with_max_uploads(mut self, max_uploads: usize) -> Self {
        self.max_uploads = max_uploads.max(1);
        self
    }

    /// Report missing objects as 403 AccessDenied, the way buckets without
    /// `s3:ListBucket` permission do.
    pub fn with_restrictive_policy(mut self) -> Self {
        self.restrictive_policy = true;
        self
    }

    pub async fn object(&self, bucket: &str, path: &str) -> Option<StoredObject> {
        let state = self.state.lock().await;
        state
            .objects
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    /// Register an open multipart upload, as if a writer had started and
    /// never finished. Returns the upload id.
    pub async fn begin_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        initiated_at: DateTime<Utc>,
    ) -> String {
        let upload_id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.uploads.insert(
            (bucket.to_string(), key.to_string(), upload_id.clone()),
            MultipartUploadRecord {
                key: key.to_string(),
                upload_id: upload_id.clone(),
                initiated_at,
            },
        );
        upload_id
    }

    pub async fn open_upload_count(&self, bucket: &str) -> usize {
        let state = self.state.lock().await;
        state.uploads.keys().filter(|(b, _, _)| b == bucket).count()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.closed
    }

    fn missing_object(&self, path: &str) -> BackendError {
        if self.restrictive_policy {
            BackendError::Status {
                status: 403,
                code: Some("AccessDenied".into()),
                message: "Access Denied".into(),
            }
        } else {
            BackendError::Status {
                status: 404,
                code: Some("NoSuchKey".into()),
                message: format!("object `{path}` does not exist"),
            }
        }
    }

    async fn ensure_open(&self) -> Result<(), BackendError> {
        if self.state.lock().await.closed {
            return Err(BackendError::ShutDown);
        }
        Ok(())
    }

    async fn store(&self, request: &PutObjectRequest, data: Bytes) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BackendError::ShutDown);
        }
        let etag = format!("{:x}", md5::compute(&data));
        state.objects.insert(
            (request.bucket.clone(), request.path.clone()),
            StoredObject {
                data,
                etag,
                storage_class: request
                    .storage_class
                    .clone()
                    .unwrap_or_else(|| "STANDARD".into()),
                kms_key_id: request.kms_key_id.clone(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn put_multipart(
        &self,
        request: &PutObjectRequest,
        mut parts: PartReader,
        listener: &dyn ProgressListener,
    ) -> Result<(), BackendError> {
        let upload_id = self
            .begin_multipart_upload(&request.bucket, &request.path, Utc::now())
            .await;
        let open = OpenUpload {
            state: self.state.clone(),
            id: Some((request.bucket.clone(), request.path.clone(), upload_id)),
        };

        let assembled = collect_parts(&mut parts, listener).await;
        open.release().await;
        self.store(request, assembled?.freeze()).await
    }
}

async fn collect_parts(
    parts: &mut PartReader,
    listener: &dyn ProgressListener,
) -> Result<BytesMut, BackendError> {
    let mut assembled = BytesMut::new();
    let mut part_number = 0u32;
    while let Some(part) = parts.next_part().await? {
        part_number += 1;
        assembled.extend_from_slice(&part);
        notify_progress(
            listener,
            ProgressEvent::PartCompleted {
                part_number,
                bytes: part.len() as u64,
            },
        );
    }
    Ok(assembled)
}

/// Registration of an in-progress multipart put. Released explicitly when
/// the put finishes; dropping it early (a cancelled put) unregisters too.
struct OpenUpload {
    state: Arc<Mutex<State>>,
    id: Option<UploadId>,
}

impl OpenUpload {
    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            self.state.lock().await.uploads.remove(&id);
        }
    }
}

impl Drop for OpenUpload {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Ok(mut state) = self.state.try_lock() {
            state.uploads.remove(&id);
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let state = self.state.clone();
            runtime.spawn(async move {
                state.lock().await.uploads.remove(&id);
            });
        }
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn copy_in_place(&self, request: &CopyInPlaceRequest) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BackendError::ShutDown);
        }
        let id = (request.bucket.clone(), request.path.clone());
        let Some(object) = state.objects.get_mut(&id) else {
            return Err(self.missing_object(&request.path));
        };

        object.last_modified = Utc::now();
        if request.replace_metadata {
            if let Some(class) = &request.storage_class {
                object.storage_class = class.clone();
            }
            object.kms_key_id = request.kms_key_id.clone();
        }
        debug!("refreshed {} in place", request.path);
        Ok(())
    }

    async fn put_object(
        &self,
        request: &PutObjectRequest,
        body: BodyStream,
        listener: &dyn ProgressListener,
    ) -> Result<(), BackendError> {
        self.ensure_open().await?;
        let parts = PartReader::new(body, request.size, self.part_size);

        if request.size > self.part_size as u64 {
            self.put_multipart(request, parts, listener).await?;
        } else {
            let data = parts.read_all().await?;
            self.store(request, data).await?;
        }

        notify_progress(
            listener,
            ProgressEvent::TransferCompleted {
                bytes: request.size,
            },
        );
        Ok(())
    }

    async fn list_incomplete_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
        cursor: Option<ListingCursor>,
    ) -> Result<MultipartUploadListing, BackendError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(BackendError::ShutDown);
        }

        let (key_marker, upload_id_marker) = cursor
            .map(|c| (c.key_marker, c.upload_id_marker))
            .unwrap_or((None, None));

        // S3 semantics: with only a key marker, resume after every upload for
        // that key; with both, resume after (key, upload id).
        let after_marker = |key: &str, upload_id: &str| match (&key_marker, &upload_id_marker) {
            (None, _) => true,
            (Some(k), None) => key > k.as_str(),
            (Some(k), Some(u)) => {
                key > k.as_str() || (key == k.as_str() && upload_id > u.as_str())
            }
        };

        let mut page: Vec<MultipartUploadRecord> = state
            .uploads
            .iter()
            .filter(|((b, key, upload_id), _)| {
                b == bucket
                    && key.starts_with(prefix)
                    && after_marker(key.as_str(), upload_id.as_str())
            })
            .map(|(_, record)| record.clone())
            .take(self.max_uploads + 1)
            .collect();

        let is_truncated = page.len() > self.max_uploads;
        page.truncate(self.max_uploads);
        let next_cursor = if is_truncated {
            page.last().map(|last| ListingCursor {
                key_marker: Some(last.key.clone()),
                upload_id_marker: Some(last.upload_id.clone()),
            })
        } else {
            None
        };

        Ok(MultipartUploadListing {
            uploads: page,
            is_truncated,
            next_cursor,
        })
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BackendError::ShutDown);
        }
        let id = (bucket.to_string(), key.to_string(), upload_id.to_string());
        match state.uploads.remove(&id) {
            Some(_) => Ok(()),
            None => Err(BackendError::Status {
                status: 404,
                code: Some("NoSuchUpload".into()),
                message: format!("upload `{upload_id}` for `{key}` does not exist"),
            }),
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
    }
}
