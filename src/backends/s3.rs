//! S3 provider built on `aws-sdk-s3`. Works against AWS and S3-compatible
//! stores (IBM COS, MinIO) through a custom endpoint and path-style
//! addressing.

use super::{
    BackendError, BodyStream, ObjectStoreClient, PartReader, ProgressListener, notify_progress,
};
use crate::models::{
    multipart::{ListingCursor, MultipartUploadListing, MultipartUploadRecord},
    transfer::{CopyInPlaceRequest, ProgressEvent, PutObjectRequest},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{Region, http::HttpResponse},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload, CompletedPart, MetadataDirective, ServerSideEncryption,
        StorageClass,
    },
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;
/// Smallest part S3 accepts for any part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

/// Connection settings for the S3 provider.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Falls back to the SDK's provider chain (`AWS_REGION`, profile) when unset.
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub part_size: usize,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: None,
            endpoint: None,
            force_path_style: false,
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

pub struct S3ObjectStore {
    /// `None` once shut down; dropping the client releases its connection pool.
    client: RwLock<Option<Client>>,
    part_size: usize,
}

impl S3ObjectStore {
    /// Load credentials and region from the environment and build a client.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(settings.force_path_style)
            .build();
        debug!(
            "S3 client ready (region: {:?}, endpoint: {:?})",
            shared.region(),
            settings.endpoint
        );
        Self::from_client(Client::from_conf(config), settings.part_size)
    }

    pub fn from_client(client: Client, part_size: usize) -> Self {
        Self {
            client: RwLock::new(Some(client)),
            part_size: part_size.max(MIN_PART_SIZE),
        }
    }

    async fn client(&self) -> Result<Client, BackendError> {
        self.client.read().await.clone().ok_or(BackendError::ShutDown)
    }

    async fn put_single(
        &self,
        client: &Client,
        request: &PutObjectRequest,
        parts: PartReader,
    ) -> Result<(), BackendError> {
        let data = parts.read_all().await?;
        let mut put = client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.path)
            .content_length(request.size as i64)
            .content_md5(md5_base64(&data))
            .body(ByteStream::from(data));
        if let Some(class) = &request.storage_class {
            put = put.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(key_id) = &request.kms_key_id {
            put = put
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }
        put.send().await.map_err(backend_error)?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        client: &Client,
        request: &PutObjectRequest,
        parts: PartReader,
        listener: &dyn ProgressListener,
    ) -> Result<(), BackendError> {
        let mut create = client
            .create_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.path);
        if let Some(class) = &request.storage_class {
            create = create.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(key_id) = &request.kms_key_id {
            create = create
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }
        let created = create.send().await.map_err(backend_error)?;
        let upload_id = created
            .upload_id()
            .ok_or(BackendError::MalformedResponse("upload id"))?
            .to_string();

        let pending = PendingUpload {
            client: client.clone(),
            bucket: request.bucket.clone(),
            key: request.path.clone(),
            upload_id: Some(upload_id.clone()),
        };

        let outcome = match upload_parts(client, request, &upload_id, parts, listener).await {
            Ok(completed) => client
                .complete_multipart_upload()
                .bucket(&request.bucket)
                .key(&request.path)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(backend_error),
            Err(err) => Err(err),
        };

        if outcome.is_err() {
            abort_quietly(client, &request.bucket, &request.path, &upload_id).await;
        }
        pending.settle();
        outcome
    }
}

/// An upload id between create and complete/abort. Dropping it unsettled
/// (the put future was cancelled) aborts the upload in the background.
struct PendingUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
}

impl PendingUpload {
    fn settle(mut self) {
        self.upload_id = None;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "no runtime to abort multipart upload {} for {}; leaving it to the reaper",
                upload_id, self.key
            );
            return;
        };
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        runtime.spawn(async move {
            abort_quietly(&client, &bucket, &key, &upload_id).await;
        });
    }
}

async fn upload_parts(
    client: &Client,
    request: &PutObjectRequest,
    upload_id: &str,
    mut parts: PartReader,
    listener: &dyn ProgressListener,
) -> Result<Vec<CompletedPart>, BackendError> {
    let mut completed = Vec::new();
    let mut part_number: i32 = 0;
    while let Some(part) = parts.next_part().await? {
        part_number += 1;
        let bytes = part.len() as u64;
        let uploaded = client
            .upload_part()
            .bucket(&request.bucket)
            .key(&request.path)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(bytes as i64)
            .content_md5(md5_base64(&part))
            .body(ByteStream::from(part))
            .send()
            .await
            .map_err(backend_error)?;

        completed.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .build(),
        );
        notify_progress(
            listener,
            ProgressEvent::PartCompleted {
                part_number: part_number as u32,
                bytes,
            },
        );
    }
    Ok(completed)
}

async fn abort_quietly(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    if let Err(err) = client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
    {
        warn!(
            "failed to abort multipart upload {} for {}: {}",
            upload_id,
            key,
            DisplayErrorContext(&err)
        );
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    async fn copy_in_place(&self, request: &CopyInPlaceRequest) -> Result<(), BackendError> {
        let client = self.client().await?;
        let mut copy = client
            .copy_object()
            .bucket(&request.bucket)
            .key(&request.path)
            .copy_source(copy_source(&request.bucket, &request.path));
        if request.replace_metadata {
            copy = copy.metadata_directive(MetadataDirective::Replace);
        }
        if let Some(class) = &request.storage_class {
            copy = copy.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(key_id) = &request.kms_key_id {
            copy = copy
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(key_id);
        }
        copy.send().await.map_err(backend_error)?;
        Ok(())
    }

    async fn put_object(
        &self,
        request: &PutObjectRequest,
        body: BodyStream,
        listener: &dyn ProgressListener,
    ) -> Result<(), BackendError> {
        let client = self.client().await?;
        let part_size = effective_part_size(request.size, self.part_size);
        let parts = PartReader::new(body, request.size, part_size);

        if request.size <= part_size as u64 {
            self.put_single(&client, request, parts).await?;
        } else {
            self.put_multipart(&client, request, parts, listener).await?;
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
        let client = self.client().await?;
        let mut list = client.list_multipart_uploads().bucket(bucket).prefix(prefix);
        if let Some(cursor) = cursor {
            list = list
                .set_key_marker(cursor.key_marker)
                .set_upload_id_marker(cursor.upload_id_marker);
        }
        let page = list.send().await.map_err(backend_error)?;

        let uploads = page
            .uploads()
            .iter()
            .filter_map(|upload| {
                let initiated_at = upload
                    .initiated()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
                match (upload.key(), upload.upload_id(), initiated_at) {
                    (Some(key), Some(upload_id), Some(initiated_at)) => {
                        Some(MultipartUploadRecord {
                            key: key.to_string(),
                            upload_id: upload_id.to_string(),
                            initiated_at,
                        })
                    }
                    _ => {
                        debug!("skipping incomplete multipart listing entry {:?}", upload);
                        None
                    }
                }
            })
            .collect();

        let next_cursor = match (page.next_key_marker(), page.next_upload_id_marker()) {
            (None, None) => None,
            (key_marker, upload_id_marker) => Some(ListingCursor {
                key_marker: key_marker.map(str::to_string),
                upload_id_marker: upload_id_marker.map(str::to_string),
            }),
        };

        Ok(MultipartUploadListing {
            uploads,
            is_truncated: page.is_truncated().unwrap_or(false),
            next_cursor,
        })
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), BackendError> {
        let client = self.client().await?;
        client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.client.write().await.take().is_some() {
            info!("S3 client released");
        }
    }
}

/// Map an SDK failure onto the status-carrying backend error. Requests that
/// never produced a response are transport failures.
fn backend_error<E>(err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.raw_response() {
        Some(response) => BackendError::Status {
            status: response.status().as_u16(),
            code: err.code().map(str::to_string),
            message,
        },
        None => BackendError::Transport(message),
    }
}

fn md5_base64(data: &[u8]) -> String {
    B64.encode(md5::compute(data).0)
}

/// `x-amz-copy-source` value: `bucket/key`, percent-encoded except for `/`.
fn copy_source(bucket: &str, path: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + path.len() + 1);
    for byte in bucket.bytes().chain(std::iter::once(b'/')).chain(path.bytes()) {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// Grow the part size when the configured one would exceed S3's part limit.
fn effective_part_size(size: u64, configured: usize) -> usize {
    let needed = size.div_ceil(MAX_PARTS);
    configured.max(needed as usize)
}
