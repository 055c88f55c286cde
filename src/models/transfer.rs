//! Request and result types exchanged between the controller and a backend.

use serde::Serialize;

/// Refresh an object's metadata by copying it onto itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyInPlaceRequest {
    pub bucket: String,
    pub path: String,

    /// Replace (rather than copy) metadata so retention is re-evaluated.
    pub replace_metadata: bool,

    pub storage_class: Option<String>,

    /// Server-side encryption key id (SSE-KMS), sent only when present.
    pub kms_key_id: Option<String>,
}

/// Store `size` bytes at `path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub path: String,

    /// Exact number of bytes the body must yield.
    pub size: u64,

    pub storage_class: Option<String>,
    pub kms_key_id: Option<String>,
}

/// Progress notifications emitted while a put is in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    PartCompleted { part_number: u32, bytes: u64 },
    TransferCompleted { bytes: u64 },
}

/// Outcome of an in-place refresh attempt.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FreshenResult {
    Freshened,
    UploadRequired,
}

/// What backing up a single local file ended up doing.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum BackupOutcome {
    Freshened,
    Uploaded { bytes: u64 },
}
