//! Incomplete multipart uploads as reported by the backend.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A multipart upload session the backend still holds open.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MultipartUploadRecord {
    /// Object key being uploaded.
    pub key: String,

    /// Opaque upload id issued by the backend.
    pub upload_id: String,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,
}

impl MultipartUploadRecord {
    /// True when the upload began strictly before `now - threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.checked_sub_signed(threshold)
            .is_some_and(|cutoff| self.initiated_at < cutoff)
    }
}

/// Continuation markers returned by one listing page and passed to the next.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ListingCursor {
    pub key_marker: Option<String>,
    pub upload_id_marker: Option<String>,
}

/// One page of `ListMultipartUploads`.
#[derive(Clone, Debug, Default)]
pub struct MultipartUploadListing {
    pub uploads: Vec<MultipartUploadRecord>,
    pub is_truncated: bool,
    pub next_cursor: Option<ListingCursor>,
}
