//! Best-effort cleanup of multipart uploads that were started and never
//! completed.
//!
//! Incomplete uploads keep their parts (and their cost) until someone aborts
//! them. The reaper lists every open upload under a prefix, page by page, and
//! aborts the ones older than a threshold. Each abort is independent: a
//! failure is logged and counted, and the pass moves on.
//!
//! Pagination is driven by the backend's truncation flag. The backend is
//! trusted to advance its markers; as a guard against one that does not, the
//! pass stops when a truncated page repeats or omits its cursor, and after
//! `MAX_LISTING_PAGES` pages.

use super::until_cancelled;
use crate::{
    backends::ObjectStoreClient,
    errors::CleanupFailure,
    metrics::{Counter, MetricsSink},
    models::multipart::ListingCursor,
};
use chrono::Utc;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Uploads initiated longer ago than this are abandoned.
pub const STALE_UPLOAD_THRESHOLD: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_LISTING_PAGES: usize = 10_000;

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub pages: usize,
    pub examined: usize,
    pub aborted: usize,
    pub failed: usize,
}

pub struct StaleUploadReaper {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    metrics: Arc<dyn MetricsSink>,
}

impl StaleUploadReaper {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            metrics,
        }
    }

    /// Abort every incomplete upload under `prefix` initiated before
    /// `now - threshold`.
    ///
    /// Only a failed listing or cancellation ends the pass early.
    pub async fn reap(
        &self,
        prefix: &str,
        threshold: Duration,
        cancel: &CancellationToken,
    ) -> Result<ReapSummary, CleanupFailure> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        info!(
            "Cleaning up multipart uploads under {} older than {} hours.",
            prefix,
            threshold.num_hours()
        );

        let mut summary = ReapSummary::default();
        let mut cursor: Option<ListingCursor> = None;
        loop {
            let listing = until_cancelled(
                cancel,
                "multipart listing",
                self.client
                    .list_incomplete_multipart_uploads(&self.bucket, prefix, cursor.clone()),
            )
            .await
            .map_err(|_| CleanupFailure::Interrupted)?
            .map_err(|source| CleanupFailure::Listing {
                prefix: prefix.to_string(),
                source,
            })?;

            summary.pages += 1;
            summary.examined += listing.uploads.len();

            for record in listing
                .uploads
                .iter()
                .filter(|record| record.is_stale(now, threshold))
            {
                info!(
                    "Aborting multi-part upload for key \"{}\" initiated on {}",
                    record.key, record.initiated_at
                );
                let aborted = until_cancelled(
                    cancel,
                    "multipart abort",
                    self.client
                        .abort_multipart_upload(&self.bucket, &record.key, &record.upload_id),
                )
                .await
                .map_err(|_| CleanupFailure::Interrupted)?;

                match aborted {
                    Ok(()) => {
                        summary.aborted += 1;
                        self.metrics.increment(Counter::StaleUploadsAborted, 1);
                    }
                    Err(err) => {
                        error!(
                            "Failed to abort multipart upload for key \"{}\": {}",
                            record.key, err
                        );
                        summary.failed += 1;
                        self.metrics.increment(Counter::StaleUploadAbortFailures, 1);
                    }
                }
            }

            if !listing.is_truncated {
                break;
            }
            match listing.next_cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => {
                    warn!(
                        "multipart listing under {} is truncated but its markers did not advance; stopping",
                        prefix
                    );
                    break;
                }
            }
            if summary.pages >= MAX_LISTING_PAGES {
                warn!(
                    "multipart listing under {} exceeded {} pages; stopping",
                    prefix, MAX_LISTING_PAGES
                );
                break;
            }
        }

        info!(
            "Multipart cleanup under {} done: {} pages, {} uploads examined, {} aborted, {} failed.",
            prefix, summary.pages, summary.examined, summary.aborted, summary.failed
        );
        Ok(summary)
    }
}
