//! Session counters behind an injected port.
//!
//! `SessionMetrics` is built once in `main` and handed to the uploader as an
//! `Arc<dyn MetricsSink>`; nothing reads or writes process-wide state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    ObjectsFreshened,
    UploadsRequired,
    ObjectsUploaded,
    BytesUploaded,
    PartsCompleted,
    UploadFailures,
    StaleUploadsAborted,
    StaleUploadAbortFailures,
}

const COUNTER_COUNT: usize = 8;

impl Counter {
    fn index(self) -> usize {
        self as usize
    }
}

pub trait MetricsSink: Send + Sync {
    fn increment(&self, counter: Counter, by: u64);
}

#[derive(Default)]
pub struct SessionMetrics {
    counters: [AtomicU64; COUNTER_COUNT],
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            objects_freshened: self.get(Counter::ObjectsFreshened),
            uploads_required: self.get(Counter::UploadsRequired),
            objects_uploaded: self.get(Counter::ObjectsUploaded),
            bytes_uploaded: self.get(Counter::BytesUploaded),
            parts_completed: self.get(Counter::PartsCompleted),
            upload_failures: self.get(Counter::UploadFailures),
            stale_uploads_aborted: self.get(Counter::StaleUploadsAborted),
            stale_upload_abort_failures: self.get(Counter::StaleUploadAbortFailures),
        }
    }
}

impl MetricsSink for SessionMetrics {
    fn increment(&self, counter: Counter, by: u64) {
        self.counters[counter.index()].fetch_add(by, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters, printed at the end of a run.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub objects_freshened: u64,
    pub uploads_required: u64,
    pub objects_uploaded: u64,
    pub bytes_uploaded: u64,
    pub parts_completed: u64,
    pub upload_failures: u64,
    pub stale_uploads_aborted: u64,
    pub stale_upload_abort_failures: u64,
}
