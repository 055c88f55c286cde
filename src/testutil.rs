//! Programmable `ObjectStoreClient` for unit tests.

use crate::{
    backends::{
        BackendError, BodyStream, ObjectStoreClient, PartReader, ProgressListener, notify_progress,
    },
    models::{
        multipart::{ListingCursor, MultipartUploadListing, MultipartUploadRecord},
        transfer::{CopyInPlaceRequest, ProgressEvent, PutObjectRequest},
    },
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

pub fn status(code: u16) -> BackendError {
    BackendError::Status {
        status: code,
        code: None,
        message: format!("scripted {code}"),
    }
}

pub fn record(key: &str, age_hours: i64) -> MultipartUploadRecord {
    MultipartUploadRecord {
        key: key.to_string(),
        upload_id: format!("u-{key}"),
        initiated_at: Utc::now() - Duration::hours(age_hours),
    }
}

pub fn cursor(key: &str, upload_id: &str) -> ListingCursor {
    ListingCursor {
        key_marker: Some(key.to_string()),
        upload_id_marker: Some(upload_id.to_string()),
    }
}

/// A listing page; truncated exactly when a next cursor is given.
pub fn page(
    uploads: Vec<MultipartUploadRecord>,
    next_cursor: Option<ListingCursor>,
) -> MultipartUploadListing {
    MultipartUploadListing {
        uploads,
        is_truncated: next_cursor.is_some(),
        next_cursor,
    }
}

#[derive(Default)]
struct Calls {
    copies: Vec<String>,
    puts: Vec<(String, u64)>,
    list_cursors: Vec<Option<ListingCursor>>,
    aborts: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedStore {
    copy_results: Mutex<VecDeque<BackendError>>,
    copy_hangs: bool,
    put_parts: u32,
    put_error: Mutex<Option<BackendError>>,
    put_hangs: bool,
    pages: Vec<MultipartUploadListing>,
    list_error: Mutex<Option<BackendError>>,
    failing_aborts: HashSet<String>,
    calls: Mutex<Calls>,
    shutdowns: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next copy; later copies succeed.
    pub fn copy_fails_with(self, err: BackendError) -> Self {
        self.copy_results.lock().unwrap().push_back(err);
        self
    }

    pub fn copy_hangs(mut self) -> Self {
        self.copy_hangs = true;
        self
    }

    pub fn put_reports_parts(mut self, parts: u32) -> Self {
        self.put_parts = parts;
        self
    }

    pub fn put_fails_with(self, err: BackendError) -> Self {
        *self.put_error.lock().unwrap() = Some(err);
        self
    }

    pub fn put_hangs(mut self) -> Self {
        self.put_hangs = true;
        self
    }

    /// Pages returned by successive list calls; calls past the end get an
    /// empty, untruncated page.
    pub fn with_pages(mut self, pages: Vec<MultipartUploadListing>) -> Self {
        self.pages = pages;
        self
    }

    pub fn list_fails_with(self, err: BackendError) -> Self {
        *self.list_error.lock().unwrap() = Some(err);
        self
    }

    pub fn abort_fails_for(mut self, key: &str) -> Self {
        self.failing_aborts.insert(key.to_string());
        self
    }

    pub fn copies(&self) -> Vec<String> {
        self.calls.lock().unwrap().copies.clone()
    }

    pub fn puts(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().puts.clone()
    }

    pub fn list_cursors(&self) -> Vec<Option<ListingCursor>> {
        self.calls.lock().unwrap().list_cursors.clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.calls.lock().unwrap().aborts.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStoreClient for ScriptedStore {
    async fn copy_in_place(&self, request: &CopyInPlaceRequest) -> Result<(), BackendError> {
        self.calls.lock().unwrap().copies.push(request.path.clone());
        if self.copy_hangs {
            std::future::pending::<()>().await;
        }
        match self.copy_results.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn put_object(
        &self,
        request: &PutObjectRequest,
        body: BodyStream,
        listener: &dyn ProgressListener,
    ) -> Result<(), BackendError> {
        self.calls
            .lock()
            .unwrap()
            .puts
            .push((request.path.clone(), request.size));
        if self.put_hangs {
            std::future::pending::<()>().await;
        }

        PartReader::new(body, request.size, usize::MAX).read_all().await?;
        for part_number in 1..=self.put_parts {
            notify_progress(
                listener,
                ProgressEvent::PartCompleted {
                    part_number,
                    bytes: request.size / u64::from(self.put_parts),
                },
            );
        }
        if let Some(err) = self.put_error.lock().unwrap().take() {
            return Err(err);
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
        _bucket: &str,
        _prefix: &str,
        cursor: Option<ListingCursor>,
    ) -> Result<MultipartUploadListing, BackendError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.list_cursors.push(cursor);
            calls.list_cursors.len() - 1
        };
        if let Some(err) = self.list_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.pages.get(call).cloned().unwrap_or_default())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        _upload_id: &str,
    ) -> Result<(), BackendError> {
        self.calls.lock().unwrap().aborts.push(key.to_string());
        if self.failing_aborts.contains(key) {
            return Err(status(500));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
