//! SnapshotUploader: the session-level entry point for backing up the
//! files of one snapshot.
//!
//! - Resolve local keys into remote references
//! - Freshen an existing remote copy, or upload when it is absent
//! - Tear the session down: reap stale multipart uploads, then release the
//!   backend client exactly once

use super::{
    ObjectTarget,
    freshen::FreshenController,
    reaper::{STALE_UPLOAD_THRESHOLD, StaleUploadReaper},
    upload::UploadExecutor,
};
use crate::{
    backends::ObjectStoreClient,
    config::UploaderConfig,
    errors::{UploaderError, UploaderResult},
    metrics::MetricsSink,
    models::{
        remote_object::{RemoteObjectReference, RemotePathResolver},
        transfer::{BackupOutcome, FreshenResult},
    },
};
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{fs::File, io::AsyncRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SnapshotUploader {
    resolver: RemotePathResolver,
    freshen: FreshenController,
    upload: UploadExecutor,
    reaper: StaleUploadReaper,
    client: Arc<dyn ObjectStoreClient>,
    closed: AtomicBool,
}

impl SnapshotUploader {
    pub fn new(
        config: &UploaderConfig,
        client: Arc<dyn ObjectStoreClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> UploaderResult<Self> {
        let resolver = RemotePathResolver::new(&config.cluster_id, &config.backup_id)?;
        let target = ObjectTarget {
            bucket: config.bucket.clone(),
            storage_class: config.storage_class.clone(),
            kms_key_id: config.kms_key_id.clone(),
        };

        Ok(Self {
            resolver,
            freshen: FreshenController::new(client.clone(), target.clone(), metrics.clone()),
            upload: UploadExecutor::new(client.clone(), target, metrics.clone()),
            reaper: StaleUploadReaper::new(client.clone(), &config.bucket, metrics),
            client,
            closed: AtomicBool::new(false),
        })
    }

    pub fn object_key_to_remote_reference(
        &self,
        object_key: &Path,
    ) -> UploaderResult<RemoteObjectReference> {
        self.resolver.resolve(object_key)
    }

    pub async fn freshen_remote_object(
        &self,
        reference: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> UploaderResult<FreshenResult> {
        self.freshen.freshen(reference, cancel).await
    }

    pub async fn upload_snapshot_file<R>(
        &self,
        size: u64,
        reader: R,
        reference: &RemoteObjectReference,
        cancel: &CancellationToken,
    ) -> UploaderResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.upload.upload(size, reader, reference, cancel).await
    }

    /// Freshen `object_key`'s remote copy, uploading `local_path` only when
    /// the remote copy is missing. The local file is not opened otherwise.
    pub async fn back_up_file(
        &self,
        local_path: &Path,
        object_key: &Path,
        cancel: &CancellationToken,
    ) -> UploaderResult<BackupOutcome> {
        let reference = self.object_key_to_remote_reference(object_key)?;
        if self.freshen_remote_object(&reference, cancel).await? == FreshenResult::Freshened {
            return Ok(BackupOutcome::Freshened);
        }

        let io_error = |source| UploaderError::Io {
            path: local_path.to_path_buf(),
            source,
        };
        let file = File::open(local_path).await.map_err(io_error)?;
        let size = file.metadata().await.map_err(io_error)?.len();

        self.upload_snapshot_file(size, file, &reference, cancel)
            .await?;
        info!("uploaded {} as {}", local_path.display(), reference);
        Ok(BackupOutcome::Uploaded { bytes: size })
    }

    /// End the session. Stale upload cleanup is best-effort; the backend
    /// client is released regardless, and only on the first call.
    pub async fn cleanup(&self, cancel: &CancellationToken) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("session already closed");
            return;
        }

        let prefix = self.resolver.cluster_prefix();
        match self.reaper.reap(&prefix, STALE_UPLOAD_THRESHOLD, cancel).await {
            Ok(summary) => debug!("multipart cleanup summary: {:?}", summary),
            Err(err) => warn!("Failed to cleanup multipart uploads: {}", err),
        }

        self.client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::memory::MemoryObjectStore,
        metrics::{Counter, SessionMetrics},
        testutil::{ScriptedStore, page, record, status},
    };
    use std::io::Write;

    fn config() -> UploaderConfig {
        UploaderConfig {
            bucket: "backups".into(),
            cluster_id: "cluster".into(),
            backup_id: "backup-1".into(),
            storage_class: None,
            kms_key_id: None,
        }
    }

    fn session(client: Arc<dyn ObjectStoreClient>) -> SnapshotUploader {
        SnapshotUploader::new(&config(), client, Arc::new(SessionMetrics::new())).unwrap()
    }

    fn snapshot_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        let mut bad = config();
        bad.cluster_id = "a/b".into();
        let result = SnapshotUploader::new(
            &bad,
            Arc::new(ScriptedStore::new()),
            Arc::new(SessionMetrics::new()),
        );
        assert!(matches!(
            result,
            Err(UploaderError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn references_are_deterministic() {
        let uploader = session(Arc::new(ScriptedStore::new()));
        let a = uploader
            .object_key_to_remote_reference(Path::new("ks/tbl/Data.db"))
            .unwrap();
        let b = uploader
            .object_key_to_remote_reference(Path::new("ks/tbl/Data.db"))
            .unwrap();
        assert_eq!(a.canonical_path, b.canonical_path);
        assert_eq!(a.canonical_path, "cluster/backup-1/ks/tbl/Data.db");
    }

    #[tokio::test]
    async fn first_backup_uploads_and_second_freshens() {
        let store = Arc::new(MemoryObjectStore::new(4));
        let metrics = Arc::new(SessionMetrics::new());
        let uploader = SnapshotUploader::new(&config(), store.clone(), metrics.clone()).unwrap();
        let file = snapshot_file(b"sstable bytes");
        let cancel = CancellationToken::new();

        let first = uploader
            .back_up_file(file.path(), Path::new("ks/tbl/Data.db"), &cancel)
            .await
            .unwrap();
        assert_eq!(first, BackupOutcome::Uploaded { bytes: 13 });

        let second = uploader
            .back_up_file(file.path(), Path::new("ks/tbl/Data.db"), &cancel)
            .await
            .unwrap();
        assert_eq!(second, BackupOutcome::Freshened);

        let stored = store
            .object("backups", "cluster/backup-1/ks/tbl/Data.db")
            .await
            .unwrap();
        assert_eq!(stored.data, "sstable bytes");
        assert_eq!(metrics.get(Counter::UploadsRequired), 1);
        assert_eq!(metrics.get(Counter::ObjectsFreshened), 1);
    }

    #[tokio::test]
    async fn restrictive_policy_still_uploads() {
        let store = Arc::new(MemoryObjectStore::new(4).with_restrictive_policy());
        let uploader = session(store.clone());
        let file = snapshot_file(b"abc");

        let outcome = uploader
            .back_up_file(file.path(), Path::new("ks/f"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, BackupOutcome::Uploaded { bytes: 3 });
    }

    #[tokio::test]
    async fn freshened_objects_never_open_the_local_file() {
        let store = Arc::new(ScriptedStore::new());
        let uploader = session(store.clone());

        let outcome = uploader
            .back_up_file(
                Path::new("/nonexistent/snapshot/file"),
                Path::new("ks/f"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, BackupOutcome::Freshened);
        assert!(store.puts().is_empty());
    }

    #[tokio::test]
    async fn missing_local_file_is_an_io_error() {
        let store = Arc::new(ScriptedStore::new().copy_fails_with(status(404)));
        let uploader = session(store);

        let err = uploader
            .back_up_file(
                Path::new("/nonexistent/snapshot/file"),
                Path::new("ks/f"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploaderError::Io { .. }));
    }

    #[tokio::test]
    async fn cleanup_shuts_down_even_when_reaping_fails() {
        let store = Arc::new(ScriptedStore::new().list_fails_with(status(403)));
        let uploader = session(store.clone());

        uploader.cleanup(&CancellationToken::new()).await;
        assert_eq!(store.shutdowns(), 1);
    }

    #[tokio::test]
    async fn cleanup_reaps_under_cluster_prefix_and_closes_once() {
        let store = Arc::new(ScriptedStore::new().with_pages(vec![page(
            vec![record("cluster/backup-0/ks/f", 30)],
            None,
        )]));
        let uploader = session(store.clone());
        let cancel = CancellationToken::new();

        uploader.cleanup(&cancel).await;
        uploader.cleanup(&cancel).await;

        assert_eq!(store.aborts(), vec!["cluster/backup-0/ks/f".to_string()]);
        assert_eq!(store.shutdowns(), 1);
    }

    #[tokio::test]
    async fn cancelled_cleanup_still_releases_the_client() {
        let store = Arc::new(ScriptedStore::new());
        let uploader = session(store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        uploader.cleanup(&cancel).await;
        assert_eq!(store.shutdowns(), 1);
    }
}
