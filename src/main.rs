use anyhow::Result;
use futures::{StreamExt, stream};
use serde::Serialize;
use snapshot_uploader::{
    backends::{ObjectStoreClient, memory::MemoryObjectStore, s3::S3ObjectStore},
    config::{AppConfig, BackendKind},
    metrics::{MetricsSnapshot, SessionMetrics},
    models::transfer::BackupOutcome,
    retry::with_backoff,
    services::uploader::SnapshotUploader,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct FileReport {
    file: PathBuf,
    #[serde(flatten)]
    outcome: Option<BackupOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct RunSummary {
    files: Vec<FileReport>,
    metrics: MetricsSnapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting snapshot upload with config: {:?}", cfg);

    // --- Object store client ---
    let client: Arc<dyn ObjectStoreClient> = match cfg.backend {
        BackendKind::S3 => Arc::new(S3ObjectStore::connect(&cfg.s3).await),
        BackendKind::Memory => Arc::new(MemoryObjectStore::new(cfg.s3.part_size)),
    };
    let metrics = Arc::new(SessionMetrics::new());
    let uploader = SnapshotUploader::new(&cfg.uploader, client, metrics.clone())?;

    // --- Ctrl-C cancels in-flight work and the stale upload pass; the client is still released ---
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling uploads");
                cancel.cancel();
            }
        }
    });

    let files: Vec<FileReport> = stream::iter(cfg.files.iter())
        .map(|file| back_up(&cfg, &uploader, file, &cancel))
        .buffer_unordered(cfg.concurrency)
        .collect()
        .await;

    uploader.cleanup(&cancel).await;

    let failed = files.iter().filter(|report| report.error.is_some()).count();
    let summary = RunSummary {
        files,
        metrics: metrics.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if failed > 0 {
        anyhow::bail!("{} of {} files failed to back up", failed, summary.files.len());
    }
    Ok(())
}

async fn back_up(
    cfg: &AppConfig,
    uploader: &SnapshotUploader,
    file: &Path,
    cancel: &CancellationToken,
) -> FileReport {
    let result = match cfg.object_key_for(file) {
        Ok(key) => with_backoff(&cfg.retry, cancel, &key.display().to_string(), || {
            uploader.back_up_file(file, &key, cancel)
        })
        .await
        .map_err(anyhow::Error::from),
        Err(err) => Err(err),
    };

    match result {
        Ok(outcome) => FileReport {
            file: file.to_path_buf(),
            outcome: Some(outcome),
            error: None,
        },
        Err(err) => {
            tracing::error!("Backup of {} failed: {:#}", file.display(), err);
            FileReport {
                file: file.to_path_buf(),
                outcome: None,
                error: Some(format!("{:#}", err)),
            }
        }
    }
}
