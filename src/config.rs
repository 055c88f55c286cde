use crate::{
    backends::s3::{DEFAULT_PART_SIZE, MIN_PART_SIZE, S3Settings},
    retry::RetryConfig,
};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Settings of one backup session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploaderConfig {
    pub bucket: String,
    pub cluster_id: String,
    pub backup_id: String,
    pub storage_class: Option<String>,
    pub kms_key_id: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    S3,
    /// Process-local store, for dry runs.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub uploader: UploaderConfig,
    pub backend: BackendKind,
    pub s3: S3Settings,
    pub retry: RetryConfig,
    pub concurrency: usize,
    pub snapshot_root: Option<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Back up snapshot files to object storage")]
pub struct Args {
    /// Destination bucket (overrides SNAPSHOT_UPLOADER_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Cluster id, first segment of every remote path (overrides SNAPSHOT_UPLOADER_CLUSTER_ID)
    #[arg(long)]
    pub cluster_id: Option<String>,

    /// Backup id, second segment of every remote path (overrides SNAPSHOT_UPLOADER_BACKUP_ID)
    #[arg(long)]
    pub backup_id: Option<String>,

    /// Object store backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Custom S3 endpoint (overrides SNAPSHOT_UPLOADER_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Region (overrides AWS_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Use path-style bucket addressing
    #[arg(long)]
    pub force_path_style: bool,

    /// KMS key for server-side encryption (overrides SNAPSHOT_UPLOADER_KMS_KEY_ID)
    #[arg(long)]
    pub kms_key_id: Option<String>,

    /// Storage class of written objects (overrides SNAPSHOT_UPLOADER_STORAGE_CLASS)
    #[arg(long)]
    pub storage_class: Option<String>,

    /// Multipart part size in bytes (overrides SNAPSHOT_UPLOADER_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<usize>,

    /// Files backed up at once (overrides SNAPSHOT_UPLOADER_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Retries per file on transient failures (overrides SNAPSHOT_UPLOADER_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Object keys are file paths relative to this directory
    #[arg(long)]
    pub snapshot_root: Option<PathBuf>,

    /// Snapshot files to back up
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge `args` over the variables visible through `env`.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |flag: Option<String>, name: &str| {
            flag.or_else(|| env(name))
                .filter(|value| !value.is_empty())
                .with_context(|| format!("missing {name} (or its command-line flag)"))
        };

        let uploader = UploaderConfig {
            bucket: required(args.bucket, "SNAPSHOT_UPLOADER_BUCKET")?,
            cluster_id: required(args.cluster_id, "SNAPSHOT_UPLOADER_CLUSTER_ID")?,
            backup_id: required(args.backup_id, "SNAPSHOT_UPLOADER_BACKUP_ID")?,
            storage_class: args
                .storage_class
                .or_else(|| env("SNAPSHOT_UPLOADER_STORAGE_CLASS")),
            kms_key_id: args
                .kms_key_id
                .or_else(|| env("SNAPSHOT_UPLOADER_KMS_KEY_ID")),
        };

        let backend = args.backend.unwrap_or_default();
        let part_size = match args.part_size {
            Some(size) => size,
            None => parse_var(&env, "SNAPSHOT_UPLOADER_PART_SIZE")?.unwrap_or(DEFAULT_PART_SIZE),
        };
        if part_size == 0 {
            bail!("part size must be at least 1 byte");
        }
        if backend == BackendKind::S3 && part_size < MIN_PART_SIZE {
            bail!("part size {part_size} is below the S3 minimum of {MIN_PART_SIZE} bytes");
        }

        let concurrency = match args.concurrency {
            Some(n) => n,
            None => parse_var(&env, "SNAPSHOT_UPLOADER_CONCURRENCY")?.unwrap_or(4),
        };
        if concurrency == 0 {
            bail!("concurrency must be at least 1");
        }

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: match args.max_retries {
                Some(n) => n,
                None => parse_var(&env, "SNAPSHOT_UPLOADER_MAX_RETRIES")?
                    .unwrap_or(defaults.max_retries),
            },
            ..defaults
        };

        Ok(Self {
            uploader,
            backend,
            s3: S3Settings {
                region: args.region.or_else(|| env("AWS_REGION")),
                endpoint: args.endpoint.or_else(|| env("SNAPSHOT_UPLOADER_ENDPOINT")),
                force_path_style: args.force_path_style,
                part_size,
            },
            retry,
            concurrency,
            snapshot_root: args.snapshot_root,
            files: args.files,
        })
    }

    /// The object key of `file`: its path under the snapshot root, or its
    /// file name when no root is configured.
    pub fn object_key_for(&self, file: &Path) -> Result<PathBuf> {
        match &self.snapshot_root {
            Some(root) => file.strip_prefix(root).map(Path::to_path_buf).with_context(|| {
                format!(
                    "{} is not under snapshot root {}",
                    file.display(),
                    root.display()
                )
            }),
            None => file
                .file_name()
                .map(PathBuf::from)
                .with_context(|| format!("{} has no file name", file.display())),
        }
    }
}

fn parse_var<T>(env: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, value))
        })
        .transpose()
}
