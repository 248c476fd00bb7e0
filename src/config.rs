use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use std::{env, str::FromStr};

/// Expiration window applied when nothing else is configured.
pub const DEFAULT_EXPIRATION_SECS: i64 = 24 * 60 * 60;

/// Largest single chunk accepted when nothing else is configured.
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub uploads: UploadSettings,
}

/// Limits and timing rules for upload sessions.
///
/// Passed explicitly to `UploadService::new`.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// How long after creation an unfinished upload is considered abandoned.
    pub expiration_window: TimeDelta,

    /// Largest chunk body accepted in one request. Larger chunks are rejected,
    /// never truncated.
    pub max_chunk_size: u64,

    /// Largest declared file size, `None` for unlimited.
    pub max_total_size: Option<u64>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            expiration_window: TimeDelta::seconds(DEFAULT_EXPIRATION_SECS),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_total_size: None,
        }
    }
}

/// What the binary should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    ReapExpired,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload server")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload content is stored (overrides CHUNKED_UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds before an unfinished upload expires (overrides CHUNKED_UPLOAD_EXPIRATION_SECS)
    #[arg(long)]
    pub expiration_secs: Option<i64>,

    /// Maximum chunk size in bytes (overrides CHUNKED_UPLOAD_MAX_CHUNK_SIZE)
    #[arg(long)]
    pub max_chunk_size: Option<u64>,

    /// Maximum declared file size in bytes (overrides CHUNKED_UPLOAD_MAX_TOTAL_SIZE)
    #[arg(long)]
    pub max_total_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "reap_expired")]
    pub migrate: bool,

    /// Delete expired, unfinished uploads and exit
    #[arg(long)]
    pub reap_expired: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    /// Merge already-parsed CLI args over the environment.
    pub fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CHUNKED_UPLOAD_PORT")?.unwrap_or(3000);
        let env_storage =
            env::var("CHUNKED_UPLOAD_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunked_upload.db".into());
        let env_expiration =
            env_parse("CHUNKED_UPLOAD_EXPIRATION_SECS")?.unwrap_or(DEFAULT_EXPIRATION_SECS);
        let env_max_chunk =
            env_parse("CHUNKED_UPLOAD_MAX_CHUNK_SIZE")?.unwrap_or(DEFAULT_MAX_CHUNK_SIZE);
        let env_max_total = env_parse("CHUNKED_UPLOAD_MAX_TOTAL_SIZE")?;

        let expiration_secs = args.expiration_secs.unwrap_or(env_expiration);
        if expiration_secs <= 0 {
            anyhow::bail!("expiration window must be positive, got {expiration_secs}s");
        }
        let max_chunk_size = args.max_chunk_size.unwrap_or(env_max_chunk);
        if max_chunk_size == 0 {
            anyhow::bail!("max chunk size must be positive");
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            uploads: UploadSettings {
                expiration_window: TimeDelta::seconds(expiration_secs),
                max_chunk_size,
                max_total_size: args.max_total_size.or(env_max_total),
            },
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.reap_expired {
            RunMode::ReapExpired
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an optional environment variable.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
