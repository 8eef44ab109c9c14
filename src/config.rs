use crate::services::{part_uploader::RetryPolicy, recorder::RecorderConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub broker_url: String,
    pub broker_token: Option<String>,
    pub slice_interval_ms: u64,
    pub queue_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub drain_timeout_secs: u64,
    pub prune_uploaded: bool,
    pub max_slice_bytes: usize,
}

/// What the binary should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Drain,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resilient chunked media recorder and uploader")]
pub struct Args {
    /// Host to bind to (overrides RECORDER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RECORDER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides RECORDER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Upload broker base URL (overrides RECORDER_BROKER_URL)
    #[arg(long)]
    pub broker_url: Option<String>,

    /// Capture slice length in milliseconds (overrides RECORDER_SLICE_INTERVAL_MS)
    #[arg(long)]
    pub slice_interval_ms: Option<u64>,

    /// Upload queue tick in milliseconds (overrides RECORDER_QUEUE_INTERVAL_MS)
    #[arg(long)]
    pub queue_interval_ms: Option<u64>,

    /// Attempts per part before a chunk is marked failed (overrides RECORDER_MAX_RETRIES)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Largest accepted slice body in bytes (overrides RECORDER_MAX_SLICE_BYTES)
    #[arg(long)]
    pub max_slice_bytes: Option<usize>,

    /// Apply the schema and exit
    #[arg(long, conflicts_with = "drain")]
    pub migrate: bool,

    /// Upload everything pending, finalize recovered sessions and exit
    #[arg(long)]
    pub drain: bool,
}

/// A few seconds of high-bitrate video fit comfortably.
pub const DEFAULT_MAX_SLICE_BYTES: usize = 64 * 1024 * 1024;

type Lookup<'a> = &'a dyn Fn(&str) -> Result<String, env::VarError>;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        Self::from_sources(args, &|key| env::var(key))
    }

    pub fn from_sources(args: Args, lookup: Lookup<'_>) -> Result<(Self, RunMode)> {
        let env_host = lookup("RECORDER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let env_db = lookup("RECORDER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/recorder.db".into());
        let env_broker = lookup("RECORDER_BROKER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080/api".into());
        let broker_token = lookup("RECORDER_BROKER_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: pick(args.port, lookup, "RECORDER_PORT", 4600)?,
            database_url: args.database_url.unwrap_or(env_db),
            broker_url: args.broker_url.unwrap_or(env_broker),
            broker_token,
            slice_interval_ms: pick(
                args.slice_interval_ms,
                lookup,
                "RECORDER_SLICE_INTERVAL_MS",
                4000,
            )?,
            queue_interval_ms: pick(
                args.queue_interval_ms,
                lookup,
                "RECORDER_QUEUE_INTERVAL_MS",
                2000,
            )?,
            max_retries: pick(args.max_retries, lookup, "RECORDER_MAX_RETRIES", 3)?,
            retry_base_delay_ms: pick(None, lookup, "RECORDER_RETRY_BASE_DELAY_MS", 500)?,
            drain_timeout_secs: pick(None, lookup, "RECORDER_DRAIN_TIMEOUT_SECS", 120)?,
            prune_uploaded: pick(None, lookup, "RECORDER_PRUNE_UPLOADED", false)?,
            max_slice_bytes: pick(
                args.max_slice_bytes,
                lookup,
                "RECORDER_MAX_SLICE_BYTES",
                DEFAULT_MAX_SLICE_BYTES,
            )?,
        };

        if cfg.slice_interval_ms == 0 || cfg.queue_interval_ms == 0 {
            anyhow::bail!("slice and queue intervals must be greater than zero");
        }
        if cfg.max_slice_bytes == 0 {
            anyhow::bail!("RECORDER_MAX_SLICE_BYTES must be greater than zero");
        }
        if cfg.max_retries == 0 {
            anyhow::bail!("RECORDER_MAX_RETRIES must be at least 1");
        }

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.drain {
            RunMode::Drain
        } else {
            RunMode::Serve
        };
        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            slice_interval: Duration::from_millis(self.slice_interval_ms),
            queue_interval: Duration::from_millis(self.queue_interval_ms),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            prune_uploaded: self.prune_uploaded,
        }
    }
}

/// CLI value, else environment value, else `default`.
fn pick<T>(cli: Option<T>, lookup: Lookup<'_>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("broker_url", &self.broker_url)
            .field("broker_token", &self.broker_token.as_ref().map(|_| "<redacted>"))
            .field("slice_interval_ms", &self.slice_interval_ms)
            .field("queue_interval_ms", &self.queue_interval_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .field("prune_uploaded", &self.prune_uploaded)
            .field("max_slice_bytes", &self.max_slice_bytes)
            .finish()
    }
}
