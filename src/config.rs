use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};
use uuid::Uuid;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Externally reachable base URL embedded in presigned grants.
    pub public_url: String,
    pub signing_secret: String,
    pub default_expires_in_secs: u64,
    pub deletion_check_delay_secs: u64,
    pub task_poll_interval_ms: u64,
    pub task_max_attempts: u32,
    pub task_retry_base_secs: u64,
}

// Keeps the signing secret out of startup logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_url", &self.public_url)
            .field("signing_secret", &"<redacted>")
            .field("default_expires_in_secs", &self.default_expires_in_secs)
            .field("deletion_check_delay_secs", &self.deletion_check_delay_secs)
            .field("task_poll_interval_ms", &self.task_poll_interval_ms)
            .field("task_max_attempts", &self.task_max_attempts)
            .field("task_retry_base_secs", &self.task_retry_base_secs)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object storage metadata and lifecycle control plane")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where the local blob store keeps payloads (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL used in presigned links (overrides OBJECT_STORE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Default lifetime of presigned grants in seconds (overrides OBJECT_STORE_DEFAULT_EXPIRES_IN)
    #[arg(long)]
    pub default_expires_in: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Values the object and bucket services need at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Grant lifetime used when a caller does not pass one.
    pub default_expires_in: Duration,
    /// How long after a delete its compensating check fires.
    pub deletion_check_delay: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_expires_in: Duration::from_secs(3600),
            deletion_check_delay: Duration::from_secs(60),
        }
    }
}

/// Settings for the outbox task worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Sleep between polls when no task is due.
    pub poll_interval: Duration,
    /// Attempts before a task is discarded.
    pub max_attempts: u32,
    /// First retry delay; doubles with every further attempt.
    pub retry_base_delay: Duration,
    /// Upper bound for a single retry delay.
    pub retry_max_delay: Duration,
    /// How long a claimed task stays invisible to other workers.
    pub lease: Duration,
    /// Tasks claimed per poll.
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 10,
            retry_base_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(15 * 60),
            lease: Duration::from_secs(60),
            batch_size: 32,
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("OBJECT_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("OBJECT_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("OBJECT_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OBJECT_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_store.db".into());
        let env_expires = env_or("OBJECT_STORE_DEFAULT_EXPIRES_IN", 3600u64)?;

        let port = args.port.unwrap_or(env_port);
        let env_public = env::var("OBJECT_STORE_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{port}"));

        let signing_secret = match env::var("OBJECT_STORE_SIGNING_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => secret,
            _ => {
                tracing::warn!(
                    "OBJECT_STORE_SIGNING_SECRET not set; presigned URLs will not survive a restart"
                );
                Uuid::new_v4().simple().to_string()
            }
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args.public_url.unwrap_or(env_public),
            signing_secret,
            default_expires_in_secs: args.default_expires_in.unwrap_or(env_expires),
            deletion_check_delay_secs: env_or("OBJECT_STORE_DELETION_CHECK_DELAY", 60u64)?,
            task_poll_interval_ms: env_or("OBJECT_STORE_TASK_POLL_INTERVAL_MS", 1000u64)?,
            task_max_attempts: env_or("OBJECT_STORE_TASK_MAX_ATTEMPTS", 10u32)?,
            task_retry_base_secs: env_or("OBJECT_STORE_TASK_RETRY_BASE", 5u64)?,
        };

        if cfg.default_expires_in_secs == 0 {
            anyhow::bail!("default presign expiry must be greater than 0");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            default_expires_in: Duration::from_secs(self.default_expires_in_secs),
            deletion_check_delay: Duration::from_secs(self.deletion_check_delay_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.task_poll_interval_ms.max(1)),
            max_attempts: self.task_max_attempts.max(1),
            retry_base_delay: Duration::from_secs(self.task_retry_base_secs),
            ..WorkerConfig::default()
        }
    }
}

/// Read and parse `key`, falling back to `default` when it is unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
