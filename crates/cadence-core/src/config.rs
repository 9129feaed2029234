//! Configuration module
//!
//! Everything is read from the environment (optionally seeded from a `.env`
//! file) with typed defaults. `Config::validate` is called once at startup by
//! the binary; library code receives the already-validated sub-configs.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::DEFAULT_WAVEFORM_POINTS;
use crate::storage_types::StorageBackend;

const DB_MAX_CONNECTIONS: u32 = 10;
const QUEUE_PROBE_TIMEOUT_MS: u64 = 2000;
const WORKER_CONCURRENCY: usize = 2;
const QUEUE_MAX_ATTEMPTS: u32 = 3;
const QUEUE_BACKOFF_BASE_SECS: u64 = 2;
const QUEUE_POLL_INTERVAL_MS: u64 = 500;
const QUEUE_RETAIN_COMPLETED: usize = 100;
const QUEUE_RETAIN_FAILED: usize = 500;
const QUEUE_LOCAL_CAPACITY: usize = 1000;
const JOB_TIMEOUT_SECS: u64 = 3600;
const LOCAL_STORAGE_PATH: &str = "./data/media";
const LOCAL_STORAGE_BASE_URL: &str = "http://localhost:4000/media";
const DEFAULT_LOG_FILTER: &str = "cadence=info";

/// Database URL scheme that selects the in-memory Upload/Track stores.
pub const MEMORY_DATABASE_URL: &str = "memory://";

/// Parse an env var, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Job queue and worker pool settings
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Broker URL. `None` means the queue starts in degraded mode.
    pub redis_url: Option<String>,
    pub disable_broker: bool,
    pub probe_timeout_ms: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub poll_interval_ms: u64,
    pub retain_completed: usize,
    pub retain_failed: usize,
    /// Bound of the in-process queue used in degraded mode.
    pub local_capacity: usize,
    pub job_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            disable_broker: false,
            probe_timeout_ms: QUEUE_PROBE_TIMEOUT_MS,
            concurrency: WORKER_CONCURRENCY,
            max_attempts: QUEUE_MAX_ATTEMPTS,
            backoff_base_secs: QUEUE_BACKOFF_BASE_SECS,
            poll_interval_ms: QUEUE_POLL_INTERVAL_MS,
            retain_completed: QUEUE_RETAIN_COMPLETED,
            retain_failed: QUEUE_RETAIN_FAILED,
            local_capacity: QUEUE_LOCAL_CAPACITY,
            job_timeout_secs: JOB_TIMEOUT_SECS,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            disable_broker: env_flag("QUEUE_DISABLE_BROKER"),
            probe_timeout_ms: env_or("QUEUE_PROBE_TIMEOUT_MS", QUEUE_PROBE_TIMEOUT_MS),
            concurrency: env_or("WORKER_CONCURRENCY", WORKER_CONCURRENCY),
            max_attempts: env_or("QUEUE_MAX_ATTEMPTS", QUEUE_MAX_ATTEMPTS),
            backoff_base_secs: env_or("QUEUE_BACKOFF_BASE_SECS", QUEUE_BACKOFF_BASE_SECS),
            poll_interval_ms: env_or("QUEUE_POLL_INTERVAL_MS", QUEUE_POLL_INTERVAL_MS),
            retain_completed: env_or("QUEUE_RETAIN_COMPLETED", QUEUE_RETAIN_COMPLETED),
            retain_failed: env_or("QUEUE_RETAIN_FAILED", QUEUE_RETAIN_FAILED),
            local_capacity: env_or("QUEUE_LOCAL_CAPACITY", QUEUE_LOCAL_CAPACITY),
            job_timeout_secs: env_or("JOB_TIMEOUT_SECS", JOB_TIMEOUT_SECS),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

/// Object storage settings
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_path: String,
    pub local_base_url: String,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    /// Custom endpoint for S3-compatible providers (MinIO etc.)
    pub s3_endpoint: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_path: LOCAL_STORAGE_PATH.to_string(),
            local_base_url: LOCAL_STORAGE_BASE_URL.to_string(),
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let backend = match env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse::<StorageBackend>()?,
            Err(_) => StorageBackend::Local,
        };

        Ok(Self {
            backend,
            local_path: env::var("LOCAL_STORAGE_PATH")
                .unwrap_or_else(|_| LOCAL_STORAGE_PATH.to_string()),
            local_base_url: env::var("LOCAL_STORAGE_BASE_URL")
                .unwrap_or_else(|_| LOCAL_STORAGE_BASE_URL.to_string()),
            s3_bucket: env::var("S3_BUCKET").ok(),
            s3_region: env::var("S3_REGION").or_else(|_| env::var("AWS_REGION")).ok(),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
        })
    }
}

/// External tool and scratch directory settings for the transcoding pipeline
#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Transcoded outputs go to `{work_dir}/{upload_id}/`; intake copies land in `{work_dir}/incoming`.
    pub work_dir: PathBuf,
    pub waveform_points: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            work_dir: env::temp_dir().join("cadence"),
            waveform_points: DEFAULT_WAVEFORM_POINTS,
        }
    }
}

impl ProcessingConfig {
    pub fn from_env() -> Self {
        Self {
            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
            work_dir: env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("cadence")),
            waveform_points: env_or("WAVEFORM_POINTS", DEFAULT_WAVEFORM_POINTS),
        }
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.work_dir.join("incoming")
    }
}

/// Logging settings
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
            environment: "development".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.trim().eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            default_filter: DEFAULT_LOG_FILTER.to_string(),
            environment: env::var("ENVIRONMENT")
                .or_else(|_| env::var("APP_ENV"))
                .unwrap_or_else(|_| "development".to_string()),
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub telemetry: TelemetryConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set (use memory:// for in-memory stores)"))?;

        Ok(Self {
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS),
            queue: QueueConfig::from_env(),
            storage: StorageConfig::from_env()?,
            processing: ProcessingConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        })
    }

    /// Whether Upload/Track records live in process memory instead of Postgres.
    pub fn uses_memory_database(&self) -> bool {
        self.database_url.starts_with(MEMORY_DATABASE_URL)
    }

    pub fn is_production(&self) -> bool {
        matches!(
            self.telemetry.environment.to_lowercase().as_str(),
            "production" | "prod"
        )
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.uses_memory_database()
            && !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a PostgreSQL connection string or {}",
                MEMORY_DATABASE_URL
            ));
        }

        if self.uses_memory_database() && self.is_production() {
            return Err(anyhow::anyhow!(
                "In-memory database is not allowed in production"
            ));
        }

        if self.queue.concurrency == 0 {
            return Err(anyhow::anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        if self.queue.max_attempts == 0 {
            return Err(anyhow::anyhow!("QUEUE_MAX_ATTEMPTS must be at least 1"));
        }

        if self.queue.local_capacity == 0 {
            return Err(anyhow::anyhow!("QUEUE_LOCAL_CAPACITY must be at least 1"));
        }

        if self.processing.waveform_points == 0 {
            return Err(anyhow::anyhow!("WAVEFORM_POINTS must be at least 1"));
        }

        match self.storage.backend {
            StorageBackend::S3 => {
                if self.storage.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if self.storage.s3_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.storage.local_path.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must not be empty when using local storage backend"
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: "memory://".to_string(),
            db_max_connections: 1,
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            processing: ProcessingConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        let config = config();
        assert!(config.uses_memory_database());
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.probe_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_unknown_database_scheme() {
        let mut config = config();
        config.database_url = "mysql://localhost/db".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn s3_requires_bucket() {
        let mut config = config();
        config.storage.backend = StorageBackend::S3;
        config.storage.s3_region = Some("eu-west-1".to_string());
        assert!(config.validate().is_err());

        config.storage.s3_bucket = Some("tracks".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = config();
        config.queue.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
