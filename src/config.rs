//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::processor::ExecutionProvider;

/// Default HTTP route prefix, kept compatible with existing clients.
pub const DEFAULT_ROUTE_PREFIX: &str = "/v1/model/facefusion";

/// Service configuration. Read once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory for uploaded source/target images.
    pub upload_dir: PathBuf,
    /// Directory the processor writes results into.
    pub output_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Prefix for every HTTP route (e.g. `/v1/model/facefusion`).
    pub route_prefix: String,
    /// Number of concurrent processor invocations (one per accelerator context).
    pub worker_slots: usize,
    /// Maximum number of queued (not yet running) tasks before load shedding.
    pub max_queue_depth: usize,
    /// Per-job processor ceiling.
    pub job_timeout: Duration,
    /// How long a finished task and its files are kept.
    pub retention: Duration,
    /// How long an expired record stays queryable before removal.
    pub expired_grace: Duration,
    /// Janitor sweep interval.
    pub janitor_interval: Duration,
    /// Maximum accepted size of a single uploaded image.
    pub max_upload_bytes: usize,
    /// Processing backend passed to the processor.
    pub execution_provider: ExecutionProvider,
    /// Path to the facefusion entry script.
    pub facefusion_script: PathBuf,
    /// Python interpreter used to run the script.
    pub python_bin: String,
    /// Ray cluster address; when set the processor is launched via `ray job submit`.
    pub ray_address: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("outputs"),
            log_dir: PathBuf::from("logs"),
            host: "0.0.0.0".to_string(),
            port: 9999,
            route_prefix: DEFAULT_ROUTE_PREFIX.to_string(),
            worker_slots: 1,
            max_queue_depth: 32,
            job_timeout: Duration::from_secs(600), // 10 minutes
            retention: Duration::from_secs(5 * 24 * 3600), // 5 days
            expired_grace: Duration::from_secs(3600), // 1 hour
            janitor_interval: Duration::from_secs(3600), // 1 hour
            max_upload_bytes: 20 * 1024 * 1024,
            execution_provider: ExecutionProvider::Cuda,
            facefusion_script: PathBuf::from("facefusion.py"),
            python_bin: "python".to_string(),
            ray_address: None,
        }
    }
}

impl ServiceConfig {
    /// Build config from environment variables, falling back to defaults.
    ///
    /// Unset variables use the default; set but unparsable values are an error
    /// rather than being silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            upload_dir: env_or("UPLOAD_DIR", defaults.upload_dir)?,
            output_dir: env_or("OUTPUT_DIR", defaults.output_dir)?,
            log_dir: env_or("LOG_DIR", defaults.log_dir)?,
            host: env_or("SERVICE_HOST", defaults.host)?,
            port: env_or("SERVICE_PORT", defaults.port)?,
            route_prefix: normalize_prefix(&env_or("ROUTE_PREFIX", defaults.route_prefix)?),
            worker_slots: env_or("WORKER_SLOTS", defaults.worker_slots)?,
            max_queue_depth: env_or("MAX_QUEUE_DEPTH", defaults.max_queue_depth)?,
            job_timeout: env_secs("JOB_TIMEOUT_SECS", defaults.job_timeout)?,
            retention: env_secs("RETENTION_SECS", defaults.retention)?,
            expired_grace: env_secs("EXPIRED_GRACE_SECS", defaults.expired_grace)?,
            janitor_interval: env_secs("JANITOR_INTERVAL_SECS", defaults.janitor_interval)?,
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            execution_provider: env_or("EXECUTION_PROVIDER", defaults.execution_provider)?,
            facefusion_script: env_or("FACEFUSION_PATH", defaults.facefusion_script)?,
            python_bin: env_or("PYTHON_BIN", defaults.python_bin)?,
            ray_address: std::env::var("RAY_ADDRESS")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the service unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_slots == 0 {
            return Err(invalid("WORKER_SLOTS", "must be at least 1"));
        }
        if self.max_queue_depth == 0 {
            return Err(invalid("MAX_QUEUE_DEPTH", "must be at least 1"));
        }
        if self.job_timeout.is_zero() {
            return Err(invalid("JOB_TIMEOUT_SECS", "must be greater than 0"));
        }
        if self.janitor_interval.is_zero() {
            return Err(invalid("JANITOR_INTERVAL_SECS", "must be greater than 0"));
        }
        if self.max_upload_bytes == 0 {
            return Err(invalid("MAX_UPLOAD_BYTES", "must be greater than 0"));
        }
        Ok(())
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("{raw:?}: {e}"))),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

/// Ensure the prefix starts with `/` and has no trailing slash (`/` becomes empty).
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
