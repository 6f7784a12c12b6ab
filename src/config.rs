use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::queue::worker::WorkerSettings;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MnemosConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub consolidator: ConsolidatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live connections per database file.
    pub size: usize,
    /// How long `get_connection` waits for a free connection before failing.
    pub timeout_secs: f64,
    /// SQLite busy timeout applied to every connection.
    pub busy_timeout_ms: u64,
    /// Page cache size in KiB (applied as a negative `cache_size`).
    pub cache_size_kib: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BreakerConfig {
    /// Name of the breaker guarding the reasoning backend.
    pub backend: String,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry delays indexed by attempt number; the last entry repeats.
    pub backoff_schedule_secs: Vec<u64>,
    /// Failures after which an entry is abandoned. `0` retries forever.
    pub max_retries: u32,
    pub cleanup_days: u32,
    /// `processing` entries older than this are assumed orphaned by a dead worker.
    pub stale_after_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_sessions: usize,
    pub timeout_per_session_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ConsolidatorConfig {
    /// Program invoked as `command [args...] <session_path>`.
    pub command: String,
    pub args: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_mnemos_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            timeout_secs: 30.0,
            busy_timeout_ms: 5000,
            cache_size_kib: 64000,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            backend: "llm".into(),
            failure_threshold: 5,
            recovery_timeout_secs: 600.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_schedule_secs: vec![300, 900, 2700, 7200, 21600],
            max_retries: 8,
            cleanup_days: 30,
            stale_after_secs: 3600,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            timeout_per_session_secs: 300,
            poll_interval_secs: 30,
        }
    }
}

/// Seconds as a `Duration`; negative and NaN clamp to zero, overflow saturates.
fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn check_secs(field: &str, secs: f64) -> Result<()> {
    if !secs.is_finite() || secs < 0.0 {
        bail!("{field} must be a finite, non-negative number of seconds (got {secs})");
    }
    Ok(())
}

impl PoolConfig {
    pub fn timeout(&self) -> Duration {
        secs_f64(self.timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        secs_f64(self.recovery_timeout_secs)
    }
}

impl WorkerConfig {
    pub fn timeout_per_session(&self) -> Duration {
        Duration::from_secs(self.timeout_per_session_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Returns `~/.mnemos/`
pub fn default_mnemos_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mnemos")
}

/// Returns the default config file path: `~/.mnemos/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnemos_dir().join("config.toml")
}

impl MnemosConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemosConfig::default()
        };

        config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would panic or deadlock later rather than at startup.
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            bail!("[pool] size must be at least 1");
        }
        check_secs("[pool] timeout_secs", self.pool.timeout_secs)?;
        check_secs("[breaker] recovery_timeout_secs", self.breaker.recovery_timeout_secs)?;
        if self.breaker.failure_threshold == 0 {
            bail!("[breaker] failure_threshold must be at least 1");
        }
        if self.breaker.backend.trim().is_empty() {
            bail!("[breaker] backend must name a breaker");
        }
        WorkerSettings::from_config(self).validate()
    }

    /// Apply environment variable overrides (MNEMOS_DB, MNEMOS_LOG_LEVEL, MNEMOS_POOL_SIZE).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMOS_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMOS_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MNEMOS_POOL_SIZE") {
            match val.parse::<usize>() {
                Ok(size) if size > 0 => self.pool.size = size,
                _ => tracing::warn!(value = %val, "ignoring invalid MNEMOS_POOL_SIZE"),
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MnemosConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.recovery_timeout(), Duration::from_secs(600));
        assert_eq!(config.queue.backoff_schedule_secs.len(), 5);
        assert!(config.storage.db_path.ends_with("memory.db"));
        assert!(config.consolidator.command.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[logging]
level = "debug"

[storage]
db_path = "/tmp/test.db"

[breaker]
failure_threshold = 3

[queue]
backoff_schedule_secs = [10, 20]
max_retries = 0

[consolidator]
command = "consolidate"
args = ["--json"]
"#;
        let config: MnemosConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.queue.backoff_schedule_secs, vec![10, 20]);
        assert_eq!(config.queue.max_retries, 0);
        assert_eq!(config.consolidator.args, vec!["--json".to_string()]);
        // defaults still apply for unset fields
        assert_eq!(config.breaker.backend, "llm");
        assert_eq!(config.pool.busy_timeout_ms, 5000);
        assert_eq!(config.worker.max_sessions, 10);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MnemosConfig::default();
        std::env::set_var("MNEMOS_DB", "/tmp/override.db");
        std::env::set_var("MNEMOS_LOG_LEVEL", "trace");
        std::env::set_var("MNEMOS_POOL_SIZE", "9");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.pool.size, 9);

        // Clean up
        std::env::remove_var("MNEMOS_DB");
        std::env::remove_var("MNEMOS_LOG_LEVEL");
        std::env::remove_var("MNEMOS_POOL_SIZE");
    }

    #[test]
    fn defaults_pass_validation() {
        MnemosConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let config: MnemosConfig = toml::from_str("[pool]\nsize = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[pool] size"));
    }

    #[test]
    fn infinite_timeouts_are_rejected_not_panicking() {
        let config: MnemosConfig = toml::from_str("[pool]\ntimeout_secs = inf\n").unwrap();
        assert!(config.validate().is_err());
        assert_eq!(config.pool.timeout(), Duration::MAX);

        let config: MnemosConfig =
            toml::from_str("[breaker]\nrecovery_timeout_secs = nan\n").unwrap();
        assert!(config.validate().is_err());
        assert_eq!(config.breaker.recovery_timeout(), Duration::ZERO);
    }

    #[test]
    fn zero_failure_threshold_is_rejected() {
        let config: MnemosConfig = toml::from_str("[breaker]\nfailure_threshold = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn stale_age_must_outlast_the_session_timeout() {
        let config: MnemosConfig = toml::from_str(
            "[worker]\ntimeout_per_session_secs = 7200\n[queue]\nstale_after_secs = 3600\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_after"));
    }

    #[test]
    fn load_from_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[breaker]\nfailure_threshold = 0\n").unwrap();
        let err = MnemosConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failure_threshold"));
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/mnemos.db"), PathBuf::from("/var/lib/mnemos.db"));
    }
}
