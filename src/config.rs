//! Process-wide tunables (§4.I). Loaded from the environment with the
//! `RUNTRACE_` prefix; there is no dynamic `configure(key, value)` escape
//! hatch here -- `Config` is a typed struct, so unknown keys are a compile
//! error rather than a runtime one.

use std::path::PathBuf;
use std::time::Duration;

/// SDK configuration settings, seeded with the same defaults as the base
/// system and overridable via `RUNTRACE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_url: String,
    pub api_key: Option<String>,

    pub batch_size: usize,
    pub batch_max_bytes: usize,
    pub batch_timeout_ms: u64,
    pub queue_size: usize,

    pub coalesce_metrics: bool,
    pub dedupe_params: bool,
    pub dedupe_tags: bool,

    pub compression_enabled: bool,
    pub compression_level: u32,
    pub compression_min_bytes: usize,

    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff: f64,
    pub retry_max_delay_ms: u64,

    pub offline_mode: bool,
    pub spool_enabled: bool,
    pub spool_dir: PathBuf,
    pub spool_max_size_bytes: u64,
    pub spool_max_file_size_bytes: u64,
    pub spool_sync_interval_ms: u64,
    pub spool_retention_hours: u64,

    pub health_check_interval_ms: u64,
    pub connection_timeout_ms: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_url: "http://localhost:3001".to_string(),
            api_key: None,

            batch_size: 1000,
            batch_max_bytes: 1_000_000,
            batch_timeout_ms: 1000,
            queue_size: 10_000,

            coalesce_metrics: true,
            dedupe_params: true,
            dedupe_tags: true,

            compression_enabled: true,
            compression_level: 6,
            compression_min_bytes: 1000,

            max_retries: 3,
            retry_delay_ms: 1000,
            retry_backoff: 2.0,
            retry_max_delay_ms: 30_000,

            offline_mode: false,
            spool_enabled: true,
            spool_dir: default_spool_dir(),
            spool_max_size_bytes: 100_000_000,
            spool_max_file_size_bytes: 10_000_000,
            spool_sync_interval_ms: 5000,
            spool_retention_hours: 72,

            health_check_interval_ms: 10_000,
            connection_timeout_ms: 5000,

            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from `RUNTRACE_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            server_url: env_string("RUNTRACE_SERVER_URL", &defaults.server_url),
            api_key: std::env::var("RUNTRACE_API_KEY").ok(),

            batch_size: env_parsed("RUNTRACE_BATCH_SIZE", defaults.batch_size),
            batch_max_bytes: env_parsed("RUNTRACE_BATCH_MAX_BYTES", defaults.batch_max_bytes),
            batch_timeout_ms: env_parsed("RUNTRACE_BATCH_TIMEOUT_MS", defaults.batch_timeout_ms),
            queue_size: env_parsed("RUNTRACE_QUEUE_SIZE", defaults.queue_size),

            coalesce_metrics: env_truthy("RUNTRACE_COALESCE_METRICS", defaults.coalesce_metrics),
            dedupe_params: env_truthy("RUNTRACE_DEDUPE_PARAMS", defaults.dedupe_params),
            dedupe_tags: env_truthy("RUNTRACE_DEDUPE_TAGS", defaults.dedupe_tags),

            compression_enabled: env_truthy("RUNTRACE_COMPRESSION", defaults.compression_enabled),
            compression_level: env_parsed("RUNTRACE_COMPRESSION_LEVEL", defaults.compression_level),
            compression_min_bytes: env_parsed(
                "RUNTRACE_COMPRESSION_MIN_BYTES",
                defaults.compression_min_bytes,
            ),

            max_retries: env_parsed("RUNTRACE_MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: env_parsed("RUNTRACE_RETRY_DELAY_MS", defaults.retry_delay_ms),
            retry_backoff: defaults.retry_backoff,
            retry_max_delay_ms: env_parsed(
                "RUNTRACE_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            ),

            offline_mode: env_truthy("RUNTRACE_OFFLINE", false),
            spool_enabled: env_truthy("RUNTRACE_SPOOL_ENABLED", defaults.spool_enabled),
            spool_dir: std::env::var("RUNTRACE_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
            spool_max_size_bytes: env_parsed(
                "RUNTRACE_SPOOL_MAX_SIZE",
                defaults.spool_max_size_bytes,
            ),
            spool_max_file_size_bytes: env_parsed(
                "RUNTRACE_SPOOL_MAX_FILE_SIZE",
                defaults.spool_max_file_size_bytes,
            ),
            spool_sync_interval_ms: env_parsed(
                "RUNTRACE_SPOOL_SYNC_INTERVAL_MS",
                defaults.spool_sync_interval_ms,
            ),
            spool_retention_hours: env_parsed(
                "RUNTRACE_SPOOL_RETENTION_HOURS",
                defaults.spool_retention_hours,
            ),

            health_check_interval_ms: env_parsed(
                "RUNTRACE_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval_ms,
            ),
            connection_timeout_ms: env_parsed(
                "RUNTRACE_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout_ms,
            ),

            debug: env_truthy("RUNTRACE_DEBUG", false),
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_truthy(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn default_spool_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".runtrace").join("spool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_base_config() {
        let config = Config::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.queue_size, 10_000);
        assert!(config.coalesce_metrics);
        assert!(config.spool_enabled);
    }

    #[test]
    fn from_env_overrides_batch_size() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("RUNTRACE_BATCH_SIZE", "42");
        let config = Config::from_env();
        std::env::remove_var("RUNTRACE_BATCH_SIZE");
        assert_eq!(config.batch_size, 42);
    }

    #[test]
    fn truthy_parsing_accepts_yes_and_one() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("RUNTRACE_DEBUG", "YES");
        assert!(env_truthy("RUNTRACE_DEBUG", false));
        std::env::set_var("RUNTRACE_DEBUG", "1");
        assert!(env_truthy("RUNTRACE_DEBUG", false));
        std::env::set_var("RUNTRACE_DEBUG", "no");
        assert!(!env_truthy("RUNTRACE_DEBUG", true));
        std::env::remove_var("RUNTRACE_DEBUG");
    }
}
