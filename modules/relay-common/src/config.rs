use std::env;
use std::time::Duration;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Store
    pub database_url: String,
    pub pool_capacity: usize,
    pub pool_acquire_timeout: Duration,

    // Platform
    pub gateway_url: String,
    pub platform_api_url: String,
    pub platform_token: String,

    // API server
    pub api_host: String,
    pub api_port: u16,

    // Retry policy
    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,

    // Rate limiting
    pub rate_bucket_capacity: u32,
    pub rate_bucket_window: Duration,

    // Maintenance
    pub outcome_retention: Duration,

    // Dispatch
    pub partition_workers: usize,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing or malformed.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            pool_capacity: parsed_env("POOL_CAPACITY", 10),
            pool_acquire_timeout: Duration::from_millis(parsed_env(
                "POOL_ACQUIRE_TIMEOUT_MS",
                5_000,
            )),
            gateway_url: required_env("GATEWAY_URL"),
            platform_api_url: required_env("PLATFORM_API_URL"),
            platform_token: required_env("PLATFORM_TOKEN"),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parsed_env("API_PORT", 3000),
            retry_max_attempts: parsed_env("RETRY_MAX_ATTEMPTS", 5),
            retry_base: Duration::from_millis(parsed_env("RETRY_BASE_MS", 250)),
            retry_cap: Duration::from_millis(parsed_env("RETRY_CAP_MS", 30_000)),
            rate_bucket_capacity: parsed_env("RATE_BUCKET_CAPACITY", 5),
            rate_bucket_window: Duration::from_millis(parsed_env("RATE_BUCKET_WINDOW_MS", 1_000)),
            outcome_retention: Duration::from_secs(
                parsed_env("OUTCOME_RETENTION_HOURS", 72) * 3600,
            ),
            partition_workers: parsed_env("PARTITION_WORKERS", 8),
        }
    }

    /// Log the effective configuration without secrets.
    pub fn log_redacted(&self) {
        info!(
            gateway_url = %self.gateway_url,
            platform_api_url = %self.platform_api_url,
            api_host = %self.api_host,
            api_port = self.api_port,
            pool_capacity = self.pool_capacity,
            retry_max_attempts = self.retry_max_attempts,
            partition_workers = self.partition_workers,
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number, got '{raw}'")),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_env_falls_back_to_default() {
        let port: u16 = parsed_env("RELAY_TEST_UNSET_PORT", 3000);
        assert_eq!(port, 3000);
    }

    #[test]
    fn parsed_env_reads_set_values() {
        env::set_var("RELAY_TEST_SET_PORT", "8080");
        let port: u16 = parsed_env("RELAY_TEST_SET_PORT", 3000);
        assert_eq!(port, 8080);
        env::remove_var("RELAY_TEST_SET_PORT");
    }

    #[test]
    #[should_panic(expected = "must be a number")]
    fn parsed_env_panics_on_malformed_values() {
        env::set_var("RELAY_TEST_BAD_PORT", "not-a-port");
        let _: u16 = parsed_env("RELAY_TEST_BAD_PORT", 3000);
    }
}
