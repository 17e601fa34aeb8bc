use serde::{Deserialize, Serialize};
use std::{env, fmt, fs, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

use crate::source::{DataSource, LiveSourceConfig};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppConfig {
    pub database_url: String,
    pub eth_rpc_url: String,
    pub api_port: u16,
    pub start_block: Option<u64>,
    pub initial_backfill: u64,
    pub blocks_per_batch: usize,
    pub poll_interval_ms: u64,
    pub max_concurrent_requests: usize,
    pub rpc_min_interval_ms: u64,
    pub source_timeout_ms: u64,
    pub fetch_max_retries: usize,
    pub fetch_retry_min_delay_ms: u64,
    pub fetch_retry_max_delay_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub replay_fixture: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load environment variables: {0}")]
    EnvError(#[from] dotenvy::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Read an environment variable and parse it, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./data/analytics.db".to_string(),
            eth_rpc_url: "http://localhost:8545".to_string(),
            api_port: 8080,
            start_block: None,
            initial_backfill: 5,
            blocks_per_batch: 10,
            poll_interval_ms: 2_000,
            max_concurrent_requests: 5,
            rpc_min_interval_ms: 0,
            source_timeout_ms: 10_000,
            fetch_max_retries: 3,
            fetch_retry_min_delay_ms: 500,
            fetch_retry_max_delay_ms: 5_000,
            subscriber_queue_capacity: 256,
            replay_fixture: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore error if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let data_source = env::var("DATA_SOURCE").unwrap_or_else(|_| "live".to_string());
        let replay_fixture = match data_source.as_str() {
            "live" => None,
            "replay" => Some(PathBuf::from(
                env::var("REPLAY_FIXTURE")
                    .map_err(|_| ConfigError::MissingEnv("REPLAY_FIXTURE".to_string()))?,
            )),
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "DATA_SOURCE must be 'live' or 'replay', got '{}'",
                    other
                )))
            }
        };

        let config = Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            eth_rpc_url: env::var("ETH_RPC_URL").unwrap_or(defaults.eth_rpc_url),
            api_port: env_or("API_PORT", defaults.api_port)?,
            start_block: env::var("START_BLOCK").ok().and_then(|b| b.parse().ok()),
            initial_backfill: env_or("INITIAL_BACKFILL", defaults.initial_backfill)?,
            blocks_per_batch: env_or("BLOCKS_PER_BATCH", defaults.blocks_per_batch)?,
            poll_interval_ms: env_or("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            max_concurrent_requests: env_or(
                "MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
            rpc_min_interval_ms: env_or("RPC_MIN_INTERVAL_MS", defaults.rpc_min_interval_ms)?,
            source_timeout_ms: env_or("SOURCE_TIMEOUT_MS", defaults.source_timeout_ms)?,
            fetch_max_retries: env_or("FETCH_MAX_RETRIES", defaults.fetch_max_retries)?,
            fetch_retry_min_delay_ms: env_or(
                "FETCH_RETRY_MIN_DELAY_MS",
                defaults.fetch_retry_min_delay_ms,
            )?,
            fetch_retry_max_delay_ms: env_or(
                "FETCH_RETRY_MAX_DELAY_MS",
                defaults.fetch_retry_max_delay_ms,
            )?,
            subscriber_queue_capacity: env_or(
                "SUBSCRIBER_QUEUE_CAPACITY",
                defaults.subscriber_queue_capacity,
            )?,
            replay_fixture,
        };

        // Ensure data directory exists
        if config.database_url.starts_with("sqlite:") {
            let path = crate::database::sqlite_path(&config.database_url);
            if !path.starts_with(":memory:") {
                if let Some(dir) = std::path::Path::new(path).parent() {
                    fs::create_dir_all(dir).map_err(|e| {
                        ConfigError::InvalidValue(format!(
                            "Failed to create directory for database: {}",
                            e
                        ))
                    })?;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that the services rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_fixture.is_none()
            && !self.eth_rpc_url.starts_with("http")
            && !self.eth_rpc_url.starts_with("ws")
        {
            return Err(ConfigError::InvalidValue(
                "ETH_RPC_URL must start with http:// or ws://".to_string(),
            ));
        }

        if self.blocks_per_batch == 0 {
            return Err(ConfigError::InvalidValue(
                "BLOCKS_PER_BATCH must be at least 1".to_string(),
            ));
        }

        if self.subscriber_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "SUBSCRIBER_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }

        if self.source_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "SOURCE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        if self.fetch_retry_min_delay_ms > self.fetch_retry_max_delay_ms {
            return Err(ConfigError::InvalidValue(
                "FETCH_RETRY_MIN_DELAY_MS must not exceed FETCH_RETRY_MAX_DELAY_MS".to_string(),
            ));
        }

        Ok(())
    }

    /// The block source strategy selected by this configuration
    pub fn data_source(&self) -> DataSource {
        match &self.replay_fixture {
            Some(path) => DataSource::Replay(path.clone()),
            None => DataSource::Live(LiveSourceConfig {
                rpc_url: self.eth_rpc_url.clone(),
                max_concurrent_requests: self.max_concurrent_requests,
                min_interval_ms: self.rpc_min_interval_ms,
            }),
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl fmt::Display for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.replay_fixture {
            Some(path) => format!("replay({})", path.display()),
            None => format!("live({})", self.eth_rpc_url),
        };
        write!(
            f,
            "AppConfig {{ database_url: {}, source: {}, api_port: {}, start_block: {:?}, blocks_per_batch: {} }}",
            self.database_url, source, self.api_port, self.start_block, self.blocks_per_batch
        )
    }
}
