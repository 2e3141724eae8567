use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryConfig;
use crate::types::ChainTag;
use crate::watcher::WatcherConfig;

/// Main configuration for the relayer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub store: StoreConfig,
    pub retry: RetrySettings,
    pub relayer: RelayerConfig,
}

/// Source ledger (where deposits burn)
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub rpc_url: String,
    pub bridge_address: String,
    #[serde(default = "default_finality_blocks")]
    pub finality_blocks: u64,
    #[serde(default = "default_catch_up_window")]
    pub catch_up_window: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Destination ledger (where fulfillments mint)
#[derive(Clone, Deserialize)]
pub struct DestinationConfig {
    pub rpc_url: String,
    pub bridge_address: String,
    pub relayer_key: String,
    /// Only deposits routed to this tag are relayed
    #[serde(default)]
    pub chain_tag: Option<u64>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_submission_timeout")]
    pub submission_timeout_secs: u64,
}

/// Custom Debug that redacts relayer_key to prevent accidental log leakage.
impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("rpc_url", &self.rpc_url)
            .field("bridge_address", &self.bridge_address)
            .field("relayer_key", &"<redacted>")
            .field("chain_tag", &self.chain_tag)
            .field("confirmations", &self.confirmations)
            .field("submission_timeout_secs", &self.submission_timeout_secs)
            .finish()
    }
}

/// Where deposit records live
#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    /// Postgres store when set, file store otherwise
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<redacted>"),
            )
            .field("state_path", &self.state_path)
            .finish()
    }
}

/// Fulfillment retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub backoff_multiplier: f64,
}

/// Process-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: SocketAddr,
}

/// Default functions
fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_finality_blocks() -> u64 {
    1
}

fn default_catch_up_window() -> u64 {
    1000
}

fn default_max_block_range() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_confirmations() -> u64 {
    1
}

fn default_submission_timeout() -> u64 {
    120
}

fn default_state_path() -> PathBuf {
    PathBuf::from("relayer_state.json")
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_initial_backoff() -> u64 {
    2000
}

fn default_retry_max_backoff() -> u64 {
    60_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_api_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

/// Read and parse an optional variable; a present but malformed value is an error
fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{} is invalid: {}", key, e)),
        _ => Ok(None),
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn is_hex_of_len(value: &str, hex_len: usize) -> bool {
    value
        .strip_prefix("0x")
        .map(|hex| hex.len() == hex_len && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let shared_bridge = env_string("BRIDGE_ADDRESS");

        let source = SourceConfig {
            rpc_url: env_string("SRC_RPC_URL").unwrap_or_else(default_rpc_url),
            bridge_address: env_string("SRC_BRIDGE")
                .or_else(|| shared_bridge.clone())
                .ok_or_else(|| eyre!("SRC_BRIDGE (or BRIDGE_ADDRESS) environment variable is required"))?,
            finality_blocks: parse_env("FINALITY_BLOCKS")?.unwrap_or(default_finality_blocks()),
            catch_up_window: parse_env("CATCH_UP_WINDOW")?.unwrap_or(default_catch_up_window()),
            max_block_range: parse_env("MAX_BLOCK_RANGE")?.unwrap_or(default_max_block_range()),
            poll_interval_ms: parse_env("POLL_INTERVAL_MS")?.unwrap_or(default_poll_interval()),
        };

        let destination = DestinationConfig {
            rpc_url: env_string("DST_RPC_URL").unwrap_or_else(default_rpc_url),
            bridge_address: env_string("DST_BRIDGE")
                .or(shared_bridge)
                .ok_or_else(|| eyre!("DST_BRIDGE (or BRIDGE_ADDRESS) environment variable is required"))?,
            relayer_key: env_string("RELAYER_KEY")
                .ok_or_else(|| eyre!("RELAYER_KEY environment variable is required"))?,
            chain_tag: parse_env("DST_CHAIN_TAG")?,
            confirmations: parse_env("CONFIRMATIONS")?.unwrap_or(default_confirmations()),
            submission_timeout_secs: parse_env("SUBMISSION_TIMEOUT_SECS")?
                .unwrap_or(default_submission_timeout()),
        };

        let store = StoreConfig {
            database_url: env_string("DATABASE_URL"),
            state_path: env_string("STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_path),
        };

        let retry = RetrySettings {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS")?.unwrap_or(default_retry_max_attempts()),
            initial_backoff_ms: parse_env("RETRY_INITIAL_BACKOFF_MS")?
                .unwrap_or(default_retry_initial_backoff()),
            max_backoff_ms: parse_env("RETRY_MAX_BACKOFF_MS")?
                .unwrap_or(default_retry_max_backoff()),
            backoff_multiplier: parse_env("RETRY_BACKOFF_MULTIPLIER")?
                .unwrap_or(default_retry_multiplier()),
        };

        let relayer = RelayerConfig {
            worker_concurrency: parse_env("WORKER_CONCURRENCY")?
                .unwrap_or(default_worker_concurrency()),
            api_bind_addr: parse_env("API_BIND_ADDR")?.unwrap_or(default_api_bind_addr()),
        };

        let config = Config {
            source,
            destination,
            store,
            retry,
            relayer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.source.rpc_url.is_empty() || self.destination.rpc_url.is_empty() {
            return Err(eyre!("RPC URLs cannot be empty"));
        }

        if !is_hex_of_len(&self.source.bridge_address, 40) {
            return Err(eyre!(
                "source.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }
        if !is_hex_of_len(&self.destination.bridge_address, 40) {
            return Err(eyre!(
                "destination.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if !is_hex_of_len(&self.destination.relayer_key, 64) {
            return Err(eyre!("RELAYER_KEY must be 66 chars (0x + 64 hex chars)"));
        }

        if self.source.max_block_range == 0 {
            return Err(eyre!("MAX_BLOCK_RANGE must be at least 1"));
        }
        if self.destination.confirmations == 0 {
            return Err(eyre!("CONFIRMATIONS must be at least 1"));
        }
        if self.destination.submission_timeout_secs == 0 {
            return Err(eyre!("SUBMISSION_TIMEOUT_SECS must be at least 1"));
        }

        if self.retry.max_attempts == 0 {
            return Err(eyre!("RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(eyre!("RETRY_BACKOFF_MULTIPLIER cannot be below 1.0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(eyre!(
                "RETRY_INITIAL_BACKOFF_MS cannot exceed RETRY_MAX_BACKOFF_MS"
            ));
        }

        if self.relayer.worker_concurrency == 0 {
            return Err(eyre!("WORKER_CONCURRENCY must be at least 1"));
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            catch_up_window: self.source.catch_up_window,
            max_block_range: self.source.max_block_range,
            poll_interval: Duration::from_millis(self.source.poll_interval_ms),
            ..WatcherConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            dest_chain_tag: self.destination.chain_tag.map(ChainTag),
            worker_concurrency: self.relayer.worker_concurrency,
            retry: self.retry_config(),
            watcher: self.watcher_config(),
        }
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.destination.submission_timeout_secs)
    }
}
