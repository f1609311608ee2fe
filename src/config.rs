//! Recorder configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `RECORDER_*` environment variables. Command-line overrides are applied by
//! the binaries on top of the result. API credentials are only ever read from
//! the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level recorder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub feed: FeedConfig,
    pub backoff: BackoffConfig,
    pub write_buffer: WriteBufferConfig,
    pub storage: StorageConfig,
    pub discovery: DiscoveryConfig,
    pub snapshots: SnapshotConfig,
    pub query: QueryConfig,
    pub channels: ChannelConfig,
}

/// Upstream feed connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// WebSocket endpoint. Required for live runs.
    pub ws_url: String,
    /// Request path covered by the connection signature.
    pub sign_path: String,
    #[serde(skip)]
    pub api_key_id: String,
    #[serde(skip)]
    pub api_secret: String,
    /// No inbound traffic for this long means the connection is dead.
    pub heartbeat_timeout_ms: u64,
    /// Client ping cadence.
    pub ping_interval_ms: u64,
    /// Platform-imposed cap on subscribed markets per connection.
    pub max_subscriptions: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            sign_path: "/ws/v2".to_string(),
            api_key_id: String::new(),
            api_secret: String::new(),
            heartbeat_timeout_ms: 15_000,
            ping_interval_ms: 10_000,
            max_subscriptions: 1_000,
        }
    }
}

impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("ws_url", &self.ws_url)
            .field("sign_path", &self.sign_path)
            .field("api_key_id", &self.api_key_id)
            .field("api_secret", &"[REDACTED]")
            .field("heartbeat_timeout_ms", &self.heartbeat_timeout_ms)
            .field("ping_interval_ms", &self.ping_interval_ms)
            .field("max_subscriptions", &self.max_subscriptions)
            .finish()
    }
}

impl FeedConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key_id.is_empty() && !self.api_secret.is_empty()
    }
}

/// Reconnect backoff: exponential from `initial_ms`, capped at `max_ms`,
/// with +/- `jitter` fraction applied to every delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBufferConfig {
    /// Flush once this many records are pending.
    pub max_rows: usize,
    /// Flush at least this often while anything is pending.
    pub flush_interval_ms: u64,
    /// Bound of the queue feeding the buffer.
    pub queue_capacity: usize,
    /// Failed flush attempts before a batch is dropped.
    pub max_retries: u32,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            max_rows: 500,
            flush_interval_ms: 2_000,
            queue_capacity: 10_000,
            max_retries: 5,
        }
    }
}

impl WriteBufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/orderbook_history.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Subscribe to newly created markets automatically.
    pub auto_subscribe: bool,
    /// Only markets whose ticker starts with one of these are eligible.
    /// Empty means every market is eligible.
    pub ticker_prefixes: Vec<String>,
    /// Markets subscribed at startup regardless of discovery.
    pub seed_tickers: Vec<String>,
    /// Resubscribe markets persisted as active by a previous run.
    pub restore_active: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            ticker_prefixes: Vec::new(),
            seed_tickers: Vec::new(),
            restore_active: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn is_eligible(&self, ticker: &str) -> bool {
        self.ticker_prefixes.is_empty()
            || self.ticker_prefixes.iter().any(|p| ticker.starts_with(p.as_str()))
    }
}

/// Periodic snapshot materialization. Disabled unless an interval is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub materialize_interval_secs: Option<u64>,
}

impl SnapshotConfig {
    pub fn materialize_interval(&self) -> Option<Duration> {
        self.materialize_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Default reconstruction timeout.
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Raw frames from the connection to the processor.
    pub frame_capacity: usize,
    /// Subscribe/unsubscribe commands to the connection.
    pub command_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 10_000,
            command_capacity: 1_024,
        }
    }
}

impl RecorderConfig {
    /// Defaults overlaid with an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `RECORDER_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RECORDER_WS_URL") {
            self.feed.ws_url = v;
        }
        if let Some(v) = lookup("RECORDER_SIGN_PATH") {
            self.feed.sign_path = v;
        }
        if let Some(v) = lookup("RECORDER_API_KEY_ID") {
            self.feed.api_key_id = v.trim().to_string();
        }
        if let Some(v) = lookup("RECORDER_API_SECRET") {
            self.feed.api_secret = v.trim().to_string();
        }
        if let Some(v) = lookup("RECORDER_DB_PATH") {
            self.storage.db_path = v;
        }
        if let Some(v) = lookup("RECORDER_HEARTBEAT_TIMEOUT_MS") {
            self.feed.heartbeat_timeout_ms = parse_env("RECORDER_HEARTBEAT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_MAX_SUBSCRIPTIONS") {
            self.feed.max_subscriptions = parse_env("RECORDER_MAX_SUBSCRIPTIONS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_BACKOFF_INITIAL_MS") {
            self.backoff.initial_ms = parse_env("RECORDER_BACKOFF_INITIAL_MS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_BACKOFF_MAX_MS") {
            self.backoff.max_ms = parse_env("RECORDER_BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_FLUSH_MAX_ROWS") {
            self.write_buffer.max_rows = parse_env("RECORDER_FLUSH_MAX_ROWS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_FLUSH_INTERVAL_MS") {
            self.write_buffer.flush_interval_ms = parse_env("RECORDER_FLUSH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_SNAPSHOT_INTERVAL_SECS") {
            self.snapshots.materialize_interval_secs =
                Some(parse_env("RECORDER_SNAPSHOT_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = lookup("RECORDER_QUERY_TIMEOUT_MS") {
            self.query.timeout_ms = parse_env("RECORDER_QUERY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RECORDER_SEED_TICKERS") {
            self.discovery.seed_tickers = split_list(&v);
        }
        if let Some(v) = lookup("RECORDER_TICKER_PREFIXES") {
            self.discovery.ticker_prefixes = split_list(&v);
        }
        Ok(())
    }

    /// Reject configurations the recorder cannot run with.
    ///
    /// `live` additionally requires feed credentials.
    pub fn validate(&self, live: bool) -> Result<(), ConfigError> {
        if live && !self.feed.ws_url.starts_with("ws") {
            return Err(ConfigError::Invalid(format!(
                "feed.ws_url must be a ws:// or wss:// url, got {:?}",
                self.feed.ws_url
            )));
        }
        if live && !self.feed.has_credentials() {
            return Err(ConfigError::Invalid(
                "RECORDER_API_KEY_ID and RECORDER_API_SECRET must be set".to_string(),
            ));
        }
        if self.feed.heartbeat_timeout_ms == 0 || self.feed.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat timeout and ping interval must be non-zero".to_string(),
            ));
        }
        if self.feed.max_subscriptions == 0 {
            return Err(ConfigError::Invalid("max_subscriptions must be non-zero".to_string()));
        }
        if self.backoff.initial_ms == 0 || self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff bounds inverted or zero: initial={}ms max={}ms",
                self.backoff.initial_ms, self.backoff.max_ms
            )));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff jitter must be in [0, 1): {}",
                self.backoff.jitter
            )));
        }
        if self.write_buffer.max_rows == 0
            || self.write_buffer.flush_interval_ms == 0
            || self.write_buffer.queue_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "write buffer thresholds must be non-zero".to_string(),
            ));
        }
        if self.channels.frame_capacity == 0 || self.channels.command_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid_offline() {
        let config = RecorderConfig::default();
        assert!(config.validate(false).is_ok());
        assert!(config.validate(true).is_err());
        assert_eq!(config.feed.heartbeat_timeout(), Duration::from_secs(15));
        assert!(config.snapshots.materialize_interval().is_none());
    }

    #[test]
    fn test_toml_partial_override() {
        let config = RecorderConfig::from_toml(
            r#"
            [write_buffer]
            max_rows = 1000

            [snapshots]
            materialize_interval_secs = 300

            [discovery]
            ticker_prefixes = ["PRES", "FED"]
            "#,
        )
        .unwrap();

        assert_eq!(config.write_buffer.max_rows, 1000);
        assert_eq!(config.write_buffer.flush_interval_ms, 2_000);
        assert_eq!(
            config.snapshots.materialize_interval(),
            Some(Duration::from_secs(300))
        );
        assert!(config.discovery.is_eligible("FED-25DEC"));
        assert!(!config.discovery.is_eligible("NBA-LAL"));
    }

    #[test]
    fn test_toml_cannot_carry_secrets() {
        let config = RecorderConfig::from_toml(
            r#"
            [feed]
            api_secret = "leaked"
            "#,
        )
        .unwrap();
        assert!(config.feed.api_secret.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RecorderConfig::default();
        config
            .apply_env(env(&[
                ("RECORDER_WS_URL", "wss://feed.test/ws/v2"),
                ("RECORDER_API_KEY_ID", "key-1"),
                ("RECORDER_API_SECRET", " secret "),
                ("RECORDER_FLUSH_MAX_ROWS", "750"),
                ("RECORDER_SEED_TICKERS", "A, B,,C"),
            ]))
            .unwrap();

        assert_eq!(config.feed.api_key_id, "key-1");
        assert_eq!(config.feed.api_secret, "secret");
        assert_eq!(config.write_buffer.max_rows, 750);
        assert_eq!(config.discovery.seed_tickers, vec!["A", "B", "C"]);
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = RecorderConfig::default();
        let err = config
            .apply_env(env(&[("RECORDER_FLUSH_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "RECORDER_FLUSH_INTERVAL_MS", .. }));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = RecorderConfig::default();
        config.backoff.initial_ms = 60_000;
        config.backoff.max_ms = 1_000;
        assert!(config.validate(false).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut config = RecorderConfig::default();
        config.feed.api_secret = "hunter2".to_string();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
