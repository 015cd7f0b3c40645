//! Configuration module for the news ingest service
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then environment variables (a `.env` file is honoured), then command
//! line flags applied by `main`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Feed provider credentials and endpoints
    #[serde(default)]
    pub alpaca: AlpacaConfig,

    /// Datastore connection
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Pre-flight probe policy
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Streaming session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AlpacaConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// REST base URL used by the probe
    #[serde(default = "default_data_url")]
    pub data_url: String,

    /// Websocket URL of the news stream
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default)]
    pub dbname: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub host: String,

    /// Required; there is no implicit 5432
    #[serde(default)]
    pub port: Option<u16>,

    /// Target table, optionally schema-qualified
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connect and per-insert timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Total attempts before giving up
    #[serde(default = "default_probe_attempts")]
    pub max_attempts: u32,

    /// Delay unit of the linear backoff (attempt n waits n * base)
    #[serde(default = "default_probe_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_probe_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Buffer between the feed reader and the pipeline
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Upper bound for finishing in-flight work after an interrupt
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,

    /// Local retries of an `Unavailable` insert (0 disables)
    #[serde(default = "default_persist_retry_attempts")]
    pub persist_retry_attempts: u32,

    #[serde(default = "default_persist_retry_delay")]
    pub persist_retry_delay_ms: u64,

    /// Re-probe and resubscribe when the transport drops
    #[serde(default)]
    pub reconnect_on_drop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Serve /metrics and /health
    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_data_url() -> String { "https://data.alpaca.markets".to_string() }
fn default_stream_url() -> String { "wss://stream.data.alpaca.markets/v1beta1/news".to_string() }
fn default_table() -> String { "news_updates".to_string() }
fn default_pool_size() -> usize { 4 }
fn default_query_timeout() -> u64 { 10 }
fn default_probe_attempts() -> u32 { 5 }
fn default_probe_base_delay() -> u64 { 5 }
fn default_probe_request_timeout() -> u64 { 10 }
fn default_channel_capacity() -> usize { 1024 }
fn default_drain_grace() -> u64 { 10 }
fn default_persist_retry_attempts() -> u32 { 2 }
fn default_persist_retry_delay() -> u64 { 500 }
fn default_metrics_port() -> u16 { 9090 }

impl Default for AlpacaConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            data_url: default_data_url(),
            stream_url: default_stream_url(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            dbname: String::new(),
            user: String::new(),
            password: String::new(),
            host: String::new(),
            port: None,
            table: default_table(),
            pool_size: default_pool_size(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_probe_attempts(),
            base_delay_secs: default_probe_base_delay(),
            request_timeout_secs: default_probe_request_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            drain_grace_secs: default_drain_grace(),
            persist_retry_attempts: default_persist_retry_attempts(),
            persist_retry_delay_ms: default_persist_retry_delay(),
            reconnect_on_drop: false,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            metrics_port: default_metrics_port(),
        }
    }
}

impl fmt::Debug for AlpacaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlpacaConfig")
            .field("api_key", &redact(&self.api_key))
            .field("secret_key", &redact(&self.secret_key))
            .field("data_url", &self.data_url)
            .field("stream_url", &self.stream_url)
            .finish()
    }
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("table", &self.table)
            .field("pool_size", &self.pool_size)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl ProbeConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SessionConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn persist_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_delay_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })
    }

    /// Defaults, then the TOML file when it exists, then `.env` and the
    /// process environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = if path.as_ref().exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!(
                "Config file '{}' not found, using defaults",
                path.as_ref().display()
            );
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("ALPACA_API_KEY") {
            self.alpaca.api_key = v;
        }
        if let Some(v) = get("ALPACA_SECRET_KEY") {
            self.alpaca.secret_key = v;
        }
        if let Some(v) = get("ALPACA_DATA_URL") {
            self.alpaca.data_url = v;
        }
        if let Some(v) = get("ALPACA_STREAM_URL") {
            self.alpaca.stream_url = v;
        }
        if let Some(v) = get("POSTGRES_DB") {
            self.postgres.dbname = v;
        }
        if let Some(v) = get("POSTGRES_USER") {
            self.postgres.user = v;
        }
        if let Some(v) = get("POSTGRES_PASSWORD") {
            self.postgres.password = v;
        }
        if let Some(v) = get("POSTGRES_HOST") {
            self.postgres.host = v;
        }
        if let Some(v) = get("POSTGRES_PORT") {
            let port: u16 = v.trim().parse().map_err(|e| ConfigError::Invalid {
                key: "POSTGRES_PORT",
                reason: format!("{v:?} is not a port number ({e})"),
            })?;
            self.postgres.port = Some(port);
        }
        Ok(())
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_with(true)
    }

    /// Same as [`Config::validate`]; with `require_datastore = false` the
    /// PostgreSQL settings are not required (dry runs).
    pub fn validate_with(&self, require_datastore: bool) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        let mut required = vec![
            ("ALPACA_API_KEY", &self.alpaca.api_key),
            ("ALPACA_SECRET_KEY", &self.alpaca.secret_key),
        ];
        if require_datastore {
            required.extend([
                ("POSTGRES_DB", &self.postgres.dbname),
                ("POSTGRES_USER", &self.postgres.user),
                ("POSTGRES_PASSWORD", &self.postgres.password),
                ("POSTGRES_HOST", &self.postgres.host),
            ]);
        }
        for (key, value) in required {
            if value.trim().is_empty() {
                missing.push(key);
            }
        }
        if require_datastore && self.postgres.port.is_none() {
            missing.push("POSTGRES_PORT");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if require_datastore && self.postgres.port == Some(0) {
            return Err(ConfigError::Invalid {
                key: "POSTGRES_PORT",
                reason: "port must be non-zero".into(),
            });
        }
        if self.probe.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "probe.max_attempts",
                reason: "at least one attempt is required".into(),
            });
        }
        if self.session.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "session.channel_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        if self.postgres.pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "postgres.pool_size",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}
