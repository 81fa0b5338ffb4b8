//! Server configuration.
//!
//! Loaded from environment variables prefixed `ENCORE`, with `__`
//! separating nested keys. A `.env` file is read first when present.
//!
//! - `ENCORE__SERVER__BIND_ADDR=0.0.0.0:8080` → `server.bind_addr`
//! - `ENCORE__DATABASE__URL=postgres://...` → `database.url`
//! - `ENCORE__GEOCODER__API_KEY=...` → `geocoder.api_key`
//!
//! Optional backends fall back to in-process implementations when their
//! URL is absent: no database means an in-memory store, no Redis means a
//! single-process channel and lock, no engine URL means an in-process
//! engine.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::TimeDelta;
use encore_room::CoordinatorConfig;
use secrecy::SecretString;
use serde::Deserialize;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration loading failed: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn check_scheme(value: &str, schemes: &[&str], what: &str) -> Result<(), ConfigError> {
    if schemes.iter().any(|s| value.starts_with(&format!("{s}://"))) {
        Ok(())
    } else {
        Err(invalid(format!("{what} must start with one of {schemes:?}")))
    }
}

fn check_timeout(ms: u64, what: &str) -> Result<(), ConfigError> {
    if ms == 0 || ms > 300_000 {
        return Err(invalid(format!("{what} must be between 1 and 300000 ms")));
    }
    Ok(())
}

/// Root configuration.
#[derive(Debug, Default, Deserialize)]
pub struct EncoreConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
}

impl EncoreConfig {
    /// Loads `.env` (if present) then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_environment(::config::Environment::default())
    }

    /// Loads from an explicit environment source. Tests pass a map here
    /// instead of mutating the process environment.
    pub fn from_environment(environment: ::config::Environment) -> Result<Self, ConfigError> {
        let config = ::config::Config::builder()
            .add_source(environment.prefix("ENCORE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.redis.validate()?;
        self.engine.validate()?;
        self.geocoder.validate()?;
        self.rooms.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// How long a new connection has to send its handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Connections silent for longer than this are closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|_| invalid("server.bind_addr must be host:port"))?;
        check_timeout(self.handshake_timeout_ms, "server.handshake_timeout_ms")?;
        check_timeout(self.idle_timeout_ms, "server.idle_timeout_ms")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. Absent means an in-memory store.
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.url {
            check_scheme(url, &["postgres", "postgresql"], "database.url")?;
        }
        if self.max_connections == 0 || self.max_connections > 100 {
            return Err(invalid("database.max_connections must be between 1 and 100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis URL. Absent means a single-process channel and lock.
    pub url: Option<String>,

    /// Expiry of a user lock whose holder died.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    15_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl RedisConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.url {
            check_scheme(url, &["redis", "rediss"], "redis.url")?;
        }
        check_timeout(self.lock_ttl_ms, "redis.lock_ttl_ms")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Workflow engine base URL. Absent means an in-process engine.
    pub base_url: Option<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    5_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.base_url {
            check_scheme(url, &["http", "https"], "engine.base_url")?;
        }
        check_timeout(self.timeout_ms, "engine.timeout_ms")
    }
}

#[derive(Debug, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "default_geocoder_url")]
    pub base_url: String,

    /// Places API key. Absent means no place can be resolved, so
    /// constrained rooms can't be created.
    pub api_key: Option<SecretString>,

    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_geocoder_url() -> String {
    "https://maps.googleapis.com".to_string()
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_url(),
            api_key: None,
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl GeocoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_scheme(&self.base_url, &["http", "https"], "geocoder.base_url")?;
        check_timeout(self.timeout_ms, "geocoder.timeout_ms")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomsConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_position_max_age_secs")]
    pub position_max_age_secs: i64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_page_size() -> u32 {
    10
}

fn default_position_max_age_secs() -> i64 {
    24 * 60 * 60
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            position_max_age_secs: default_position_max_age_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl RoomsConfig {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            page_size: self.page_size,
            position_max_age: TimeDelta::seconds(self.position_max_age_secs),
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > 100 {
            return Err(invalid("rooms.page_size must be between 1 and 100"));
        }
        if self.position_max_age_secs <= 0 {
            return Err(invalid("rooms.position_max_age_secs must be positive"));
        }
        check_timeout(self.lock_timeout_ms, "rooms.lock_timeout_ms")
    }
}
