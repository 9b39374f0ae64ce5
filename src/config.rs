//! Application-level configuration loading: listening port, storage backend and relay timings.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PLANNING_POKER_CONFIG_PATH";
/// Environment variable selecting the storage backend.
const STORE_BACKEND_ENV: &str = "STORE_BACKEND";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(70);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Durable store the server persists sessions into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map; sessions are lost on restart.
    #[default]
    Memory,
    /// MongoDB, configured through `MONGO_URI` / `MONGO_DB`.
    Mongo,
    /// CouchDB, configured through the `COUCH_*` variables.
    Couch,
}

impl StoreBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "mongo" | "mongodb" => Some(Self::Mongo),
            "couch" | "couchdb" => Some(Self::Couch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// TCP port the HTTP server binds.
    pub port: u16,
    /// Durable store selected at startup.
    pub store_backend: StoreBackend,
    /// Lifetime of a stored session, refreshed on every write.
    pub session_ttl: Duration,
    /// Upper bound on a single store call made by the HTTP surface.
    pub store_timeout: Duration,
    /// Interval between two relay heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Subscribers silent for longer than this are evicted.
    pub stale_after: Duration,
    /// Interval between two stale subscriber sweeps.
    pub sweep_interval: Duration,
    /// Time a new socket has to send its `join` frame.
    pub join_timeout: Duration,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match Self::from_json_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration file");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };

        config.with_env_overrides(|key| env::var(key).ok())
    }

    /// Parse a JSON configuration document; absent keys keep their default.
    pub fn from_json_str(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<RawConfig>(contents).map(Into::into)
    }

    /// Apply `PORT` / `SERVER_PORT` and `STORE_BACKEND` read through `lookup`.
    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = lookup("PORT")
            .or_else(|| lookup("SERVER_PORT"))
            .and_then(|value| value.parse::<u16>().ok())
        {
            self.port = port;
        }

        if let Some(raw) = lookup(STORE_BACKEND_ENV) {
            match StoreBackend::parse(&raw) {
                Some(backend) => self.store_backend = backend,
                None => warn!(value = %raw, "unknown store backend; keeping {:?}", self.store_backend),
            }
        }

        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    port: u16,
    store_backend: StoreBackend,
    #[serde_as(as = "DurationSeconds<u64>")]
    session_ttl_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    store_timeout_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    heartbeat_interval_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    stale_after_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    sweep_interval_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    join_timeout_secs: Duration,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            store_backend: StoreBackend::default(),
            session_ttl_secs: DEFAULT_SESSION_TTL,
            store_timeout_secs: DEFAULT_STORE_TIMEOUT,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after_secs: DEFAULT_STALE_AFTER,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL,
            join_timeout_secs: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        Self {
            port: value.port,
            store_backend: value.store_backend,
            session_ttl: value.session_ttl_secs,
            store_timeout: value.store_timeout_secs,
            heartbeat_interval: value.heartbeat_interval_secs,
            stale_after: value.stale_after_secs,
            sweep_interval: value.sweep_interval_secs,
            join_timeout: value.join_timeout_secs,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
