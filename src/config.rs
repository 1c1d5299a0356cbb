//! Runtime configuration
//!
//! Read from `HUB_*` environment variables, optionally loaded from a `.env`
//! file first.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::DEFAULT_OUTBOUND_CAPACITY;
use crate::error::ConfigError;
use crate::hub::DEFAULT_CHANNEL_CAPACITY;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub bind_addr: String,
    /// HS256 secret shared with the token issuer
    pub jwt_secret: String,
    /// Per-connection outbound queue bound
    pub outbound_capacity: usize,
    /// Buffer of the hub's register/broadcast channels
    pub channel_capacity: usize,
    /// Keep-alive ping period
    pub ping_interval: Duration,
    /// Close a connection after this long without inbound frames
    pub idle_timeout: Duration,
    /// Largest accepted inbound WebSocket message
    pub max_message_bytes: usize,
    /// Optional chat membership seed for the in-memory store
    pub seed_file: Option<PathBuf>,
    /// Emit JSON logs
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            jwt_secret: String::new(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            max_message_bytes: 1 << 20,
            seed_file: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let jwt_secret = lookup("HUB_JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("HUB_JWT_SECRET"))?;

        let config = Self {
            bind_addr: lookup("HUB_BIND_ADDR").unwrap_or(defaults.bind_addr),
            jwt_secret,
            outbound_capacity: parse(&lookup, "HUB_OUTBOUND_CAPACITY")?
                .unwrap_or(defaults.outbound_capacity),
            channel_capacity: parse(&lookup, "HUB_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.channel_capacity),
            ping_interval: seconds(&lookup, "HUB_PING_INTERVAL_SECS")?
                .unwrap_or(defaults.ping_interval),
            idle_timeout: seconds(&lookup, "HUB_IDLE_TIMEOUT_SECS")?
                .unwrap_or(defaults.idle_timeout),
            max_message_bytes: parse(&lookup, "HUB_MAX_MESSAGE_BYTES")?
                .unwrap_or(defaults.max_message_bytes),
            seed_file: lookup("HUB_SEED_FILE").map(PathBuf::from),
            log_json: parse(&lookup, "HUB_LOG_JSON")?.unwrap_or(defaults.log_json),
        };

        // A reader must see at least one ping round trip before timing out
        if config.idle_timeout <= config.ping_interval {
            return Err(ConfigError::Invalid {
                name: "HUB_IDLE_TIMEOUT_SECS",
                value: config.idle_timeout.as_secs().to_string(),
            });
        }

        Ok(config)
    }
}

/// Non-zero number of seconds
fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(lookup, name)? {
        Some(0) => Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
