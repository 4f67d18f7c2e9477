//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use tracing::warn;

use crate::lockstep::sync_test::MIN_TRIGGER_TURN;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS, comma separated ("*" for any)
    pub client_origin: String,
    /// Peers reporting another version are refused
    pub game_version: String,
    /// Match task ticks per second
    pub tick_rate: u32,
    /// Lockstep timing shared by every match
    pub lockstep: LockstepConfig,
}

/// Timing parameters of the lockstep cycle, drift detector and kick countdown.
/// All durations are in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LockstepConfig {
    pub cycle_length: f32,
    pub sync_trigger_turn: u64,
    pub sync_reload_interval: f32,
    pub kick_timeout: f32,
    /// A match that has not started by then is closed
    pub loading_timeout: f32,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            cycle_length: 0.2,
            sync_trigger_turn: 2,
            sync_reload_interval: 0.6,
            kick_timeout: 5.0,
            loading_timeout: 120.0,
        }
    }
}

impl LockstepConfig {
    /// Clamp out-of-range values to safe minimums
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        let mut config = self;

        if !is_positive_duration(config.cycle_length) {
            warn!(value = config.cycle_length, "Invalid lockstep cycle length, using default");
            config.cycle_length = defaults.cycle_length;
        }
        if config.sync_trigger_turn < MIN_TRIGGER_TURN {
            warn!(
                value = config.sync_trigger_turn,
                min = MIN_TRIGGER_TURN,
                "Sync trigger turn below minimum, clamping"
            );
            config.sync_trigger_turn = MIN_TRIGGER_TURN;
        }
        if !is_positive_duration(config.sync_reload_interval) {
            warn!(value = config.sync_reload_interval, "Invalid sync reload interval, using default");
            config.sync_reload_interval = defaults.sync_reload_interval;
        }
        if !is_positive_duration(config.kick_timeout) {
            warn!(value = config.kick_timeout, "Invalid kick timeout, using default");
            config.kick_timeout = defaults.kick_timeout;
        }
        if !is_positive_duration(config.loading_timeout) {
            warn!(value = config.loading_timeout, "Invalid loading timeout, using default");
            config.loading_timeout = defaults.loading_timeout;
        }

        config
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Some(port) = lookup("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string())
        };

        let defaults = LockstepConfig::default();
        let lockstep = LockstepConfig {
            cycle_length: parse_or(&lookup, "LOCKSTEP_CYCLE_SECS", defaults.cycle_length)?,
            sync_trigger_turn: parse_or(&lookup, "SYNC_TRIGGER_TURN", defaults.sync_trigger_turn)?,
            sync_reload_interval: parse_or(
                &lookup,
                "SYNC_RELOAD_SECS",
                defaults.sync_reload_interval,
            )?,
            kick_timeout: parse_or(&lookup, "KICK_TIMEOUT_SECS", defaults.kick_timeout)?,
            loading_timeout: parse_or(&lookup, "LOADING_TIMEOUT_SECS", defaults.loading_timeout)?,
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            client_origin: lookup("CLIENT_ORIGIN").unwrap_or_else(|| "*".to_string()),
            game_version: lookup("GAME_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            tick_rate: parse_or(&lookup, "HOST_TICK_RATE", 60u32)?.max(1),
            lockstep: lockstep.sanitized(),
        })
    }
}

fn is_positive_duration(secs: f32) -> bool {
    secs.is_finite() && secs > 0.0
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid server address format")]
    InvalidAddress,
}
