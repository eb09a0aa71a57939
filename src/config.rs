//! Service configuration, read from the environment (and `.env`).

use std::{collections::HashMap, env, str::FromStr, time::Duration};

use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://videocall.db";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 16;
pub const DEFAULT_DB_BUSY_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_PEER_CHANNEL_BUFFER: usize = 64;
pub const DEFAULT_SESSION_EXPIRY_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub db_max_connections: u32,
    pub db_busy_timeout: Duration,
    /// Outbound queue depth per channel; events past it are dropped.
    pub peer_channel_buffer: usize,
    pub session_expiry_minutes: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            db_busy_timeout: Duration::from_secs(DEFAULT_DB_BUSY_TIMEOUT_SECONDS),
            peer_channel_buffer: DEFAULT_PEER_CHANNEL_BUFFER,
            session_expiry_minutes: DEFAULT_SESSION_EXPIRY_MINUTES,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine.
        let _ = dotenv::dotenv();
        Self::from_vars(&env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = vars.get("DATABASE_URL") {
            config.database_url = url.clone();
        }

        config.bind_address = match vars.get("BIND_ADDRESS") {
            Some(addr) => addr.clone(),
            None => format!("0.0.0.0:{}", parse_or(vars, "PORT", DEFAULT_PORT)?),
        };

        config.db_max_connections = parse_or(vars, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;
        config.db_busy_timeout = Duration::from_secs(parse_or(
            vars,
            "DB_BUSY_TIMEOUT_SECONDS",
            DEFAULT_DB_BUSY_TIMEOUT_SECONDS,
        )?);
        config.peer_channel_buffer = parse_or(vars, "PEER_CHANNEL_BUFFER", DEFAULT_PEER_CHANNEL_BUFFER)?;
        config.session_expiry_minutes =
            parse_or(vars, "SESSION_EXPIRY_MINUTES", DEFAULT_SESSION_EXPIRY_MINUTES)?;

        if config.db_max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DB_MAX_CONNECTIONS",
                value: "0".to_owned(),
            });
        }
        if config.peer_channel_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                name: "PEER_CHANNEL_BUFFER",
                value: "0".to_owned(),
            });
        }

        Ok(config)
    }
}

fn parse_or<T: FromStr>(vars: &HashMap<String, String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: value.clone(),
        }),
        None => Ok(default),
    }
}
