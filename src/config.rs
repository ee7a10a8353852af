use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub const DEFAULT_STORE_PATH: &str = "data/movie_bot.db";
pub const DEFAULT_BROADCAST_DELAY_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is missing")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Настройки процесса; читаются один раз при старте.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub tmdb_api_key: String,
    pub tmdb_base_url: Option<String>,
    pub admin_id: i64,
    pub store_path: PathBuf,
    pub broadcast_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // пустая строка в .env == переменной нет
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let telegram_token = get("TELOXIDE_TOKEN")
            .or_else(|| get("TELEGRAM_BOT_TOKEN"))
            .ok_or(ConfigError::Missing("TELOXIDE_TOKEN"))?;
        let tmdb_api_key = get("TMDB_API_KEY").ok_or(ConfigError::Missing("TMDB_API_KEY"))?;

        let raw_admin = get("ADMIN_ID").ok_or(ConfigError::Missing("ADMIN_ID"))?;
        let admin_id = raw_admin
            .parse::<i64>()
            .map_err(|_| ConfigError::Invalid { name: "ADMIN_ID", value: raw_admin.clone() })?;

        let store_path = get("STORE_PATH").unwrap_or_else(|| DEFAULT_STORE_PATH.to_string());

        let broadcast_delay = match get("BROADCAST_DELAY_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid { name: "BROADCAST_DELAY_MS", value: raw.clone() })?,
            None => DEFAULT_BROADCAST_DELAY_MS,
        };

        Ok(Self {
            telegram_token,
            tmdb_api_key,
            tmdb_base_url: get("TMDB_BASE_URL"),
            admin_id,
            store_path: PathBuf::from(store_path),
            broadcast_delay: Duration::from_millis(broadcast_delay),
        })
    }
}
