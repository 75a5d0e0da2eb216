use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::session::{SessionSettings, DEFAULT_IDLE_TIMEOUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("expected {0} in the environment")]
    Missing(&'static str),

    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub token: String,
    pub prefix: String,
    pub ytdlp_program: String,
    pub error_log: PathBuf,
    pub session: SessionSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("DISCORD_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        let idle_secs: u64 = parse_or(&lookup, "IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT.as_secs())?;
        let volume_percent: f32 = parse_or(&lookup, "DEFAULT_VOLUME", 50.0)?;

        if idle_secs == 0 {
            return Err(ConfigError::Invalid { key: "IDLE_TIMEOUT_SECS", value: idle_secs.to_string() });
        }

        if !(1.0..=100.0).contains(&volume_percent) {
            return Err(ConfigError::Invalid { key: "DEFAULT_VOLUME", value: volume_percent.to_string() });
        }

        Ok(Config {
            token,
            prefix: lookup("COMMAND_PREFIX").unwrap_or_else(|| "!".to_string()),
            ytdlp_program: lookup("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
            error_log: lookup("ERROR_LOG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("log.txt")),
            session: SessionSettings {
                idle_timeout: Duration::from_secs(idle_secs),
                default_volume: volume_percent / 100.0,
            },
        })
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}
