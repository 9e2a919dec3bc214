use std::env;

use base64::prelude::{Engine, BASE64_STANDARD};
use shutter_core::ShutterConfig;
use thiserror::Error;

use crate::DEFAULT_PORT;

const DEFAULT_MEDIA_BASE_URL: &str = "http://localhost:9000/media";
const DEFAULT_MEDIA_TTL_SECONDS: i64 = 3600;

/// Runtime settings, read from the environment at startup
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub token_secret: String,
    pub system_secret: Vec<u8>,
    pub push_url: Option<String>,
    pub media_base_url: String,
    pub media_secret: String,
    pub media_ttl_seconds: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{0} is invalid: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match optional("SHUTTER_PORT") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid("SHUTTER_PORT", format!("{raw} is not a port number"))
            })?,
            None => DEFAULT_PORT,
        };

        let system_secret = BASE64_STANDARD
            .decode(required("SHUTTER_SYSTEM_SECRET")?)
            .map_err(|e| ConfigError::Invalid("SHUTTER_SYSTEM_SECRET", e.to_string()))?;

        if system_secret.len() != 32 {
            return Err(ConfigError::Invalid(
                "SHUTTER_SYSTEM_SECRET",
                "must decode to exactly 32 bytes".to_string(),
            ));
        }

        let media_ttl_seconds = match optional("SHUTTER_MEDIA_TTL_SECONDS") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid(
                    "SHUTTER_MEDIA_TTL_SECONDS",
                    format!("{raw} is not a number of seconds"),
                )
            })?,
            None => DEFAULT_MEDIA_TTL_SECONDS,
        };

        Ok(Self {
            port,
            system_secret,
            media_ttl_seconds,
            database_url: required("SHUTTER_DATABASE_URL")?,
            token_secret: required("SHUTTER_TOKEN_SECRET")?,
            media_secret: required("SHUTTER_MEDIA_SECRET")?,
            push_url: optional("SHUTTER_PUSH_URL"),
            media_base_url: optional("SHUTTER_MEDIA_BASE_URL")
                .unwrap_or_else(|| DEFAULT_MEDIA_BASE_URL.to_string()),
        })
    }

    /// The subset of settings the coordinator itself needs
    pub fn shutter(&self) -> ShutterConfig {
        ShutterConfig {
            token_secret: self.token_secret.clone(),
            system_secret: self.system_secret.clone(),
            push_url: self.push_url.clone(),
            media_base_url: self.media_base_url.clone(),
            media_secret: self.media_secret.clone(),
            media_ttl_seconds: self.media_ttl_seconds,
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}
