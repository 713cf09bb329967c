//! Configuration management for the asset upload server

use std::env;
use std::path::PathBuf;

use crate::upload::MAX_CHUNK_BYTES;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Accept new upload sessions
    pub enabled: bool,
    /// Directory that holds the `client/` and `editor/` trees
    pub asset_root: PathBuf,
    /// Where chunks are staged until assembly
    pub staging_dir: PathBuf,
    pub max_chunk_size: u64,
    /// 0 = unlimited
    pub max_total_size: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Error raised for a malformed environment value
#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {name}: {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5400,
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            enabled: true,
            asset_root: PathBuf::from("./assets"),
            staging_dir: env::temp_dir().join("asset-uploads"),
            max_chunk_size: MAX_CHUNK_BYTES,
            max_total_size: 0,
            idle_timeout_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_or("SERVER_PORT", defaults.server.port),
            },
            upload: UploadConfig {
                enabled: parse_bool("UPLOAD_ENABLED", defaults.upload.enabled)?,
                asset_root: env::var("UPLOAD_ASSET_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.asset_root),
                staging_dir: env::var("UPLOAD_STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.staging_dir),
                max_chunk_size: parse_or("UPLOAD_MAX_CHUNK_BYTES", defaults.upload.max_chunk_size),
                max_total_size: parse_or("UPLOAD_MAX_TOTAL_BYTES", defaults.upload.max_total_size),
                idle_timeout_secs: parse_or(
                    "UPLOAD_IDLE_TIMEOUT_SECS",
                    defaults.upload.idle_timeout_secs,
                ),
                sweep_interval_secs: parse_or(
                    "UPLOAD_SWEEP_INTERVAL_SECS",
                    defaults.upload.sweep_interval_secs,
                ),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError { name, value }),
        },
    }
}
