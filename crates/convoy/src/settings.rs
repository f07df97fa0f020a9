//! Layered configuration.
//!
//! Defaults, then `config.toml`, then `CONVOY__SECTION__KEY` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::session::SessionConfig;

pub const APP_NAME: &str = "convoy";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionSettings,
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Step budget per turn, retries included.
    pub max_turns: u32,
    /// Content-filter regenerations per turn.
    pub max_retries: u32,
    /// Grace period for a cancelled turn, in milliseconds.
    pub cancel_grace_ms: u64,
    /// Sequencer queue bound.
    pub outbound_capacity: usize,
    /// Interval between WebSocket ping frames, in seconds. 0 disables them.
    pub keepalive_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            max_turns: defaults.max_turns,
            max_retries: defaults.max_retries,
            cancel_grace_ms: defaults.cancel_grace.as_millis() as u64,
            outbound_capacity: defaults.outbound_capacity,
            keepalive_secs: 30,
        }
    }
}

impl SessionSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_turns: self.max_turns,
            max_retries: self.max_retries,
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            outbound_capacity: self.outbound_capacity.max(1),
        }
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Case-insensitive terms rejected by the built-in content filter.
    pub blocked_terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Load the layered configuration, creating the file with defaults when missing.
pub fn load_or_init_config(config_file: &Path, dry_run: bool) -> Result<AppConfig> {
    if !config_file.exists() {
        if dry_run {
            log::info!(
                "dry-run: would create default config at {}",
                config_file.display()
            );
        } else {
            write_default_config(config_file)?;
        }
    }
    load_config(config_file)
}

/// Build the configuration without touching the filesystem.
pub fn load_config(config_file: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080_i64)?
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix().as_str())
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("filter.blocked_terms")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("loading config from {}", config_file.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Resolve the config file, honouring an explicit override (file or directory).
pub fn resolve_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
