// ABOUTME: Configuration management for clustercast
// Loads layered TOML files, applies CLUSTERCAST_* environment overrides and validates the result

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::transport::catalog::{CatalogError, MessageCatalog};
use crate::transport::config::{BlockingMode, GateConfig, HeartbeatConfig, PoolConfig, SenderConfig};

/// Prefix of environment variables that override file settings
pub const ENV_PREFIX: &str = "CLUSTERCAST_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Resource pool sizing and keepalive
    pub pool: PoolConfig,

    /// Per-destination TCP limits
    pub sender: SenderConfig,

    /// Heartbeat rendezvous
    pub heartbeat: HeartbeatConfig,

    /// Admission gate
    pub gate: GateConfig,

    /// Message catalog overrides, `"component.key" = "template"`
    pub messages: HashMap<String, String>,
}

/// Semantic problems in an otherwise parsable configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pool.max_size must be at least 1")]
    ZeroPoolSize,

    #[error("gate.capacity must be at least 1")]
    ZeroGateCapacity,

    #[error("heartbeat.port must be non-zero")]
    ZeroHeartbeatPort,

    #[error("heartbeat.ttl {0} is out of range 0-255")]
    TtlOutOfRange(u32),

    #[error("heartbeat.local_interface {interface} is not in the address family of {group}")]
    InterfaceFamily { interface: IpAddr, group: IpAddr },

    #[error("gate.denied_status_code {0} is not an HTTP status")]
    InvalidStatus(u16),

    #[error("Invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },

    #[error("Unknown configuration variable {0}")]
    UnknownEnv(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl AppConfig {
    /// Load from every config location, then the environment
    ///
    /// Files are applied system first, then user, then project, so the most
    /// local file wins for any value it sets.
    pub fn load() -> Result<Self> {
        let layers: Vec<PathBuf> = Self::get_config_paths()
            .into_iter()
            .rev()
            .filter(|path| path.exists())
            .collect();
        let mut config = Self::load_layers(&layers)?;

        config
            .apply_env(load_from_env())
            .context("Failed to apply environment overrides")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Load exactly one file, then the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::load_layers(&[path.to_path_buf()])?;
        config
            .apply_env(load_from_env())
            .context("Failed to apply environment overrides")?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Overlay `paths` in order, lowest precedence first
    ///
    /// Any key a later file sets replaces the earlier value, even when it is
    /// the default. Tables merge key by key; the environment is not consulted.
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in paths {
            merge_tables(&mut merged, Self::read_table(path)?);
        }
        toml::Value::Table(merged)
            .try_into()
            .context("Failed to parse merged configuration")
    }

    fn read_table(path: &Path) -> Result<toml::Table> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        content
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Write this configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Configuration file paths in order of precedence
    pub fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        // 1. Local project config
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".clustercast").join("config.toml"));
        }

        // 2. User config (~/.clustercast/config.toml)
        if let Ok(config_dir) = Self::get_user_config_dir() {
            paths.push(config_dir.join("config.toml"));
        }

        // 3. System config
        paths.push(PathBuf::from("/etc/clustercast/config.toml"));

        paths
    }

    /// User configuration directory
    pub fn get_user_config_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home_dir.join(".clustercast"))
    }

    /// Apply `CLUSTERCAST_<SECTION>_<FIELD>` overrides
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let invalid = || ConfigError::InvalidEnv {
                key: key.clone(),
                value: value.clone(),
            };

            match name {
                "CONFIG" => {}
                "POOL_MAX_SIZE" => self.pool.max_size = value.parse().map_err(|_| invalid())?,
                "POOL_MAX_WAIT_MILLIS" => {
                    self.pool.max_wait_millis = value.parse().map_err(|_| invalid())?;
                }
                "POOL_KEEPALIVE_INTERVAL_MILLIS" => {
                    self.pool.keepalive_interval = parse_millis(&value).ok_or_else(invalid)?;
                }
                "POOL_REAPER_INTERVAL_MILLIS" => {
                    self.pool.reaper_interval = parse_millis(&value).ok_or_else(invalid)?;
                }
                "SENDER_CONNECT_TIMEOUT_MILLIS" => {
                    self.sender.connect_timeout = parse_millis(&value).ok_or_else(invalid)?;
                }
                "SENDER_SEND_TIMEOUT_MILLIS" => {
                    self.sender.send_timeout = parse_millis(&value).ok_or_else(invalid)?;
                }
                "HEARTBEAT_GROUP_ADDRESS" => {
                    self.heartbeat.group_address = value.parse().map_err(|_| invalid())?;
                }
                "HEARTBEAT_PORT" => self.heartbeat.port = value.parse().map_err(|_| invalid())?,
                "HEARTBEAT_TTL" => self.heartbeat.ttl = value.parse().map_err(|_| invalid())?,
                "HEARTBEAT_LOCAL_INTERFACE" => {
                    self.heartbeat.local_interface = if value.is_empty() {
                        None
                    } else {
                        Some(value.parse().map_err(|_| invalid())?)
                    };
                }
                "HEARTBEAT_INTERVAL_MILLIS" => {
                    self.heartbeat.interval = parse_millis(&value).ok_or_else(invalid)?;
                }
                "HEARTBEAT_EXPIRY_MILLIS" => {
                    self.heartbeat.expiry = parse_millis(&value).ok_or_else(invalid)?;
                }
                "GATE_CAPACITY" => self.gate.capacity = value.parse().map_err(|_| invalid())?,
                "GATE_FAIRNESS" => self.gate.fairness = value.parse().map_err(|_| invalid())?,
                "GATE_BLOCKING_MODE" => {
                    self.gate.blocking_mode = parse_blocking_mode(&value).ok_or_else(invalid)?;
                }
                "GATE_DENIED_STATUS_CODE" => {
                    self.gate.denied_status_code = Some(value.parse().map_err(|_| invalid())?);
                }
                _ => return Err(ConfigError::UnknownEnv(key)),
            }
        }
        Ok(())
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.gate.capacity == 0 {
            return Err(ConfigError::ZeroGateCapacity);
        }
        if self.heartbeat.port == 0 {
            return Err(ConfigError::ZeroHeartbeatPort);
        }
        if self.heartbeat.ttl > 255 {
            return Err(ConfigError::TtlOutOfRange(self.heartbeat.ttl));
        }
        if let Some(interface) = self.heartbeat.local_interface {
            if interface.is_ipv4() != self.heartbeat.group_address.is_ipv4() {
                return Err(ConfigError::InterfaceFamily {
                    interface,
                    group: self.heartbeat.group_address,
                });
            }
        }
        if let Some(status) = self.gate.denied_status_code {
            if !(100..=599).contains(&status) {
                return Err(ConfigError::InvalidStatus(status));
            }
        }
        self.catalog()?;
        Ok(())
    }

    /// Built-in catalog with the configured overrides
    pub fn catalog(&self) -> Result<MessageCatalog, ConfigError> {
        Ok(MessageCatalog::with_overrides(&self.messages)?)
    }
}

fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(nested)) => {
                merge_tables(existing, nested);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_millis(value: &str) -> Option<Duration> {
    value.parse().ok().map(Duration::from_millis)
}

fn parse_blocking_mode(value: &str) -> Option<BlockingMode> {
    match value {
        "reject_immediately" => Some(BlockingMode::RejectImmediately),
        "block_uninterruptible" => Some(BlockingMode::BlockUninterruptible),
        "block_interruptible" => Some(BlockingMode::BlockInterruptible),
        _ => None,
    }
}

/// Environment variables carrying configuration overrides
pub fn load_from_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}
