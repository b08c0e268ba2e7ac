use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest table the 16-bit Modbus address space can hold.
pub const MAX_TABLE_SIZE: usize = 1 << 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub modbus: ModbusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub max_clients: usize,
    /// Idle connection timeout in seconds.
    pub timeout: u64,
    pub max_retries: u32,
    /// Delay between start attempts in seconds.
    pub retry_delay: u64,
    /// Deadline for draining background tasks in seconds.
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// JSON-lines log file; empty disables file output.
    pub file: String,
    pub console: bool,
}

/// A raw seed entry as it appears in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: u16,
    pub value: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    pub unit_id: u8,
    pub max_registers: usize,
    pub counter_address: u16,
    /// Counter increment period in seconds.
    pub update_interval: u64,
    pub initial_data: Vec<RegisterValue>,
}

/// Where a loaded [`Config`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    CreatedDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 1502,
            max_clients: 10,
            timeout: 30,
            max_retries: 3,
            retry_delay: 5,
            shutdown_timeout: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "modbus_server.jsonl".to_string(),
            console: true,
        }
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        let seed = |kind: &str, address, value| RegisterValue {
            kind: kind.to_string(),
            address,
            value,
        };

        Self {
            unit_id: 1,
            max_registers: 1000,
            counter_address: 102,
            update_interval: 1,
            initial_data: vec![
                seed("holding", 100, 2025),
                seed("holding", 101, 1234),
                seed("coil", 0, 1),
                seed("discrete", 0, 1),
                seed("input", 100, 5678),
            ],
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl ModbusConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval)
    }

    /// Checks the table geometry. Seed entries are not checked here, bad
    /// ones are skipped when the store is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_registers == 0 || self.max_registers > MAX_TABLE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_registers must be within 1..={MAX_TABLE_SIZE}, got {}",
                self.max_registers
            )));
        }
        if usize::from(self.counter_address) >= self.max_registers {
            return Err(ConfigError::Invalid(format!(
                "counter_address {} is outside the {} register table",
                self.counter_address, self.max_registers
            )));
        }
        if self.update_interval == 0 {
            return Err(ConfigError::Invalid(
                "update_interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Reads `path`, or writes the defaults there when it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if !path.exists() {
            let config = Config::default();
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).map_err(io_err)?;
            }
            let json = serde_json::to_string_pretty(&config).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            fs::write(path, json).map_err(io_err)?;
            return Ok((config, ConfigSource::CreatedDefaults));
        }

        let raw = fs::read_to_string(path).map_err(io_err)?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok((config, ConfigSource::File))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_clients == 0 {
            return Err(ConfigError::Invalid(
                "max_clients must be at least 1".to_string(),
            ));
        }
        self.modbus.validate()
    }
}
