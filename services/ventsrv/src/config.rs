//! Service configuration
//!
//! Loaded from a YAML, TOML or JSON file and overlaid with `VENTSRV_`
//! environment variables (nested keys separated by `__`, e.g.
//! `VENTSRV_SERVICE__LOGGING__LEVEL=debug`).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use common::LoggingConfig;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::devices::DeviceModel;
use crate::engine::{DebounceSettings, EngineSettings};
use crate::error::{Result, VentSrvError};
use crate::protocols::modbus::Endpoint;

pub const DEFAULT_CONFIG_PATH: &str = "config/ventsrv.yaml";
pub const ENV_PREFIX: &str = "VENTSRV_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            logging: LoggingConfig::default(),
        }
    }
}

/// One ventilation unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub model: DeviceModel,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Timers, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub post_write_settle_ms: u64,
    #[serde(default = "default_true")]
    pub refresh_after_write: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            debounce_ms: default_debounce_ms(),
            post_write_settle_ms: default_settle_ms(),
            refresh_after_write: true,
        }
    }
}

fn default_service_name() -> String {
    "ventsrv".to_string()
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_response_timeout_ms() -> u64 {
    3000
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_retry_backoff_ms() -> u64 {
    30_000
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_settle_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load `path` and merge the environment overlay
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| VentSrvError::config("Invalid file extension"))?;

        if !path.exists() {
            return Err(VentSrvError::config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::new();
        let figment = match extension {
            "json" => figment.merge(Json::file(path)),
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(VentSrvError::config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| VentSrvError::config(format!("Failed to parse config: {}", e)))?;

        debug!(
            "Loaded {} with {} device(s)",
            path.display(),
            config.devices.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(VentSrvError::config("No devices configured"));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(VentSrvError::config(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
            device.validate()?;
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VentSrvError::config("Device name is empty"));
        }
        self.endpoint()
            .validate()
            .map_err(|e| VentSrvError::config(format!("Device {}: {}", self.name, e)))?;
        if self.polling.interval_ms == 0 {
            return Err(VentSrvError::config(format!(
                "Device {}: polling.interval_ms must be non-zero",
                self.name
            )));
        }
        if self.polling.retry_backoff_ms == 0 {
            return Err(VentSrvError::config(format!(
                "Device {}: polling.retry_backoff_ms must be non-zero",
                self.name
            )));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        let c = &self.connection;
        Endpoint::new(c.host.clone(), c.port)
            .with_unit_id(c.unit_id)
            .with_timeouts(
                Duration::from_millis(c.connect_timeout_ms),
                Duration::from_millis(c.response_timeout_ms),
            )
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let p = &self.polling;
        EngineSettings {
            name: self.name.clone(),
            endpoint: self.endpoint(),
            poll_interval: Duration::from_millis(p.interval_ms),
            retry_backoff: Duration::from_millis(p.retry_backoff_ms),
            debounce: DebounceSettings {
                window: Duration::from_millis(p.debounce_ms),
                settle: Duration::from_millis(p.post_write_settle_ms),
                refresh_after_write: p.refresh_after_write,
            },
        }
    }
}
