use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::model::UnitConfig;
use crate::utils::error::ServerError;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 502;
pub const DEFAULT_BACKLOG: u32 = 5;
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 15;
pub const DEFAULT_REQUEST_THROTTLE_MS: u64 = 100;

// Setting keys understood in `#param` rows and the meta map
pub const META_UID: &str = "uid";
pub const META_ALLOW_WRITES: &str = "allowWrites";
pub const META_WIRE_LOGGING: &str = "wireLogging";
pub const META_DAO_REQUIRED: &str = "daoRequired";
pub const META_BACKLOG: &str = "backlog";
pub const META_STARTUP_DELAY: &str = "startupDelay";
pub const META_RESTRICT_UNIT_IDS: &str = "restrictUnitIds";
pub const META_RESTRICT_ADDRESSES: &str = "restrictAddresses";
pub const META_REQUIRED_MODE: &str = "requiredOperationalMode";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identifier scoping persisted registers; persistence is off without one.
    pub uid: Option<String>,
    pub bind_address: String,
    pub port: u16,
    pub backlog: u32,
    pub startup_delay_secs: u64,
    /// Minimum time between requests on one connection, 0 to disable.
    pub request_throttle_ms: u64,
    pub allow_writes: bool,
    pub wire_logging: bool,
    pub dao_required: bool,
    pub restrict_unit_ids: bool,
    pub restrict_addresses: bool,
    pub required_operational_mode: Option<String>,
    pub sqlite: Option<SqliteConfig>,
    /// Settings without a dedicated field, kept for CSV round trips.
    pub meta: BTreeMap<String, String>,
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub database_path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub enable_wal: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: "data/modbus_registers.db".to_string(),
            max_connections: 4,
            busy_timeout_ms: 30000,
            enable_wal: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uid: None,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            startup_delay_secs: DEFAULT_STARTUP_DELAY_SECS,
            request_throttle_ms: DEFAULT_REQUEST_THROTTLE_MS,
            allow_writes: false,
            wire_logging: false,
            dao_required: false,
            restrict_unit_ids: false,
            restrict_addresses: false,
            required_operational_mode: None,
            sqlite: None,
            meta: BTreeMap::new(),
            units: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ServerError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded Modbus server configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ServerError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        let mut seen = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            if seen.contains(&unit.unit_id) {
                return Err(ServerError::Config(format!("Unit {} configured more than once", unit.unit_id)));
            }
            seen.push(unit.unit_id);
            unit.validate()?;
        }
        Ok(())
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Server UID when set and non-blank.
    pub fn server_id(&self) -> Option<&str> {
        self.uid.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn description(&self) -> String {
        match self.server_id() {
            Some(uid) => format!("{} (port {})", uid, self.port),
            None => format!("port {}", self.port),
        }
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn request_throttle(&self) -> Option<Duration> {
        match self.request_throttle_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        self.units.iter().map(|u| u.unit_id).collect()
    }

    pub fn unit(&self, unit_id: u8) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.unit_id == unit_id)
    }

    /// Move recognised settings out of `meta` into their typed fields.
    /// Returns a message for each value that could not be parsed; such
    /// entries stay in `meta` untouched.
    pub fn apply_meta(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        let entries: Vec<(String, String)> = self.meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (key, value) in entries {
            let applied = match key.as_str() {
                META_UID => {
                    self.uid = Some(value.clone());
                    true
                }
                META_REQUIRED_MODE => {
                    self.required_operational_mode = Some(value.clone());
                    true
                }
                META_ALLOW_WRITES => parse_flag(&value).map(|v| self.allow_writes = v).is_some(),
                META_WIRE_LOGGING => parse_flag(&value).map(|v| self.wire_logging = v).is_some(),
                META_DAO_REQUIRED => parse_flag(&value).map(|v| self.dao_required = v).is_some(),
                META_RESTRICT_UNIT_IDS => parse_flag(&value).map(|v| self.restrict_unit_ids = v).is_some(),
                META_RESTRICT_ADDRESSES => parse_flag(&value).map(|v| self.restrict_addresses = v).is_some(),
                META_BACKLOG => value.trim().parse().map(|v| self.backlog = v).is_ok(),
                META_STARTUP_DELAY => value.trim().parse().map(|v| self.startup_delay_secs = v).is_ok(),
                _ => continue,
            };
            if applied {
                self.meta.remove(&key);
            } else {
                warn!("Ignoring malformed setting {} = {}", key, value);
                messages.push(format!("Malformed value [{}] for setting [{}]", value, key));
            }
        }
        messages
    }

    /// Settings to emit as `#param` rows: typed fields that differ from their
    /// defaults, followed by the remaining meta entries.
    pub fn meta_settings(&self) -> Vec<(String, String)> {
        let defaults = ServerConfig::default();
        let mut result = Vec::new();
        if let Some(uid) = &self.uid {
            result.push((META_UID.to_string(), uid.clone()));
        }
        let flags = [
            (META_ALLOW_WRITES, self.allow_writes, defaults.allow_writes),
            (META_WIRE_LOGGING, self.wire_logging, defaults.wire_logging),
            (META_DAO_REQUIRED, self.dao_required, defaults.dao_required),
            (META_RESTRICT_UNIT_IDS, self.restrict_unit_ids, defaults.restrict_unit_ids),
            (META_RESTRICT_ADDRESSES, self.restrict_addresses, defaults.restrict_addresses),
        ];
        for (key, value, default) in flags {
            if value != default {
                result.push((key.to_string(), value.to_string()));
            }
        }
        if self.backlog != defaults.backlog {
            result.push((META_BACKLOG.to_string(), self.backlog.to_string()));
        }
        if self.startup_delay_secs != defaults.startup_delay_secs {
            result.push((META_STARTUP_DELAY.to_string(), self.startup_delay_secs.to_string()));
        }
        if let Some(mode) = &self.required_operational_mode {
            result.push((META_REQUIRED_MODE.to_string(), mode.clone()));
        }
        for (k, v) in &self.meta {
            result.push((k.clone(), v.clone()));
        }
        result
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}
