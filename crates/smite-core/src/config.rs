//! Configuration resolution for the Smite panel.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/smite/panel.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`SMITE_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Files are partial: any key they omit keeps the value from the layer below.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::retry::BackoffPolicy;

/// Complete panel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Address the node control channel listens on.
    pub control_addr: SocketAddr,
    pub database_path: Option<PathBuf>,
    /// Host nodes use to reach panel-side reverse-tunnel servers.
    pub panel_host: String,
    pub port_range: PortRange,
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub send_timeout_secs: u64,
    pub apply_timeout_secs: u64,
    pub retry: BackoffPolicy,
    /// Directory for the rendered panel-side rathole `server.toml`.
    pub rathole_config_dir: Option<PathBuf>,
    /// Secret mixed into derived rathole service tokens.
    pub rathole_token_secret: String,
    pub auto_reset: AutoResetConfig,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], 7443)),
            database_path: None,
            panel_host: "127.0.0.1".to_string(),
            port_range: PortRange::default(),
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 15,
            send_timeout_secs: 10,
            apply_timeout_secs: 10,
            retry: BackoffPolicy::default(),
            rathole_config_dir: None,
            rathole_token_secret: "change-me".to_string(),
            auto_reset: AutoResetConfig::default(),
        }
    }
}

impl PanelConfig {
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub const fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    /// Check cross-field consistency after all layers are applied.
    pub fn validate(&self) -> Result<()> {
        if self.port_range.min == 0 || self.port_range.min > self.port_range.max {
            return Err(Error::Config(format!(
                "Invalid port range {}-{}",
                self.port_range.min, self.port_range.max
            )));
        }
        if self.heartbeat_timeout_secs <= self.sweep_interval_secs {
            return Err(Error::Config(
                "heartbeat_timeout_secs must exceed sweep_interval_secs".into(),
            ));
        }
        if self.send_timeout_secs == 0 || self.apply_timeout_secs == 0 {
            return Err(Error::Config("Timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Inclusive range of ports tunnels may bind or expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 1024,
            max: 65535,
        }
    }
}

impl PortRange {
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

/// Periodic backend reset schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoResetConfig {
    pub forwarding: ResetSchedule,
    pub reverse: ResetSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetSchedule {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for ResetSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 10,
        }
    }
}

impl ResetSchedule {
    /// Interval when enabled, `None` otherwise.
    pub const fn interval(&self) -> Option<Duration> {
        if self.enabled && self.interval_minutes > 0 {
            Some(Duration::from_secs(self.interval_minutes * 60))
        } else {
            None
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<PanelConfig> {
    let mut merged = serde_json::to_value(PanelConfig::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, load_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, load_config_file(path)?);
    }

    let mut config: PanelConfig = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("smite").join("panel.json"))
}

/// Default database location when none is configured.
pub fn default_database_path() -> Option<PathBuf> {
    global_config_path().and_then(|p| p.parent().map(|dir| dir.join("panel.db")))
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`; objects merge key by key, everything else
/// is replaced.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut PanelConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(addr) = lookup("SMITE_CONTROL_ADDR").and_then(|v| v.parse().ok()) {
        config.control_addr = addr;
    }
    if let Some(path) = lookup("SMITE_DATABASE_PATH") {
        config.database_path = Some(PathBuf::from(path));
    }
    if let Some(host) = lookup("SMITE_PANEL_HOST") {
        config.panel_host = host;
    }
    if let Some(n) = lookup("SMITE_PORT_MIN").and_then(|v| v.parse().ok()) {
        config.port_range.min = n;
    }
    if let Some(n) = lookup("SMITE_PORT_MAX").and_then(|v| v.parse().ok()) {
        config.port_range.max = n;
    }
    if let Some(n) = lookup("SMITE_HEARTBEAT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.heartbeat_timeout_secs = n;
    }
    if let Some(n) = lookup("SMITE_SEND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.send_timeout_secs = n;
    }
    if let Some(n) = lookup("SMITE_APPLY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.apply_timeout_secs = n;
    }
    if let Some(dir) = lookup("SMITE_RATHOLE_CONFIG_DIR") {
        config.rathole_config_dir = Some(PathBuf::from(dir));
    }
    if let Some(secret) = lookup("SMITE_RATHOLE_TOKEN_SECRET") {
        config.rathole_token_secret = secret;
    }
}
