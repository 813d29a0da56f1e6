//! # Rig Configuration
//!
//! Describes the controllers, their devices and the engine constants of one
//! motion rig.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [master]
//! name = "master"
//! slaves = ["stage", "shutter", "sync"]
//! buffer_safety_margin = 2
//!
//! [[controllers]]
//! name = "stage"
//! kind = "positioner"
//! buffer_capacity = 16
//!
//! [[controllers.devices]]
//! name = "x"
//! max_speed = 200.0
//! max_acceleration = 1000.0
//!
//! [[controllers]]
//! name = "shutter"
//! kind = "shutter"
//!
//! [[controllers.devices]]
//! name = "s"
//!
//! [[controllers]]
//! name = "sync"
//! kind = "sync"
//! buffer_capacity = 16
//! ```
//!
//! Omitted sections fall back to the defaults below. `Config::default()` is a
//! complete two-axis rig with shutter and sync unit.

// src/config.rs - Rig configuration file
use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::ControllerKind;
use crate::device::{Device, MoveSettings, Positioner, PositionerLimits};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub master: Option<MasterConfig>,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            dispatcher: DispatcherConfig::default(),
            master: Some(MasterConfig::default()),
            planner: PlannerConfig::default(),
            simulation: SimulationConfig::default(),
            controllers: vec![
                ControllerConfig {
                    name: "stage".to_string(),
                    kind: ControllerKind::Positioner,
                    buffer_capacity: default_buffer_capacity(),
                    devices: vec![DeviceConfig::axis('x'), DeviceConfig::axis('y')],
                },
                ControllerConfig {
                    name: "shutter".to_string(),
                    kind: ControllerKind::Shutter,
                    buffer_capacity: default_buffer_capacity(),
                    devices: vec![DeviceConfig::axis('s')],
                },
                ControllerConfig {
                    name: "sync".to_string(),
                    kind: ControllerKind::Sync,
                    buffer_capacity: default_buffer_capacity(),
                    devices: Vec::new(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default = "default_system_name")]
    pub name: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: default_system_name(),
        }
    }
}

/// Command dispatcher and periodic state refresh.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// 0 disables the periodic refresh
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,
}

impl DispatcherConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
    #[serde(default = "default_master_name")]
    pub name: String,
    #[serde(default = "default_slaves")]
    pub slaves: Vec<String>,
    /// Slots kept free in every slave buffer for in-flight hardware latency
    #[serde(default = "default_buffer_safety_margin")]
    pub buffer_safety_margin: usize,
    /// Added to the longest allocated time of a segment to form its rethrow timeout
    #[serde(default = "default_rethrow_margin_ms")]
    pub rethrow_margin_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: default_master_name(),
            slaves: default_slaves(),
            buffer_safety_margin: default_buffer_safety_margin(),
            rethrow_margin_ms: default_rethrow_margin_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerConfig {
    /// Seconds spent ramping acceleration in lead-in/lead-out segments
    #[serde(default = "default_jerk_time")]
    pub jerk_time: f64,
    #[serde(default = "default_accuracy")]
    pub default_accuracy: f64,
    #[serde(default = "default_time_accuracy")]
    pub default_time_accuracy: f64,
    /// Relative tolerance for comparing move settings
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
    /// Relative tolerance on per-axis total time within one line
    #[serde(default = "default_sync_tolerance")]
    pub sync_tolerance: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            jerk_time: default_jerk_time(),
            default_accuracy: default_accuracy(),
            default_time_accuracy: default_time_accuracy(),
            position_tolerance: default_position_tolerance(),
            sync_tolerance: default_sync_tolerance(),
        }
    }
}

/// Behaviour of the simulated controllers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Multiplier on simulated motion time; 0.1 runs ten times faster
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    #[serde(default)]
    pub command_latency_ms: u64,
    #[serde(default)]
    pub latency_jitter_ms: u64,
}

impl SimulationConfig {
    /// Wall-clock duration of `seconds` of simulated motion.
    pub fn scaled(&self, seconds: f64) -> Duration {
        Duration::from_secs_f64((seconds * self.time_scale).max(0.0))
    }

    /// Simulated link latency for one command, jittered.
    pub fn latency(&self) -> Duration {
        if self.command_latency_ms == 0 && self.latency_jitter_ms == 0 {
            return Duration::ZERO;
        }
        let jitter = if self.latency_jitter_ms > 0 {
            rand::rng().random_range(0..=self.latency_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.command_latency_ms + jitter)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_scale: default_time_scale(),
            command_latency_ms: 0,
            latency_jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub name: String,
    pub kind: ControllerKind,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// One device. Kinematic fields are ignored for shutters.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: char,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default = "default_max_acceleration")]
    pub max_acceleration: f64,
    #[serde(default = "default_max_acceleration")]
    pub max_deceleration: f64,
    #[serde(default = "default_default_speed")]
    pub default_speed: f64,
    #[serde(default)]
    pub min_position: Option<f64>,
    #[serde(default)]
    pub max_position: Option<f64>,
    #[serde(default = "default_tool_scale")]
    pub tool_scale: f64,
    #[serde(default = "default_native_sync_out")]
    pub native_sync_out: bool,
    #[serde(default)]
    pub initial_position: f64,
}

impl DeviceConfig {
    pub fn axis(name: char) -> Self {
        Self {
            name,
            max_speed: default_max_speed(),
            max_acceleration: default_max_acceleration(),
            max_deceleration: default_max_acceleration(),
            default_speed: default_default_speed(),
            min_position: None,
            max_position: None,
            tool_scale: default_tool_scale(),
            native_sync_out: default_native_sync_out(),
            initial_position: 0.0,
        }
    }

    pub fn limits(&self) -> PositionerLimits {
        PositionerLimits {
            max_speed: self.max_speed,
            max_acceleration: self.max_acceleration,
            max_deceleration: self.max_deceleration,
            default_speed: self.default_speed.min(self.max_speed),
            min_position: self.min_position,
            max_position: self.max_position,
        }
    }

    /// Build the live device record owned by `controller`.
    pub fn build(&self, controller: &str, kind: ControllerKind) -> Device {
        match kind {
            ControllerKind::Shutter => Device::shutter(self.name, controller),
            _ => Device::positioner(
                self.name,
                controller,
                Positioner {
                    position: self.initial_position,
                    speed: 0.0,
                    acceleration: 0.0,
                    settings: MoveSettings {
                        acceleration: self.max_acceleration,
                        deceleration: self.max_deceleration,
                        speed: self.default_speed.min(self.max_speed),
                    },
                    limits: self.limits(),
                    tool_scale: self.tool_scale,
                    native_sync_out: self.native_sync_out,
                    settings_update_pending: true,
                    properties: Default::default(),
                },
            ),
        }
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.name == name)
    }

    /// Check cross-references and numeric ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mut controller_names = HashSet::new();
        let mut device_names = HashSet::new();
        for controller in &self.controllers {
            if !controller_names.insert(controller.name.as_str()) {
                return invalid(format!("controller '{}' is defined twice", controller.name));
            }
            if controller.kind == ControllerKind::Master {
                return invalid(format!(
                    "controller '{}': the master is configured in [master], not [[controllers]]",
                    controller.name
                ));
            }
            if controller.kind == ControllerKind::Sync && !controller.devices.is_empty() {
                return invalid(format!("sync unit '{}' cannot own devices", controller.name));
            }
            if controller.kind != ControllerKind::Sync && controller.devices.is_empty() {
                return invalid(format!("controller '{}' has no devices", controller.name));
            }
            for device in &controller.devices {
                if !device_names.insert(device.name) {
                    return invalid(format!("device '{}' is defined twice", device.name));
                }
                if device.name.is_whitespace() || device.name == ',' {
                    return invalid(format!("'{}' cannot be used as a device name", device.name));
                }
                if controller.kind != ControllerKind::Positioner {
                    continue;
                }
                for (label, value) in [
                    ("max_speed", device.max_speed),
                    ("max_acceleration", device.max_acceleration),
                    ("max_deceleration", device.max_deceleration),
                    ("default_speed", device.default_speed),
                    ("tool_scale", device.tool_scale),
                ] {
                    if !(value.is_finite() && value > 0.0) {
                        return invalid(format!("device '{}': {} must be positive", device.name, label));
                    }
                }
                if let (Some(min), Some(max)) = (device.min_position, device.max_position)
                    && min > max
                {
                    return invalid(format!("device '{}': min_position exceeds max_position", device.name));
                }
            }
        }

        if let Some(master) = &self.master {
            if controller_names.contains(master.name.as_str()) {
                return invalid(format!("master name '{}' clashes with a controller", master.name));
            }
            let mut sync_units = 0;
            let mut shutters = 0;
            for slave in &master.slaves {
                let Some(controller) = self.controller(slave) else {
                    return invalid(format!("master slave '{}' is not a configured controller", slave));
                };
                match controller.kind {
                    ControllerKind::Sync => sync_units += 1,
                    ControllerKind::Shutter => shutters += 1,
                    _ => {}
                }
                if controller.kind != ControllerKind::Shutter
                    && controller.buffer_capacity <= master.buffer_safety_margin
                {
                    return invalid(format!(
                        "controller '{}': buffer_capacity {} must exceed the safety margin {}",
                        slave, controller.buffer_capacity, master.buffer_safety_margin
                    ));
                }
            }
            if sync_units != 1 {
                return invalid(format!("master needs exactly one sync unit, found {}", sync_units));
            }
            if shutters > 1 {
                return invalid("master supports at most one shutter controller".to_string());
            }
        }

        let planner = &self.planner;
        if !(planner.jerk_time >= 0.0) {
            return invalid("planner.jerk_time must not be negative".to_string());
        }
        for (label, value) in [
            ("default_accuracy", planner.default_accuracy),
            ("default_time_accuracy", planner.default_time_accuracy),
            ("position_tolerance", planner.position_tolerance),
            ("sync_tolerance", planner.sync_tolerance),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("planner.{} must be positive", label));
            }
        }
        if !(self.simulation.time_scale.is_finite() && self.simulation.time_scale > 0.0) {
            return invalid("simulation.time_scale must be positive".to_string());
        }
        if self.dispatcher.refresh_timeout_ms == 0 {
            return invalid("dispatcher.refresh_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_system_name() -> String { "stage rig".to_string() }
fn default_refresh_interval_ms() -> u64 { 250 }
fn default_refresh_timeout_ms() -> u64 { 1000 }
fn default_master_name() -> String { "master".to_string() }
fn default_slaves() -> Vec<String> { vec!["stage".to_string(), "shutter".to_string(), "sync".to_string()] }
fn default_buffer_safety_margin() -> usize { 2 }
fn default_rethrow_margin_ms() -> u64 { 50 }
fn default_jerk_time() -> f64 { 0.01 }
fn default_accuracy() -> f64 { 0.001 }
fn default_time_accuracy() -> f64 { 0.03 }
fn default_position_tolerance() -> f64 { 1e-6 }
fn default_sync_tolerance() -> f64 { 1e-6 }
fn default_time_scale() -> f64 { 1.0 }
fn default_buffer_capacity() -> usize { 16 }
fn default_max_speed() -> f64 { 200.0 }
fn default_max_acceleration() -> f64 { 1000.0 }
fn default_default_speed() -> f64 { 100.0 }
fn default_tool_scale() -> f64 { 1.0 }
fn default_native_sync_out() -> bool { true }

/// Load and validate configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            Err(ConfigError::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_rig_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let master = config.master.as_ref().unwrap();
        assert_eq!(master.buffer_safety_margin, 2);
        assert_eq!(config.planner.default_accuracy, 0.001);
        assert_eq!(config.planner.default_time_accuracy, 0.03);
        assert_eq!(config.dispatcher.refresh_timeout_ms, 1000);
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("rig.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[[controllers]]\nname = 'stage'\nkind = 'positioner'\n\n[[controllers.devices]]\nname = 'z'\nmax_speed = 20.0"
        )
        .unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert!(config.master.is_none());
        let device = &config.controllers[0].devices[0];
        assert_eq!(device.name, 'z');
        assert_eq!(device.max_speed, 20.0);
        // Defaults for missing fields
        assert_eq!(device.max_acceleration, 1000.0);
        assert!(device.native_sync_out);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_rig.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_master_needs_one_sync_unit() {
        let mut config = Config::default();
        config.master.as_mut().unwrap().slaves = vec!["stage".to_string()];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_capacity_must_exceed_margin() {
        let mut config = Config::default();
        config.controllers[0].buffer_capacity = 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_device_names() {
        let mut config = Config::default();
        config.controllers[1].devices[0].name = 'x';
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_simulation_latency_without_jitter() {
        let sim = SimulationConfig {
            time_scale: 0.5,
            command_latency_ms: 3,
            latency_jitter_ms: 0,
        };
        assert_eq!(sim.latency(), Duration::from_millis(3));
        assert_eq!(sim.scaled(2.0), Duration::from_secs(1));
    }
}
