// src/device.rs - Device records and the arena that owns them
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::error::{MotionError, MotionResult};

/// Single-character device name as used by motion scripts ("x", "y", "s").
pub type DeviceName = char;

/// Stable handle into the [`DeviceArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

/// Physical limits of a positioner axis.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionerLimits {
    pub max_speed: f64,
    pub max_acceleration: f64,
    pub max_deceleration: f64,
    /// Speed used by point-to-point moves when the script gives none
    pub default_speed: f64,
    pub min_position: Option<f64>,
    pub max_position: Option<f64>,
}

impl PositionerLimits {
    pub fn contains(&self, position: f64) -> bool {
        self.min_position.is_none_or(|min| position >= min)
            && self.max_position.is_none_or(|max| position <= max)
    }
}

/// Acceleration, deceleration and speed currently loaded into the hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveSettings {
    pub acceleration: f64,
    pub deceleration: f64,
    pub speed: f64,
}

impl MoveSettings {
    pub fn differs_from(&self, other: &MoveSettings, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0);
        !(close(self.acceleration, other.acceleration)
            && close(self.deceleration, other.deceleration)
            && close(self.speed, other.speed))
    }
}

#[derive(Debug, Clone)]
pub struct Positioner {
    pub position: f64,
    pub speed: f64,
    pub acceleration: f64,
    pub settings: MoveSettings,
    pub limits: PositionerLimits,
    /// Axis units to tool-space units
    pub tool_scale: f64,
    /// False for axes that never pulse sync-out and rely on rethrow
    pub native_sync_out: bool,
    pub settings_update_pending: bool,
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Shutter {
    pub open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Positioner,
    Shutter,
}

#[derive(Debug, Clone)]
pub enum DeviceState {
    Positioner(Positioner),
    Shutter(Shutter),
}

/// Live state of one axis or shutter. Mutated only by its owning controller.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub name: DeviceName,
    pub controller: String,
    pub connected: bool,
    pub state: DeviceState,
}

impl Device {
    pub fn positioner(name: DeviceName, controller: &str, positioner: Positioner) -> Self {
        Self {
            id: DeviceId(usize::MAX),
            name,
            controller: controller.to_string(),
            connected: true,
            state: DeviceState::Positioner(positioner),
        }
    }

    pub fn shutter(name: DeviceName, controller: &str) -> Self {
        Self {
            id: DeviceId(usize::MAX),
            name,
            controller: controller.to_string(),
            connected: true,
            state: DeviceState::Shutter(Shutter::default()),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self.state {
            DeviceState::Positioner(_) => DeviceKind::Positioner,
            DeviceState::Shutter(_) => DeviceKind::Shutter,
        }
    }

    pub fn as_positioner(&self) -> Option<&Positioner> {
        match &self.state {
            DeviceState::Positioner(p) => Some(p),
            DeviceState::Shutter(_) => None,
        }
    }

    pub fn as_positioner_mut(&mut self) -> Option<&mut Positioner> {
        match &mut self.state {
            DeviceState::Positioner(p) => Some(p),
            DeviceState::Shutter(_) => None,
        }
    }

    pub fn as_shutter(&self) -> Option<&Shutter> {
        match &self.state {
            DeviceState::Shutter(s) => Some(s),
            DeviceState::Positioner(_) => None,
        }
    }

    pub fn as_shutter_mut(&mut self) -> Option<&mut Shutter> {
        match &mut self.state {
            DeviceState::Shutter(s) => Some(s),
            DeviceState::Positioner(_) => None,
        }
    }

    /// Apply a property written by the script front end.
    ///
    /// Known kinematic properties update the limits; anything else is kept in
    /// the free-form property map. Either way the positioner is flagged so the
    /// next move reloads its settings.
    pub fn apply_property(&mut self, property: &str, value: &Value) -> MotionResult<()> {
        let name = self.name;
        let positioner = self.as_positioner_mut().ok_or_else(|| {
            MotionError::invalid(format!("device '{}' is a shutter and has no property '{}'", name, property))
        })?;

        let number = || {
            value
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| MotionError::invalid(format!("property '{}' expects a finite number, got {}", property, value)))
        };
        let positive = || {
            let v = number()?;
            if v > 0.0 {
                Ok(v)
            } else {
                Err(MotionError::invalid(format!("property '{}' must be positive, got {}", property, v)))
            }
        };

        match property.to_ascii_lowercase().as_str() {
            "speed" | "defaultspeed" | "default_speed" => {
                positioner.limits.default_speed = positive()?.min(positioner.limits.max_speed)
            }
            "maxspeed" | "max_speed" => positioner.limits.max_speed = positive()?,
            "acceleration" | "maxacceleration" | "max_acceleration" => {
                positioner.limits.max_acceleration = positive()?
            }
            "deceleration" | "maxdeceleration" | "max_deceleration" => {
                positioner.limits.max_deceleration = positive()?
            }
            "minposition" | "min_position" => positioner.limits.min_position = Some(number()?),
            "maxposition" | "max_position" => positioner.limits.max_position = Some(number()?),
            "toolscale" | "tool_scale" => positioner.tool_scale = positive()?,
            _ => {
                positioner.properties.insert(property.to_string(), value.clone());
            }
        }
        positioner.settings_update_pending = true;
        Ok(())
    }
}

/// Arena of every device in the rig, addressed by [`DeviceId`].
#[derive(Debug)]
pub struct DeviceArena {
    devices: RwLock<Vec<Device>>,
    by_name: HashMap<DeviceName, DeviceId>,
}

impl DeviceArena {
    pub fn new(devices: Vec<Device>) -> MotionResult<Self> {
        let mut by_name = HashMap::new();
        let mut stored = Vec::with_capacity(devices.len());
        for (index, mut device) in devices.into_iter().enumerate() {
            let id = DeviceId(index);
            if by_name.insert(device.name, id).is_some() {
                return Err(MotionError::invalid(format!("duplicate device name '{}'", device.name)));
            }
            device.id = id;
            stored.push(device);
        }
        Ok(Self {
            devices: RwLock::new(stored),
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn id_of(&self, name: DeviceName) -> MotionResult<DeviceId> {
        self.by_name
            .get(&name)
            .copied()
            .ok_or_else(|| MotionError::unavailable(format!("no device named '{}'", name)))
    }

    pub fn ids_of(&self, names: &[DeviceName]) -> MotionResult<Vec<DeviceId>> {
        names.iter().map(|name| self.id_of(*name)).collect()
    }

    pub fn name_of(&self, id: DeviceId) -> MotionResult<DeviceName> {
        self.with(id, |device| device.name)
    }

    pub fn names(&self) -> Vec<DeviceName> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.iter().map(|d| d.name).collect()
    }

    /// Run `f` against a shared view of the device.
    pub fn with<R>(&self, id: DeviceId, f: impl FnOnce(&Device) -> R) -> MotionResult<R> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices
            .get(id.0)
            .map(f)
            .ok_or_else(|| MotionError::unavailable(format!("no device with handle {}", id.0)))
    }

    /// Run `f` against a mutable view of the device.
    pub fn update<R>(&self, id: DeviceId, f: impl FnOnce(&mut Device) -> R) -> MotionResult<R> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        devices
            .get_mut(id.0)
            .map(f)
            .ok_or_else(|| MotionError::unavailable(format!("no device with handle {}", id.0)))
    }

    pub fn snapshot(&self, name: DeviceName) -> MotionResult<Device> {
        let id = self.id_of(name)?;
        self.with(id, Device::clone)
    }

    /// Clone of a positioner's state, failing for shutters and disconnected axes.
    pub fn positioner(&self, name: DeviceName) -> MotionResult<Positioner> {
        let device = self.snapshot(name)?;
        if !device.connected {
            return Err(MotionError::unavailable(format!("device '{}' is not connected", name)));
        }
        match device.state {
            DeviceState::Positioner(p) => Ok(p),
            DeviceState::Shutter(_) => Err(MotionError::invalid(format!("device '{}' is not a positioner", name))),
        }
    }

    pub fn all_connected(&self, ids: &[DeviceId]) -> bool {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .all(|id| devices.get(id.0).is_some_and(|device| device.connected))
    }

    pub fn set_connected(&self, name: DeviceName, connected: bool) -> MotionResult<()> {
        let id = self.id_of(name)?;
        self.update(id, |device| device.connected = connected)
    }
}

/// Expand a script device string ("xy") into one name per character.
pub fn parse_device_names(devices: &str) -> MotionResult<Vec<DeviceName>> {
    let mut names = Vec::new();
    for name in devices.chars().filter(|c| !c.is_whitespace() && *c != ',') {
        if names.contains(&name) {
            return Err(MotionError::invalid(format!("device '{}' listed twice in \"{}\"", name, devices)));
        }
        names.push(name);
    }
    if names.is_empty() {
        return Err(MotionError::invalid("no devices given"));
    }
    Ok(names)
}
