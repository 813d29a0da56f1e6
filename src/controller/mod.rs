// src/controller/mod.rs - Controller capabilities, handles and the registry
pub mod master;
pub mod positioner;
pub mod shutter;
pub mod sync_unit;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast, mpsc};

use crate::command::{Command, Completion};
use crate::device::{DeviceArena, DeviceId, DeviceName};
use crate::error::{MotionError, MotionResult};

pub use master::{MasterController, MasterPhase, MasterSettings, fill_count};
pub use positioner::SimulatedPositioner;
pub use shutter::SimulatedShutter;
pub use sync_unit::{FiredRecord, SimulatedSyncUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Positioner,
    Shutter,
    Sync,
    Master,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// Start the next buffered move
    Trigger,
    ShutterOpen,
    ShutterClose,
}

/// Hardware sync-in line pulse addressed to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPulse {
    pub device: DeviceId,
    pub signal: SyncSignal,
}

/// Events published on a controller's output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A device finished its buffered move
    SyncOut { device: DeviceId },
    BufferHasFreeSpace,
    LastBufferItemTaken,
    ExecutionCompleted,
    ShutterChanged { device: DeviceId, open: bool },
}

/// Anything that executes commands.
#[async_trait]
pub trait Executable: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ControllerKind;

    fn devices(&self) -> &[DeviceId];

    /// Apply `command`. Long-running effects are reported through the
    /// returned completion rather than by blocking here.
    async fn execute(&self, command: &Command) -> MotionResult<Completion>;

    fn bufferable(&self) -> Option<&dyn Bufferable> {
        None
    }

    fn sync_capable(&self) -> Option<&dyn SyncCapable> {
        None
    }
}

/// Controllers with an onboard command buffer.
#[async_trait]
pub trait Bufferable: Send + Sync {
    fn buffer_capacity(&self) -> usize;

    async fn free_slots(&self) -> usize;
}

/// Controllers wired to the sync-pulse bus.
pub trait SyncCapable: Send + Sync {
    /// Input side: pulses addressed to this controller's devices
    fn sync_in(&self) -> mpsc::UnboundedSender<SyncPulse>;

    /// Output side: events this controller publishes
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent>;
}

pub type ControllerLock = Arc<Mutex<()>>;

pub fn new_controller_lock() -> ControllerLock {
    Arc::new(Mutex::new(()))
}

/// A controller together with the exclusive lock that serializes its commands.
#[derive(Clone)]
pub struct ControllerHandle {
    name: String,
    kind: ControllerKind,
    devices: Vec<DeviceId>,
    lock: ControllerLock,
    controller: Arc<dyn Executable>,
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("devices", &self.devices)
            .finish()
    }
}

impl ControllerHandle {
    pub fn new(controller: Arc<dyn Executable>) -> Self {
        Self::with_lock(controller, new_controller_lock())
    }

    pub fn with_lock(controller: Arc<dyn Executable>, lock: ControllerLock) -> Self {
        Self {
            name: controller.name().to_string(),
            kind: controller.kind(),
            devices: controller.devices().to_vec(),
            lock,
            controller,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn controller(&self) -> &Arc<dyn Executable> {
        &self.controller
    }

    pub fn is_bufferable(&self) -> bool {
        self.controller.bufferable().is_some()
    }

    /// Execute one command while holding the controller lock.
    pub async fn execute(&self, command: &Command) -> MotionResult<Completion> {
        let _guard = self.lock.lock().await;
        tracing::trace!(controller = %self.name, action = ?command.action, "Executing command");
        self.controller.execute(command).await
    }

    /// Non-blocking lock attempt; `None` while a command is executing.
    pub fn try_lock(&self) -> Option<OwnedMutexGuard<()>> {
        self.lock.clone().try_lock_owned().ok()
    }

    /// Execute under a guard obtained from [`ControllerHandle::try_lock`].
    pub async fn execute_locked(&self, _guard: &OwnedMutexGuard<()>, command: &Command) -> MotionResult<Completion> {
        self.controller.execute(command).await
    }
}

/// All controllers of the rig, addressed by name, plus the device routing table.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    handles: Vec<ControllerHandle>,
    by_name: HashMap<String, usize>,
    routes: HashMap<DeviceId, usize>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller. A master takes over routing of its slaves' devices.
    pub fn register(&mut self, handle: ControllerHandle) -> MotionResult<()> {
        if self.by_name.contains_key(handle.name()) {
            return Err(MotionError::invalid(format!("controller '{}' registered twice", handle.name())));
        }
        let index = self.handles.len();
        for device in handle.devices() {
            match (self.routes.get(device), handle.kind()) {
                (_, ControllerKind::Master) | (None, _) => {
                    self.routes.insert(*device, index);
                }
                (Some(owner), _) => {
                    return Err(MotionError::invalid(format!(
                        "device {} is owned by both '{}' and '{}'",
                        device.0,
                        self.handles[*owner].name(),
                        handle.name()
                    )));
                }
            }
        }
        self.by_name.insert(handle.name().to_string(), index);
        self.handles.push(handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> MotionResult<&ControllerHandle> {
        self.by_name
            .get(name)
            .map(|&i| &self.handles[i])
            .ok_or_else(|| MotionError::unavailable(format!("no controller named '{}'", name)))
    }

    /// The controller that commands for `device` go to.
    pub fn route_for(&self, device: DeviceId) -> MotionResult<&ControllerHandle> {
        self.routes
            .get(&device)
            .map(|&i| &self.handles[i])
            .ok_or_else(|| MotionError::unavailable(format!("no controller owns device {}", device.0)))
    }

    pub fn route_for_name(&self, arena: &DeviceArena, device: DeviceName) -> MotionResult<&ControllerHandle> {
        self.route_for(arena.id_of(device)?)
    }

    pub fn handles(&self) -> &[ControllerHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
