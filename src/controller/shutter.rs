// src/controller/shutter.rs - Simulated shutter controller
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

use crate::command::{Command, CommandAction, CommandParameters, Completion};
use crate::config::SimulationConfig;
use crate::controller::{ControllerEvent, ControllerKind, Executable, SyncCapable, SyncPulse, SyncSignal};
use crate::device::{DeviceArena, DeviceId};
use crate::error::{MotionError, MotionResult};

struct ShutterInner {
    name: String,
    arena: Arc<DeviceArena>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ShutterInner {
    fn set(&self, device: DeviceId, open: bool) -> MotionResult<()> {
        let changed = self.arena.update(device, |d| {
            let name = d.name;
            match d.as_shutter_mut() {
                Some(shutter) => {
                    let changed = shutter.open != open;
                    shutter.open = open;
                    Ok(changed)
                }
                None => Err(MotionError::invalid(format!("device '{}' is not a shutter", name))),
            }
        })??;
        if changed {
            tracing::debug!("{}: shutter {} {}", self.name, device.0, if open { "open" } else { "closed" });
            let _ = self.events.send(ControllerEvent::ShutterChanged { device, open });
        }
        Ok(())
    }
}

/// Shutter driven either by commands or by sync-in pulses from the sync unit.
pub struct SimulatedShutter {
    devices: Vec<DeviceId>,
    simulation: SimulationConfig,
    sync_in: mpsc::UnboundedSender<SyncPulse>,
    inner: Arc<ShutterInner>,
}

impl SimulatedShutter {
    pub fn new(name: &str, devices: Vec<DeviceId>, arena: Arc<DeviceArena>, simulation: SimulationConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (sync_in, pulses) = mpsc::unbounded_channel();
        let inner = Arc::new(ShutterInner {
            name: name.to_string(),
            arena,
            events,
        });
        tokio::spawn(pulse_listener(Arc::downgrade(&inner), pulses));
        Arc::new(Self {
            devices,
            simulation,
            sync_in,
            inner,
        })
    }

    fn targets(&self, command: &Command) -> MotionResult<Vec<DeviceId>> {
        if command.devices.is_empty() {
            return Ok(self.devices.clone());
        }
        let ids = self.inner.arena.ids_of(&command.devices)?;
        match ids.iter().find(|id| !self.devices.contains(id)) {
            Some(id) => Err(MotionError::unavailable(format!(
                "device {} is not owned by '{}'",
                id.0, self.inner.name
            ))),
            None => Ok(ids),
        }
    }
}

async fn pulse_listener(inner: Weak<ShutterInner>, mut pulses: mpsc::UnboundedReceiver<SyncPulse>) {
    while let Some(pulse) = pulses.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let result = match pulse.signal {
            SyncSignal::ShutterOpen => inner.set(pulse.device, true),
            SyncSignal::ShutterClose => inner.set(pulse.device, false),
            SyncSignal::Trigger => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("{}: sync pulse failed: {}", inner.name, e);
        }
    }
}

#[async_trait]
impl Executable for SimulatedShutter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Shutter
    }

    fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    async fn execute(&self, command: &Command) -> MotionResult<Completion> {
        let latency = self.simulation.latency();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let ids = self.targets(command)?;
        match (&command.action, &command.parameters) {
            (CommandAction::ChangeShutterState, CommandParameters::ShutterState { open }) => {
                for id in ids {
                    self.inner.set(id, *open)?;
                }
            }
            (CommandAction::Stop, _) => {
                for id in ids {
                    self.inner.set(id, false)?;
                }
            }
            (CommandAction::UpdateState, _) => {}
            (action, _) => {
                return Err(MotionError::invalid(format!(
                    "shutter '{}' does not support {:?}",
                    self.inner.name, action
                )));
            }
        }
        Ok(Completion::done())
    }

    fn sync_capable(&self) -> Option<&dyn SyncCapable> {
        Some(self)
    }
}

impl SyncCapable for SimulatedShutter {
    fn sync_in(&self) -> mpsc::UnboundedSender<SyncPulse> {
        self.sync_in.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[tokio::test]
    async fn command_and_pulse_switch_the_shutter() {
        let arena = Arc::new(DeviceArena::new(vec![Device::shutter('s', "shutter")]).unwrap());
        let shutter = SimulatedShutter::new("shutter", vec![DeviceId(0)], arena.clone(), SimulationConfig::default());
        let mut events = shutter.subscribe();

        shutter
            .execute(&Command::change_shutter_state("shutter", vec!['s'], true).unwrap())
            .await
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ControllerEvent::ShutterChanged { device: DeviceId(0), open: true }
        );

        shutter
            .sync_in()
            .send(SyncPulse { device: DeviceId(0), signal: SyncSignal::ShutterClose })
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ControllerEvent::ShutterChanged { device: DeviceId(0), open: false }
        );
    }

    #[tokio::test]
    async fn moves_are_rejected() {
        let arena = Arc::new(DeviceArena::new(vec![Device::shutter('s', "shutter")]).unwrap());
        let shutter = SimulatedShutter::new("shutter", vec![DeviceId(0)], arena, SimulationConfig::default());
        let cmd = Command::get_buffer_count("shutter").unwrap();
        assert!(matches!(shutter.execute(&cmd).await, Err(MotionError::InvalidRequest(_))));
    }
}
