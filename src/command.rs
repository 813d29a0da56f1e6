// src/command.rs - Commands, command lines and completion signals
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::device::{DeviceName, MoveSettings};
use crate::error::{MotionError, MotionResult};
use crate::planner::blend::JointVelocities;
use crate::planner::lead::LeadInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandAction {
    MoveAbsolute,
    UpdateMoveSettings,
    ChangeShutterState,
    AddSyncInAction,
    AddSyncControllerBufferItem,
    StartQueueExecution,
    GetBufferCount,
    AwaitQueuedItems,
    Stop,
    UpdateState,
    UpdateDeviceProperty,
}

/// Target position of one device and the time it is given to get there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MoveTarget {
    pub position: f64,
    /// Seconds, lead phases included
    pub allocated_time: f64,
    pub lead: Option<LeadInfo>,
    /// Velocities to pass through the start and the target with, for moves
    /// that blend into their neighbours
    pub velocity: Option<JointVelocities>,
}

impl MoveTarget {
    pub fn new(position: f64, allocated_time: f64) -> Self {
        Self {
            position,
            allocated_time,
            lead: None,
            velocity: None,
        }
    }

    pub fn with_velocities(mut self, start: f64, end: f64) -> Self {
        self.velocity = Some(JointVelocities { start, end });
        self
    }
}

/// Shutter switching offsets relative to the start of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShutterTiming {
    pub delay_on_ms: Option<u64>,
    pub delay_off_ms: Option<u64>,
}

impl ShutterTiming {
    pub fn uses_shutter(&self) -> bool {
        self.delay_on_ms.is_some() || self.delay_off_ms.is_some()
    }
}

/// One record of the sync unit FIFO.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionInformation {
    pub devices: Vec<DeviceName>,
    /// Fire immediately instead of waiting for the previous record
    pub launch: bool,
    pub rethrow_timeout: Duration,
    pub shutter: ShutterTiming,
}

/// What an `AwaitQueuedItems` caller waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AwaitTarget {
    #[default]
    Completed,
    LastItemTaken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandParameters {
    None,
    MoveAbsolute {
        targets: Vec<MoveTarget>,
        shutter: ShutterTiming,
    },
    MoveSettings(Vec<MoveSettings>),
    ShutterState {
        open: bool,
    },
    SyncInActions(Vec<MoveTarget>),
    BufferItem(ExecutionInformation),
    AwaitQueuedItems(AwaitTarget),
    DeviceProperty {
        property: String,
        value: Value,
    },
}

/// Immutable instruction for one controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub controller: String,
    pub devices: Vec<DeviceName>,
    pub action: CommandAction,
    pub parameters: CommandParameters,
    pub await_completion: bool,
    pub estimated_duration: Duration,
}

impl Command {
    /// Build a command, checking device uniqueness and that the payload fits the action.
    pub fn new(
        controller: impl Into<String>,
        devices: Vec<DeviceName>,
        action: CommandAction,
        parameters: CommandParameters,
    ) -> MotionResult<Self> {
        let controller = controller.into();
        for (i, device) in devices.iter().enumerate() {
            if devices[..i].contains(device) {
                return Err(MotionError::invalid(format!(
                    "device '{}' appears twice in a {:?} command for '{}'",
                    device, action, controller
                )));
            }
        }

        let per_device = match (&action, &parameters) {
            (CommandAction::MoveAbsolute, CommandParameters::MoveAbsolute { targets, .. }) => {
                for target in targets {
                    if !target.position.is_finite() || !(target.allocated_time >= 0.0) {
                        return Err(MotionError::invalid("move target must be finite with a non-negative time"));
                    }
                }
                Some(targets.len())
            }
            (CommandAction::AddSyncInAction, CommandParameters::SyncInActions(targets)) => Some(targets.len()),
            (CommandAction::UpdateMoveSettings, CommandParameters::MoveSettings(settings)) => Some(settings.len()),
            (CommandAction::ChangeShutterState, CommandParameters::ShutterState { .. })
            | (CommandAction::AddSyncControllerBufferItem, CommandParameters::BufferItem(_))
            | (CommandAction::AwaitQueuedItems, CommandParameters::AwaitQueuedItems(_)) => None,
            (CommandAction::UpdateDeviceProperty, CommandParameters::DeviceProperty { .. }) => {
                if devices.len() != 1 {
                    return Err(MotionError::invalid("UpdateDeviceProperty targets exactly one device"));
                }
                None
            }
            (
                CommandAction::StartQueueExecution
                | CommandAction::GetBufferCount
                | CommandAction::Stop
                | CommandAction::UpdateState,
                CommandParameters::None,
            ) => None,
            (action, parameters) => {
                return Err(MotionError::invalid(format!(
                    "{:?} cannot carry {:?}",
                    action, parameters
                )));
            }
        };
        if let Some(count) = per_device
            && count != devices.len()
        {
            return Err(MotionError::invalid(format!(
                "{:?} for '{}' has {} entries for {} devices",
                action,
                controller,
                count,
                devices.len()
            )));
        }

        let estimated_duration = match &parameters {
            CommandParameters::MoveAbsolute { targets, .. } => Duration::from_secs_f64(
                targets.iter().map(|t| t.allocated_time).fold(0.0, f64::max),
            ),
            _ => Duration::ZERO,
        };

        Ok(Self {
            controller,
            devices,
            action,
            parameters,
            await_completion: false,
            estimated_duration,
        })
    }

    pub fn awaited(mut self, await_completion: bool) -> Self {
        self.await_completion = await_completion;
        self
    }

    pub fn with_estimate(mut self, estimated_duration: Duration) -> Self {
        self.estimated_duration = estimated_duration;
        self
    }

    pub fn move_absolute(
        controller: &str,
        devices: Vec<DeviceName>,
        targets: Vec<MoveTarget>,
        shutter: ShutterTiming,
    ) -> MotionResult<Self> {
        Self::new(
            controller,
            devices,
            CommandAction::MoveAbsolute,
            CommandParameters::MoveAbsolute { targets, shutter },
        )
    }

    pub fn update_move_settings(
        controller: &str,
        devices: Vec<DeviceName>,
        settings: Vec<MoveSettings>,
    ) -> MotionResult<Self> {
        Self::new(
            controller,
            devices,
            CommandAction::UpdateMoveSettings,
            CommandParameters::MoveSettings(settings),
        )
    }

    pub fn change_shutter_state(controller: &str, devices: Vec<DeviceName>, open: bool) -> MotionResult<Self> {
        Self::new(
            controller,
            devices,
            CommandAction::ChangeShutterState,
            CommandParameters::ShutterState { open },
        )
    }

    pub fn add_sync_in_action(
        controller: &str,
        devices: Vec<DeviceName>,
        actions: Vec<MoveTarget>,
    ) -> MotionResult<Self> {
        Self::new(
            controller,
            devices,
            CommandAction::AddSyncInAction,
            CommandParameters::SyncInActions(actions),
        )
    }

    pub fn add_buffer_item(controller: &str, info: ExecutionInformation) -> MotionResult<Self> {
        Self::new(
            controller,
            Vec::new(),
            CommandAction::AddSyncControllerBufferItem,
            CommandParameters::BufferItem(info),
        )
    }

    pub fn start_queue_execution(controller: &str) -> MotionResult<Self> {
        Self::new(controller, Vec::new(), CommandAction::StartQueueExecution, CommandParameters::None)
    }

    pub fn get_buffer_count(controller: &str) -> MotionResult<Self> {
        Self::new(controller, Vec::new(), CommandAction::GetBufferCount, CommandParameters::None)
    }

    pub fn await_queued_items(controller: &str, target: AwaitTarget) -> MotionResult<Self> {
        Ok(Self::new(
            controller,
            Vec::new(),
            CommandAction::AwaitQueuedItems,
            CommandParameters::AwaitQueuedItems(target),
        )?
        .awaited(true))
    }

    pub fn stop(controller: &str, devices: Vec<DeviceName>) -> MotionResult<Self> {
        Self::new(controller, devices, CommandAction::Stop, CommandParameters::None)
    }

    pub fn update_state(controller: &str, devices: Vec<DeviceName>) -> MotionResult<Self> {
        Self::new(controller, devices, CommandAction::UpdateState, CommandParameters::None)
    }

    pub fn update_device_property(
        controller: &str,
        device: DeviceName,
        property: &str,
        value: Value,
    ) -> MotionResult<Self> {
        Self::new(
            controller,
            vec![device],
            CommandAction::UpdateDeviceProperty,
            CommandParameters::DeviceProperty {
                property: property.to_string(),
                value,
            },
        )
    }

    /// Pair each device with its entry of a per-device payload.
    pub fn targets(&self) -> Option<Vec<(DeviceName, MoveTarget)>> {
        match &self.parameters {
            CommandParameters::MoveAbsolute { targets, .. } | CommandParameters::SyncInActions(targets) => {
                Some(self.devices.iter().copied().zip(targets.iter().copied()).collect())
            }
            _ => None,
        }
    }
}

/// One logical program line; the unit the dispatcher executes.
#[derive(Debug, Clone)]
pub struct CommandLine {
    pub id: Uuid,
    pub label: String,
    pub commands: Vec<Command>,
}

impl CommandLine {
    pub fn new(label: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            commands,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn count(&self, action: CommandAction) -> usize {
        self.commands.iter().filter(|c| c.action == action).count()
    }

    /// Group commands by controller, in order of first appearance, keeping
    /// the original order inside each group.
    pub fn group_by_controller(&self) -> Vec<(String, Vec<&Command>)> {
        let mut groups: Vec<(String, Vec<&Command>)> = Vec::new();
        for command in &self.commands {
            match groups.iter_mut().find(|(name, _)| *name == command.controller) {
                Some((_, group)) => group.push(command),
                None => groups.push((command.controller.clone(), vec![command])),
            }
        }
        groups
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Done,
    BufferFree(usize),
}

/// Result of `execute`: the immediate outcome plus, for commands whose effect
/// outlives the call, a signal resolved when that effect completes.
#[derive(Debug)]
pub struct Completion {
    pub outcome: CommandOutcome,
    pending: Option<oneshot::Receiver<MotionResult<()>>>,
}

impl Completion {
    pub fn done() -> Self {
        Self {
            outcome: CommandOutcome::Done,
            pending: None,
        }
    }

    pub fn buffer_free(slots: usize) -> Self {
        Self {
            outcome: CommandOutcome::BufferFree(slots),
            pending: None,
        }
    }

    pub fn pending(receiver: oneshot::Receiver<MotionResult<()>>) -> Self {
        Self {
            outcome: CommandOutcome::Done,
            pending: Some(receiver),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Wait for the effect to complete. A dropped signal counts as aborted.
    pub async fn wait(self) -> MotionResult<CommandOutcome> {
        if let Some(receiver) = self.pending {
            receiver
                .await
                .map_err(|_| MotionError::Aborted("completion signal dropped".to_string()))??;
        }
        Ok(self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_devices_are_rejected() {
        let result = Command::move_absolute(
            "stage",
            vec!['x', 'x'],
            vec![MoveTarget::new(1.0, 0.1), MoveTarget::new(2.0, 0.1)],
            ShutterTiming::default(),
        );
        assert!(matches!(result, Err(MotionError::InvalidRequest(_))));
    }

    #[test]
    fn payload_length_must_match_devices() {
        let result = Command::move_absolute("stage", vec!['x', 'y'], vec![MoveTarget::new(1.0, 0.1)], ShutterTiming::default());
        assert!(result.is_err());
    }

    #[test]
    fn payload_must_match_action() {
        let result = Command::new("stage", vec![], CommandAction::Stop, CommandParameters::ShutterState { open: true });
        assert!(result.is_err());
    }

    #[test]
    fn estimate_is_longest_allocated_time() {
        let cmd = Command::move_absolute(
            "stage",
            vec!['x', 'y'],
            vec![MoveTarget::new(1.0, 0.25), MoveTarget::new(2.0, 0.5)],
            ShutterTiming::default(),
        )
        .unwrap();
        assert_eq!(cmd.estimated_duration, Duration::from_millis(500));
        assert!(!cmd.await_completion);
    }

    #[test]
    fn grouping_is_stable() {
        let line = CommandLine::new(
            "test",
            vec![
                Command::update_state("a", vec!['x']).unwrap(),
                Command::update_state("b", vec!['y']).unwrap(),
                Command::stop("a", vec!['x']).unwrap(),
            ],
        );
        let groups = line.group_by_controller();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "a");
        assert_eq!(groups[0].1[0].action, CommandAction::UpdateState);
        assert_eq!(groups[0].1[1].action, CommandAction::Stop);
        assert_eq!(groups[1].0, "b");
    }

    #[tokio::test]
    async fn dropped_signal_is_aborted() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let result = Completion::pending(rx).wait().await;
        assert!(matches!(result, Err(MotionError::Aborted(_))));
    }
}
