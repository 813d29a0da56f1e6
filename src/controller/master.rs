// src/controller/master.rs - Master controller: segment buffer, filling and sync handshake
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::command::{
    AwaitTarget, Command, CommandAction, CommandOutcome, CommandParameters, Completion, ExecutionInformation,
    MoveTarget, ShutterTiming,
};
use crate::controller::{
    ControllerEvent, ControllerHandle, ControllerKind, ControllerLock, Executable, new_controller_lock,
};
use crate::device::{DeviceArena, DeviceId, DeviceName, MoveSettings};
use crate::diagnostics::DiagnosticLog;
use crate::error::{MotionError, MotionResult};

const SOURCE: &str = "master";

/// Number of segments a filling pass may push.
///
/// `margin` slots of the fullest slave buffer stay free to absorb commands
/// still in flight on the hardware link.
pub fn fill_count(min_free_slots: usize, margin: usize, buffered: usize) -> usize {
    min_free_slots.saturating_sub(margin).min(buffered)
}

#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub buffer_safety_margin: usize,
    pub rethrow_margin: Duration,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            buffer_safety_margin: 2,
            rethrow_margin: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MasterPhase {
    /// Nothing buffered, nothing executing
    Idle,
    /// Segments waiting in the master buffer
    Buffering,
    /// Pushing segments to the slaves
    Filling,
    /// The sync unit is draining its FIFO
    Executing,
}

/// Targets of one slave within a segment.
#[derive(Debug, Clone)]
struct ControllerTargets {
    slave: usize,
    devices: Vec<DeviceName>,
    targets: Vec<MoveTarget>,
}

#[derive(Debug, Clone)]
struct MovementSegment {
    targets: Vec<ControllerTargets>,
    execution: ExecutionInformation,
}

type Waiter = oneshot::Sender<MotionResult<()>>;

/// Completion signals of the current execution cycle. Replaced, never reused,
/// once resolved.
#[derive(Default)]
struct CycleSignals {
    completed: Vec<Waiter>,
    last_item_taken: Vec<Waiter>,
}

impl CycleSignals {
    fn resolve_last_item_taken(&mut self) {
        for waiter in self.last_item_taken.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn resolve_all(&mut self) {
        let cycle = std::mem::take(self);
        for waiter in cycle.completed.into_iter().chain(cycle.last_item_taken) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn abort_all(&mut self, reason: &str) {
        let cycle = std::mem::take(self);
        for waiter in cycle.completed.into_iter().chain(cycle.last_item_taken) {
            let _ = waiter.send(Err(MotionError::Aborted(reason.to_string())));
        }
    }
}

struct MasterState {
    phase: MasterPhase,
    buffer: VecDeque<MovementSegment>,
    /// Next pushed segment carries the launch flag
    launch_pending: bool,
    executing: bool,
    /// Records pushed to the sync unit and not yet taken
    outstanding: usize,
    cycle: CycleSignals,
    last_settings: HashMap<DeviceName, MoveSettings>,
    settings_generation: u64,
    settings_waiting: bool,
}

impl MasterState {
    fn drained(&self) -> bool {
        self.buffer.is_empty() && self.outstanding == 0 && !self.executing
    }

    fn settle_phase(&mut self) {
        self.phase = if self.executing {
            MasterPhase::Executing
        } else if self.buffer.is_empty() {
            MasterPhase::Idle
        } else {
            MasterPhase::Buffering
        };
    }
}

struct MasterCore {
    name: String,
    devices: Vec<DeviceId>,
    slaves: Vec<ControllerHandle>,
    sync_unit: usize,
    shutter: Option<usize>,
    routes: HashMap<DeviceName, usize>,
    arena: Arc<DeviceArena>,
    settings: MasterSettings,
    diagnostics: DiagnosticLog,
    lock: ControllerLock,
    state: Mutex<MasterState>,
}

/// Coordinates positioner, shutter and sync-unit slaves so buffered segments
/// run back to back on hardware sync pulses.
#[derive(Clone)]
pub struct MasterController {
    core: Arc<MasterCore>,
}

impl MasterController {
    pub fn new(
        name: &str,
        slaves: Vec<ControllerHandle>,
        arena: Arc<DeviceArena>,
        settings: MasterSettings,
        diagnostics: DiagnosticLog,
    ) -> MotionResult<Self> {
        let sync_units: Vec<usize> = slaves
            .iter()
            .enumerate()
            .filter(|(_, s)| s.kind() == ControllerKind::Sync)
            .map(|(i, _)| i)
            .collect();
        let &[sync_unit] = sync_units.as_slice() else {
            return Err(MotionError::invalid(format!(
                "master '{}' needs exactly one sync unit, got {}",
                name,
                sync_units.len()
            )));
        };
        let shutter = slaves.iter().position(|s| s.kind() == ControllerKind::Shutter);

        let mut routes = HashMap::new();
        let mut devices = Vec::new();
        for (index, slave) in slaves.iter().enumerate() {
            if slave.kind() == ControllerKind::Master {
                return Err(MotionError::invalid(format!("master '{}' cannot drive another master", name)));
            }
            for id in slave.devices() {
                routes.insert(arena.name_of(*id)?, index);
                devices.push(*id);
            }
        }

        Ok(Self {
            core: Arc::new(MasterCore {
                name: name.to_string(),
                devices,
                slaves,
                sync_unit,
                shutter,
                routes,
                arena,
                settings,
                diagnostics,
                lock: new_controller_lock(),
                state: Mutex::new(MasterState {
                    phase: MasterPhase::Idle,
                    buffer: VecDeque::new(),
                    launch_pending: true,
                    executing: false,
                    outstanding: 0,
                    cycle: CycleSignals::default(),
                    last_settings: HashMap::new(),
                    settings_generation: 0,
                    settings_waiting: false,
                }),
            }),
        })
    }

    /// The lock the dispatcher must use for this controller.
    pub fn lock(&self) -> ControllerLock {
        self.core.lock.clone()
    }

    /// Start the event loop fed by the sync unit's output channel.
    pub fn start(
        &self,
        events: broadcast::Receiver<ControllerEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_events(self.core.clone(), events, shutdown))
    }

    pub async fn phase(&self) -> MasterPhase {
        self.core.state.lock().await.phase
    }

    /// Segments still held in the master buffer.
    pub async fn buffered(&self) -> usize {
        self.core.state.lock().await.buffer.len()
    }

    /// Segments pushed to the sync unit and not yet taken.
    pub async fn outstanding(&self) -> usize {
        self.core.state.lock().await.outstanding
    }

    pub async fn launch_pending(&self) -> bool {
        self.core.state.lock().await.launch_pending
    }
}

async fn run_events(
    core: Arc<MasterCore>,
    mut events: broadcast::Receiver<ControllerEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Master event loop shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => core.on_event(event).await,
                Err(RecvError::Lagged(missed)) => {
                    core.diagnostics.warn(SOURCE, format!("missed {} sync unit event(s)", missed));
                    core.on_event(ControllerEvent::BufferHasFreeSpace).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

impl MasterCore {
    fn slave(&self, index: usize) -> &ControllerHandle {
        &self.slaves[index]
    }

    fn route(&self, device: DeviceName) -> MotionResult<usize> {
        self.routes
            .get(&device)
            .copied()
            .ok_or_else(|| MotionError::unavailable(format!("device '{}' is not driven by '{}'", device, self.name)))
    }

    async fn on_event(self: &Arc<Self>, event: ControllerEvent) {
        let _guard = self.lock.lock().await;
        let mut state = self.state.lock().await;
        let result = match event {
            ControllerEvent::BufferHasFreeSpace => {
                state.outstanding = state.outstanding.saturating_sub(1);
                if state.buffer.is_empty() && state.outstanding == 0 {
                    state.cycle.resolve_last_item_taken();
                }
                self.fill_and_start(&mut state).await
            }
            ControllerEvent::LastBufferItemTaken => {
                if state.buffer.is_empty() {
                    state.cycle.resolve_last_item_taken();
                    Ok(())
                } else {
                    self.fill_and_start(&mut state).await
                }
            }
            ControllerEvent::ExecutionCompleted => {
                state.executing = false;
                state.launch_pending = true;
                if state.buffer.is_empty() && state.outstanding == 0 {
                    tracing::debug!("{}: execution cycle completed", self.name);
                    state.cycle.resolve_all();
                    state.settle_phase();
                    Ok(())
                } else {
                    self.diagnostics.warn(
                        SOURCE,
                        format!(
                            "buffer underrun: {} buffered and {} pushed segment(s) left, relaunching",
                            state.buffer.len(),
                            state.outstanding
                        ),
                    );
                    self.fill_and_start(&mut state).await
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            self.diagnostics.error(SOURCE, format!("handling {:?} failed: {}", event, e));
        }
    }

    /// Filling pass followed by a start if the sync unit is idle with work queued.
    async fn fill_and_start(&self, state: &mut MasterState) -> MotionResult<()> {
        let filled = self.fill(state).await;
        let started = if filled.is_ok() && !state.executing && state.outstanding > 0 {
            let sync = self.slave(self.sync_unit);
            match sync.execute(&Command::start_queue_execution(sync.name())?).await {
                Ok(_) => {
                    state.executing = true;
                    tracing::debug!("{}: started queue execution", self.name);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        state.settle_phase();
        filled.and(started)
    }

    async fn fill(&self, state: &mut MasterState) -> MotionResult<usize> {
        if state.buffer.is_empty() {
            return Ok(0);
        }
        state.phase = MasterPhase::Filling;

        let mut min_free = usize::MAX;
        for slave in self.slaves.iter().filter(|s| s.is_bufferable()) {
            let completion = slave.execute(&Command::get_buffer_count(slave.name())?).await?;
            if let CommandOutcome::BufferFree(free) = completion.outcome {
                min_free = min_free.min(free);
            }
        }
        if min_free == usize::MAX {
            return Err(MotionError::invalid(format!("master '{}' has no bufferable slave", self.name)));
        }

        let count = fill_count(min_free, self.settings.buffer_safety_margin, state.buffer.len());
        for _ in 0..count {
            let Some(segment) = state.buffer.pop_front() else { break };
            self.push_segment(state, segment).await?;
        }
        tracing::debug!(
            "{}: pushed {} segment(s), min free {}, {} still buffered",
            self.name,
            count,
            min_free,
            state.buffer.len()
        );
        Ok(count)
    }

    async fn push_segment(&self, state: &mut MasterState, mut segment: MovementSegment) -> MotionResult<()> {
        segment.execution.launch = state.launch_pending;
        state.launch_pending = false;
        for targets in &segment.targets {
            let slave = self.slave(targets.slave);
            let command = Command::add_sync_in_action(slave.name(), targets.devices.clone(), targets.targets.clone())?;
            slave.execute(&command).await?;
        }
        let sync = self.slave(self.sync_unit);
        sync.execute(&Command::add_buffer_item(sync.name(), segment.execution)?)
            .await?;
        state.outstanding += 1;
        Ok(())
    }

    fn buffer_move(&self, state: &mut MasterState, command: &Command, targets: &[MoveTarget], shutter: ShutterTiming) -> MotionResult<()> {
        let mut grouped: Vec<ControllerTargets> = Vec::new();
        for (device, target) in command.devices.iter().zip(targets) {
            let slave = self.route(*device)?;
            if self.slave(slave).kind() != ControllerKind::Positioner {
                return Err(MotionError::invalid(format!("device '{}' cannot be moved", device)));
            }
            match grouped.iter_mut().find(|g| g.slave == slave) {
                Some(group) => {
                    group.devices.push(*device);
                    group.targets.push(*target);
                }
                None => grouped.push(ControllerTargets {
                    slave,
                    devices: vec![*device],
                    targets: vec![*target],
                }),
            }
        }
        let longest = targets.iter().map(|t| t.allocated_time).fold(0.0, f64::max);
        state.buffer.push_back(MovementSegment {
            targets: grouped,
            execution: ExecutionInformation {
                devices: command.devices.clone(),
                launch: false,
                rethrow_timeout: Duration::from_secs_f64(longest) + self.settings.rethrow_margin,
                shutter,
            },
        });
        if !state.executing {
            state.phase = MasterPhase::Buffering;
        }
        tracing::trace!("{}: buffered segment for {:?}", self.name, command.devices);
        Ok(())
    }

    async fn await_queued_items(&self, state: &mut MasterState, target: AwaitTarget) -> MotionResult<Completion> {
        self.fill_and_start(state).await?;
        if state.drained() {
            return Ok(Completion::done());
        }
        let (tx, rx) = oneshot::channel();
        match target {
            AwaitTarget::Completed => state.cycle.completed.push(tx),
            AwaitTarget::LastItemTaken => {
                if state.buffer.is_empty() && state.outstanding == 0 {
                    return Ok(Completion::done());
                }
                state.cycle.last_item_taken.push(tx);
            }
        }
        Ok(Completion::pending(rx))
    }

    fn changed_settings(&self, state: &MasterState, command: &Command, settings: &[MoveSettings]) -> MotionResult<Vec<(DeviceName, MoveSettings)>> {
        let mut changed = Vec::new();
        for (device, s) in command.devices.iter().zip(settings) {
            let pending = self.arena.positioner(*device)?.settings_update_pending;
            let differs = state
                .last_settings
                .get(device)
                .is_none_or(|previous| previous.differs_from(s, 1e-9));
            if pending || differs {
                changed.push((*device, *s));
            }
        }
        Ok(changed)
    }

    async fn forward_settings(&self, state: &mut MasterState, changed: &[(DeviceName, MoveSettings)]) -> MotionResult<()> {
        let mut per_slave: Vec<(usize, Vec<DeviceName>, Vec<MoveSettings>)> = Vec::new();
        for (device, s) in changed {
            let slave = self.route(*device)?;
            match per_slave.iter_mut().find(|(i, _, _)| *i == slave) {
                Some((_, devices, settings)) => {
                    devices.push(*device);
                    settings.push(*s);
                }
                None => per_slave.push((slave, vec![*device], vec![*s])),
            }
        }
        for (slave, devices, settings) in per_slave {
            let handle = self.slave(slave);
            handle
                .execute(&Command::update_move_settings(handle.name(), devices, settings)?)
                .await?;
        }
        for (device, s) in changed {
            state.last_settings.insert(*device, *s);
        }
        Ok(())
    }

    async fn update_move_settings(
        self: &Arc<Self>,
        state: &mut MasterState,
        command: &Command,
        settings: &[MoveSettings],
    ) -> MotionResult<Completion> {
        let changed = self.changed_settings(state, command, settings)?;
        if changed.is_empty() {
            return Ok(Completion::done());
        }
        if state.drained() {
            self.forward_settings(state, &changed).await?;
            return Ok(Completion::done());
        }

        // Hardware buffers cannot be repointed mid-run: wait for the drain.
        if state.settings_waiting {
            self.diagnostics
                .warn(SOURCE, "settings update arrived while another was pending; the newer one wins");
        }
        state.settings_generation += 1;
        state.settings_waiting = true;
        let generation = state.settings_generation;

        let (drain_tx, drain_rx) = oneshot::channel();
        state.cycle.completed.push(drain_tx);
        self.fill_and_start(state).await?;

        let (tx, rx) = oneshot::channel();
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _ = drain_rx.await;
            let _guard = core.lock.lock().await;
            let mut state = core.state.lock().await;
            if state.settings_generation != generation {
                core.diagnostics.info(SOURCE, "superseded settings update dropped");
                let _ = tx.send(Ok(()));
                return;
            }
            state.settings_waiting = false;
            let result = core.forward_settings(&mut state, &changed).await;
            let _ = tx.send(result);
        });
        Ok(Completion::pending(rx))
    }

    async fn stop(&self, state: &mut MasterState) -> MotionResult<Completion> {
        let dropped = state.buffer.len();
        state.buffer.clear();
        state.launch_pending = true;
        state.executing = false;
        state.outstanding = 0;
        state.settings_generation += 1;
        state.settings_waiting = false;
        state.phase = MasterPhase::Idle;

        // Sync unit first so no further pulses fire while the axes stop
        let mut order = vec![self.sync_unit];
        order.extend((0..self.slaves.len()).filter(|i| *i != self.sync_unit && Some(*i) != self.shutter));
        order.extend(self.shutter);
        for index in order {
            let slave = self.slave(index);
            let result = match Command::stop(slave.name(), Vec::new()) {
                Ok(command) => slave.execute(&command).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.diagnostics.error(SOURCE, format!("stop on '{}' failed: {}", slave.name(), e));
            }
        }
        state.cycle.abort_all("master stopped");
        self.diagnostics
            .info(SOURCE, format!("stopped, {} buffered segment(s) dropped", dropped));
        Ok(Completion::done())
    }

    async fn forward(&self, slave: usize, command: Command) -> MotionResult<Completion> {
        self.slave(slave).execute(&command).await
    }

    async fn execute(self: &Arc<Self>, command: &Command) -> MotionResult<Completion> {
        let mut state = self.state.lock().await;
        match (&command.action, &command.parameters) {
            (CommandAction::MoveAbsolute, CommandParameters::MoveAbsolute { targets, shutter }) => {
                self.buffer_move(&mut state, command, targets, *shutter)?;
                Ok(Completion::done())
            }
            (CommandAction::AwaitQueuedItems, CommandParameters::AwaitQueuedItems(target)) => {
                self.await_queued_items(&mut state, *target).await
            }
            (CommandAction::UpdateMoveSettings, CommandParameters::MoveSettings(settings)) => {
                self.update_move_settings(&mut state, command, settings).await
            }
            (CommandAction::Stop, _) => self.stop(&mut state).await,
            (CommandAction::ChangeShutterState, CommandParameters::ShutterState { open }) => {
                let shutter = self
                    .shutter
                    .ok_or_else(|| MotionError::unavailable(format!("master '{}' has no shutter", self.name)))?;
                let name = self.slave(shutter).name().to_string();
                self.forward(shutter, Command::change_shutter_state(&name, command.devices.clone(), *open)?)
                    .await
            }
            (CommandAction::UpdateState, _) => {
                for (index, slave) in self.slaves.iter().enumerate() {
                    if slave.kind() == ControllerKind::Positioner {
                        self.forward(index, Command::update_state(slave.name(), Vec::new())?).await?;
                    }
                }
                Ok(Completion::done())
            }
            (CommandAction::UpdateDeviceProperty, CommandParameters::DeviceProperty { property, value }) => {
                let device = command
                    .devices
                    .first()
                    .copied()
                    .ok_or_else(|| MotionError::invalid("UpdateDeviceProperty without a device"))?;
                let slave = self.route(device)?;
                let name = self.slave(slave).name().to_string();
                self.forward(slave, Command::update_device_property(&name, device, property, value.clone())?)
                    .await
            }
            (action, _) => Err(MotionError::invalid(format!(
                "master '{}' does not accept {:?}",
                self.name, action
            ))),
        }
    }
}

#[async_trait]
impl Executable for MasterController {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Master
    }

    fn devices(&self) -> &[DeviceId] {
        &self.core.devices
    }

    async fn execute(&self, command: &Command) -> MotionResult<Completion> {
        self.core.execute(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_count_respects_margin_and_buffer() {
        assert_eq!(fill_count(16, 2, 5), 5);
        assert_eq!(fill_count(4, 2, 5), 2);
        assert_eq!(fill_count(2, 2, 5), 0);
        assert_eq!(fill_count(1, 2, 5), 0);
        assert_eq!(fill_count(10, 0, 0), 0);
    }

    #[test]
    fn cycle_signals_resolve_once() {
        let mut cycle = CycleSignals::default();
        let (tx, mut rx) = oneshot::channel();
        cycle.completed.push(tx);
        cycle.resolve_all();
        assert!(cycle.completed.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn stopped_cycle_reports_aborted() {
        let mut cycle = CycleSignals::default();
        let (done_tx, mut done_rx) = oneshot::channel();
        let (taken_tx, mut taken_rx) = oneshot::channel();
        cycle.completed.push(done_tx);
        cycle.last_item_taken.push(taken_tx);
        cycle.abort_all("master stopped");
        assert!(cycle.completed.is_empty() && cycle.last_item_taken.is_empty());
        assert!(matches!(done_rx.try_recv().unwrap(), Err(MotionError::Aborted(_))));
        assert!(matches!(taken_rx.try_recv().unwrap(), Err(MotionError::Aborted(_))));
    }
}
