// src/controller/positioner.rs - Simulated buffered positioner controller
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

use crate::command::{Command, CommandAction, CommandParameters, Completion, MoveTarget};
use crate::config::SimulationConfig;
use crate::controller::{Bufferable, ControllerEvent, ControllerKind, Executable, SyncCapable, SyncPulse, SyncSignal};
use crate::device::{DeviceArena, DeviceId, MoveSettings};
use crate::error::{MotionError, MotionResult};
use crate::planner::blend::BlendedPath;
use crate::planner::profile::{KinematicState, PositionerMovementInformation};

/// How a simulated axis gets to its target.
enum AxisProfile {
    /// Rest to rest
    Trapezoid(PositionerMovementInformation),
    /// Through lead phases or prescribed joint velocities
    Blended(BlendedPath),
}

impl AxisProfile {
    fn total_time(&self) -> f64 {
        match self {
            Self::Trapezoid(profile) => profile.total_time(),
            Self::Blended(path) => path.total_time(),
        }
    }

    fn end_position(&self) -> f64 {
        match self {
            Self::Trapezoid(profile) => profile.target.position,
            Self::Blended(path) => path.end_position(),
        }
    }

    /// Position and signed speed `t` seconds into the move.
    fn state_at(&self, t: f64) -> (f64, f64) {
        match self {
            Self::Trapezoid(profile) => (profile.position_at(t), profile.target.direction * profile.speed_at(t)),
            Self::Blended(path) => (path.position_at(t), path.velocity_at(t)),
        }
    }
}

/// Move in progress on one simulated axis.
struct ActiveMotion {
    seq: u64,
    profile: AxisProfile,
    started: Instant,
    time_scale: f64,
    /// Started by a sync-in pulse rather than a direct move
    buffered: bool,
    task: JoinHandle<()>,
    waiter: Option<oneshot::Sender<MotionResult<()>>>,
}

impl ActiveMotion {
    /// Position and signed speed right now.
    fn sample(&self) -> (f64, f64) {
        let t = self.started.elapsed().as_secs_f64() / self.time_scale;
        self.profile.state_at(t)
    }
}

#[derive(Default)]
struct AxisState {
    /// Sync-in action buffer
    queue: VecDeque<MoveTarget>,
    motion: Option<ActiveMotion>,
    /// Triggers received while the axis was still moving
    pending_triggers: usize,
    next_seq: u64,
}

#[derive(Default)]
struct Faults {
    fault: Option<String>,
    update_delay: Duration,
}

struct PositionerInner {
    name: String,
    arena: Arc<DeviceArena>,
    simulation: SimulationConfig,
    capacity: usize,
    axes: Mutex<HashMap<DeviceId, AxisState>>,
    events: broadcast::Sender<ControllerEvent>,
    faults: std::sync::Mutex<Faults>,
}

/// Simulated positioner with a per-device sync-in buffer.
///
/// Each sync-in trigger starts the next buffered move; the move runs for its
/// allocated time and, for axes with native sync-out, pulses sync-out when it
/// finishes.
pub struct SimulatedPositioner {
    devices: Vec<DeviceId>,
    sync_in: mpsc::UnboundedSender<SyncPulse>,
    inner: Arc<PositionerInner>,
}

impl SimulatedPositioner {
    pub fn new(
        name: &str,
        devices: Vec<DeviceId>,
        arena: Arc<DeviceArena>,
        capacity: usize,
        simulation: SimulationConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (sync_in, pulses) = mpsc::unbounded_channel();
        let inner = Arc::new(PositionerInner {
            name: name.to_string(),
            arena,
            simulation,
            capacity,
            axes: Mutex::new(devices.iter().map(|id| (*id, AxisState::default())).collect()),
            events,
            faults: std::sync::Mutex::new(Faults::default()),
        });
        tokio::spawn(sync_in_listener(Arc::downgrade(&inner), pulses));
        Arc::new(Self {
            devices,
            sync_in,
            inner,
        })
    }

    /// Make every subsequent command fail with a hardware fault (`None` clears it).
    pub fn inject_fault(&self, message: Option<&str>) {
        self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner).fault = message.map(str::to_string);
    }

    /// Delay applied to every `UpdateState`, to simulate a stuck link.
    pub fn set_update_delay(&self, delay: Duration) {
        self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner).update_delay = delay;
    }

    /// Number of sync-in actions buffered for `device`.
    pub async fn queued(&self, device: DeviceId) -> usize {
        self.inner.axes.lock().await.get(&device).map_or(0, |a| a.queue.len())
    }

    pub async fn is_moving(&self, device: DeviceId) -> bool {
        self.inner
            .axes
            .lock()
            .await
            .get(&device)
            .is_some_and(|a| a.motion.is_some())
    }

    fn resolve(&self, command: &Command) -> MotionResult<Vec<DeviceId>> {
        let ids = if command.devices.is_empty() {
            self.devices.clone()
        } else {
            self.inner.arena.ids_of(&command.devices)?
        };
        for id in &ids {
            if !self.devices.contains(id) {
                let name = self.inner.arena.name_of(*id)?;
                return Err(MotionError::unavailable(format!(
                    "device '{}' is not owned by '{}'",
                    name, self.inner.name
                )));
            }
        }
        Ok(ids)
    }

    async fn move_absolute(&self, ids: &[DeviceId], targets: &[MoveTarget]) -> MotionResult<Completion> {
        let mut receivers = Vec::with_capacity(ids.len());
        {
            let mut axes = self.inner.axes.lock().await;
            for (id, target) in ids.iter().zip(targets) {
                let axis = self.inner.axis(&mut axes, *id)?;
                if let Some(motion) = axis.motion.take() {
                    tracing::debug!("{}: direct move replaces motion in progress", self.inner.name);
                    self.inner.halt(*id, motion, "replaced by a direct move");
                }
                let (tx, rx) = oneshot::channel();
                self.inner.begin_motion(*id, axis, *target, false, Some(tx))?;
                receivers.push(rx);
            }
        }
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut result = Ok(());
            for outcome in join_all(receivers).await {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => result = Err(e),
                    Err(_) => result = Err(MotionError::Aborted("axis motion dropped".to_string())),
                }
            }
            let _ = done_tx.send(result);
        });
        Ok(Completion::pending(done_rx))
    }

    async fn add_sync_in_actions(&self, ids: &[DeviceId], actions: &[MoveTarget]) -> MotionResult<Completion> {
        let mut axes = self.inner.axes.lock().await;
        for id in ids {
            let queued = axes.get(id).map_or(0, |a| a.queue.len());
            if queued >= self.inner.capacity {
                return Err(MotionError::hardware(
                    &self.inner.name,
                    format!("sync-in buffer overflow on device {}", id.0),
                ));
            }
        }
        for (id, action) in ids.iter().zip(actions) {
            self.inner.axis(&mut axes, *id)?.queue.push_back(*action);
        }
        Ok(Completion::done())
    }

    fn update_move_settings(&self, ids: &[DeviceId], settings: &[MoveSettings]) -> MotionResult<Completion> {
        for (id, s) in ids.iter().zip(settings) {
            let positioner = self.inner.arena.with(*id, |d| d.as_positioner().cloned())?;
            let Some(positioner) = positioner else {
                return Err(MotionError::invalid(format!("device {} is not a positioner", id.0)));
            };
            let limits = &positioner.limits;
            if s.acceleration > limits.max_acceleration * (1.0 + 1e-6)
                || s.deceleration > limits.max_deceleration * (1.0 + 1e-6)
                || s.speed > limits.max_speed * (1.0 + 1e-6)
            {
                return Err(MotionError::invalid(format!(
                    "settings {:?} exceed the limits of device {}",
                    s, id.0
                )));
            }
        }
        for (id, s) in ids.iter().zip(settings) {
            self.inner.arena.update(*id, |d| {
                if let Some(p) = d.as_positioner_mut() {
                    p.settings = *s;
                    p.settings_update_pending = false;
                }
            })?;
        }
        Ok(Completion::done())
    }

    async fn update_state(&self, ids: &[DeviceId]) -> MotionResult<Completion> {
        let delay = self.inner.faults.lock().unwrap_or_else(PoisonError::into_inner).update_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let axes = self.inner.axes.lock().await;
        for id in ids {
            let sample = axes.get(id).and_then(|a| a.motion.as_ref()).map(ActiveMotion::sample);
            self.inner.arena.update(*id, |d| {
                if let Some(p) = d.as_positioner_mut() {
                    match sample {
                        Some((position, speed)) => {
                            p.position = position;
                            p.speed = speed;
                        }
                        None => p.speed = 0.0,
                    }
                }
            })?;
        }
        Ok(Completion::done())
    }

    async fn stop(&self, ids: &[DeviceId]) -> MotionResult<Completion> {
        let mut axes = self.inner.axes.lock().await;
        for id in ids {
            let axis = self.inner.axis(&mut axes, *id)?;
            axis.queue.clear();
            axis.pending_triggers = 0;
            if let Some(motion) = axis.motion.take() {
                self.inner.halt(*id, motion, "stopped");
            }
        }
        tracing::info!("{}: stopped {} device(s)", self.inner.name, ids.len());
        Ok(Completion::done())
    }
}

impl PositionerInner {
    fn axis<'a>(&self, axes: &'a mut HashMap<DeviceId, AxisState>, id: DeviceId) -> MotionResult<&'a mut AxisState> {
        axes.get_mut(&id)
            .ok_or_else(|| MotionError::unavailable(format!("device {} is not owned by '{}'", id.0, self.name)))
    }

    /// Start a move on `axis`, timed by the target's allocated time.
    ///
    /// Targets with lead phases play lead-in, nominal span and lead-out as
    /// separate phases, so the nominal span keeps its constant speed. Targets
    /// with joint velocities leave and arrive at those velocities. Anything
    /// else is a rest-to-rest profile.
    fn begin_motion(
        self: &Arc<Self>,
        id: DeviceId,
        axis: &mut AxisState,
        target: MoveTarget,
        buffered: bool,
        waiter: Option<oneshot::Sender<MotionResult<()>>>,
    ) -> MotionResult<()> {
        let positioner = self
            .arena
            .with(id, |d| d.as_positioner().cloned())?
            .ok_or_else(|| MotionError::invalid(format!("device {} is not a positioner", id.0)))?;
        let from = positioner.position;
        let settings = positioner.settings;
        let profile = match BlendedPath::for_target(from, &target) {
            Some(path) => AxisProfile::Blended(path),
            None if target.allocated_time > 0.0 => AxisProfile::Trapezoid(PositionerMovementInformation::fitted(
                from,
                target.position,
                target.allocated_time,
                settings.acceleration,
                settings.deceleration,
            )?),
            None => AxisProfile::Trapezoid(PositionerMovementInformation::new(
                &positioner.limits,
                KinematicState::at_rest(from),
                target.position,
                settings.speed,
                settings.acceleration,
                settings.deceleration,
            )?),
        };

        let seq = axis.next_seq;
        axis.next_seq += 1;
        let duration = self.simulation.scaled(profile.total_time());
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            sleep(duration).await;
            inner.finish(id, seq).await;
        });
        tracing::trace!(
            "{}: device {} moving {:.4} -> {:.4} in {:?}",
            self.name,
            id.0,
            from,
            target.position,
            duration
        );
        axis.motion = Some(ActiveMotion {
            seq,
            profile,
            started: Instant::now(),
            time_scale: self.simulation.time_scale,
            buffered,
            task,
            waiter,
        });
        Ok(())
    }

    /// Abort a move, leaving the axis wherever it got to. Whoever waits on
    /// the move sees `Aborted`, never success.
    fn halt(&self, id: DeviceId, mut motion: ActiveMotion, reason: &str) {
        motion.task.abort();
        let (position, _) = motion.sample();
        let _ = self.arena.update(id, |d| {
            if let Some(p) = d.as_positioner_mut() {
                p.position = position;
                p.speed = 0.0;
                p.acceleration = 0.0;
            }
        });
        if let Some(waiter) = motion.waiter.take() {
            let _ = waiter.send(Err(MotionError::Aborted(format!("{}: {}", self.name, reason))));
        }
    }

    async fn finish(self: Arc<Self>, id: DeviceId, seq: u64) {
        let mut axes = self.axes.lock().await;
        let Some(axis) = axes.get_mut(&id) else { return };
        if axis.motion.as_ref().map(|m| m.seq) != Some(seq) {
            return;
        }
        let Some(mut motion) = axis.motion.take() else { return };
        let target = motion.profile.end_position();
        let native_sync_out = self
            .arena
            .update(id, |d| {
                d.as_positioner_mut().map_or(false, |p| {
                    p.position = target;
                    p.speed = 0.0;
                    p.acceleration = 0.0;
                    p.native_sync_out
                })
            })
            .unwrap_or(false);
        if let Some(waiter) = motion.waiter.take() {
            let _ = waiter.send(Ok(()));
        }
        if motion.buffered && native_sync_out {
            let _ = self.events.send(ControllerEvent::SyncOut { device: id });
        }
        if axis.pending_triggers > 0 {
            axis.pending_triggers -= 1;
            self.start_next(id, axis);
        }
    }

    fn start_next(self: &Arc<Self>, id: DeviceId, axis: &mut AxisState) {
        let Some(action) = axis.queue.pop_front() else {
            tracing::warn!("{}: sync-in on device {} with an empty buffer", self.name, id.0);
            return;
        };
        if let Err(e) = self.begin_motion(id, axis, action, true, None) {
            tracing::error!("{}: buffered move on device {} failed: {}", self.name, id.0, e);
        }
    }

    async fn on_pulse(self: &Arc<Self>, pulse: SyncPulse) {
        if pulse.signal != SyncSignal::Trigger {
            tracing::trace!("{}: ignoring {:?}", self.name, pulse.signal);
            return;
        }
        let mut axes = self.axes.lock().await;
        let Some(axis) = axes.get_mut(&pulse.device) else {
            tracing::warn!("{}: sync-in for foreign device {}", self.name, pulse.device.0);
            return;
        };
        if axis.motion.is_some() {
            axis.pending_triggers += 1;
            return;
        }
        self.start_next(pulse.device, axis);
    }

    fn check_fault(&self) -> MotionResult<()> {
        match &self.faults.lock().unwrap_or_else(PoisonError::into_inner).fault {
            Some(message) => Err(MotionError::hardware(&self.name, message.clone())),
            None => Ok(()),
        }
    }
}

async fn sync_in_listener(inner: Weak<PositionerInner>, mut pulses: mpsc::UnboundedReceiver<SyncPulse>) {
    while let Some(pulse) = pulses.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.on_pulse(pulse).await;
    }
}

#[async_trait]
impl Executable for SimulatedPositioner {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Positioner
    }

    fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    async fn execute(&self, command: &Command) -> MotionResult<Completion> {
        self.inner.check_fault()?;
        let latency = self.inner.simulation.latency();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let ids = self.resolve(command)?;
        match (&command.action, &command.parameters) {
            (CommandAction::MoveAbsolute, CommandParameters::MoveAbsolute { targets, .. }) => {
                self.move_absolute(&ids, targets).await
            }
            (CommandAction::AddSyncInAction, CommandParameters::SyncInActions(actions)) => {
                self.add_sync_in_actions(&ids, actions).await
            }
            (CommandAction::UpdateMoveSettings, CommandParameters::MoveSettings(settings)) => {
                self.update_move_settings(&ids, settings)
            }
            (CommandAction::GetBufferCount, _) => Ok(Completion::buffer_free(self.free_slots().await)),
            (CommandAction::UpdateState, _) => self.update_state(&ids).await,
            (CommandAction::Stop, _) => self.stop(&ids).await,
            (CommandAction::UpdateDeviceProperty, CommandParameters::DeviceProperty { property, value }) => {
                for id in &ids {
                    self.inner.arena.update(*id, |d| d.apply_property(property, value))??;
                }
                Ok(Completion::done())
            }
            (action, _) => Err(MotionError::invalid(format!(
                "positioner '{}' does not support {:?}",
                self.inner.name, action
            ))),
        }
    }

    fn bufferable(&self) -> Option<&dyn Bufferable> {
        Some(self)
    }

    fn sync_capable(&self) -> Option<&dyn SyncCapable> {
        Some(self)
    }
}

#[async_trait]
impl Bufferable for SimulatedPositioner {
    fn buffer_capacity(&self) -> usize {
        self.inner.capacity
    }

    async fn free_slots(&self) -> usize {
        let axes = self.inner.axes.lock().await;
        let deepest = axes.values().map(|a| a.queue.len()).max().unwrap_or(0);
        self.inner.capacity.saturating_sub(deepest)
    }
}

impl SyncCapable for SimulatedPositioner {
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
    use crate::config::DeviceConfig;
    use crate::controller::ControllerKind;
    use crate::planner::lead::{self, LeadInfo};

    fn rig() -> (Arc<DeviceArena>, Arc<SimulatedPositioner>) {
        let arena = Arc::new(
            DeviceArena::new(vec![DeviceConfig::axis('x').build("stage", ControllerKind::Positioner)]).unwrap(),
        );
        let positioner = SimulatedPositioner::new("stage", vec![DeviceId(0)], arena.clone(), 4, SimulationConfig::default());
        (arena, positioner)
    }

    #[tokio::test(start_paused = true)]
    async fn direct_move_completes_after_allocated_time() {
        let (arena, positioner) = rig();
        let cmd = Command::move_absolute("stage", vec!['x'], vec![MoveTarget::new(5.0, 0.5)], Default::default())
            .unwrap();
        let started = Instant::now();
        let completion = positioner.execute(&cmd).await.unwrap();
        assert!(completion.is_pending());
        completion.wait().await.unwrap();
        assert!((started.elapsed().as_secs_f64() - 0.5).abs() < 0.01);
        assert_eq!(arena.positioner('x').unwrap().position, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_runs_buffered_action_and_pulses_sync_out() {
        let (arena, positioner) = rig();
        let mut events = positioner.subscribe();
        let cmd = Command::add_sync_in_action("stage", vec!['x'], vec![MoveTarget::new(2.0, 0.2)]).unwrap();
        positioner.execute(&cmd).await.unwrap();
        assert_eq!(positioner.free_slots().await, 3);

        positioner
            .sync_in()
            .send(SyncPulse { device: DeviceId(0), signal: SyncSignal::Trigger })
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, ControllerEvent::SyncOut { device: DeviceId(0) });
        assert_eq!(arena.positioner('x').unwrap().position, 2.0);
        assert_eq!(positioner.free_slots().await, 4);
    }

    #[tokio::test]
    async fn overflow_is_a_hardware_fault() {
        let (_arena, positioner) = rig();
        let cmd = Command::add_sync_in_action("stage", vec!['x'], vec![MoveTarget::new(1.0, 0.1)]).unwrap();
        for _ in 0..4 {
            positioner.execute(&cmd).await.unwrap();
        }
        let err = positioner.execute(&cmd).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_buffer_and_halts() {
        let (arena, positioner) = rig();
        let buffered = Command::add_sync_in_action("stage", vec!['x'], vec![MoveTarget::new(1.0, 0.1)]).unwrap();
        positioner.execute(&buffered).await.unwrap();
        let direct = Command::move_absolute("stage", vec!['x'], vec![MoveTarget::new(10.0, 1.0)], Default::default())
            .unwrap();
        let completion = positioner.execute(&direct).await.unwrap();
        sleep(Duration::from_millis(500)).await;
        positioner.execute(&Command::stop("stage", vec!['x']).unwrap()).await.unwrap();
        assert!(matches!(completion.wait().await, Err(MotionError::Aborted(_))));
        assert_eq!(positioner.queued(DeviceId(0)).await, 0);
        let position = arena.positioner('x').unwrap().position;
        assert!(position > 0.0 && position < 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn lead_phases_keep_the_nominal_speed_constant() {
        let (arena, positioner) = rig();
        let ramp = lead::ramp(20.0, 200.0, 0.0);
        let lead_in = lead::lead_in(1.0, 1.0, &ramp);
        let lead_out = lead::lead_out(11.0, 1.0, &ramp);
        let target = MoveTarget {
            position: lead_out.end_position,
            allocated_time: ramp.time + 0.5 + ramp.time,
            lead: Some(LeadInfo {
                lead_in: Some(lead_in),
                lead_out: Some(lead_out),
            }),
            velocity: None,
        };
        let cmd = Command::move_absolute("stage", vec!['x'], vec![target], Default::default()).unwrap();
        let completion = positioner.execute(&cmd).await.unwrap();
        let state = Command::update_state("stage", vec!['x']).unwrap();

        // Halfway through the nominal span
        sleep(Duration::from_millis(350)).await;
        positioner.execute(&state).await.unwrap();
        let x = arena.positioner('x').unwrap();
        assert!((x.speed - 20.0).abs() < 1e-6, "speed {}", x.speed);
        assert!((x.position - 6.0).abs() < 1e-6, "position {}", x.position);

        completion.wait().await.unwrap();
        assert_eq!(arena.positioner('x').unwrap().position, 12.0);
    }

    #[tokio::test(start_paused = true)]
    async fn joint_velocities_shape_the_move() {
        let (arena, positioner) = rig();
        let target = MoveTarget::new(5.0, 1.0).with_velocities(0.0, 10.0);
        let cmd = Command::move_absolute("stage", vec!['x'], vec![target], Default::default()).unwrap();
        let completion = positioner.execute(&cmd).await.unwrap();

        sleep(Duration::from_millis(500)).await;
        positioner
            .execute(&Command::update_state("stage", vec!['x']).unwrap())
            .await
            .unwrap();
        let x = arena.positioner('x').unwrap();
        assert!((x.speed - 5.0).abs() < 1e-6, "speed {}", x.speed);
        assert!((x.position - 1.25).abs() < 1e-6, "position {}", x.position);
        completion.wait().await.unwrap();
        assert_eq!(arena.positioner('x').unwrap().position, 5.0);
    }

    #[tokio::test]
    async fn injected_fault_fails_commands() {
        let (_arena, positioner) = rig();
        positioner.inject_fault(Some("encoder lost"));
        let err = positioner
            .execute(&Command::update_state("stage", vec![]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MotionError::HardwareFault { .. }));
    }
}
