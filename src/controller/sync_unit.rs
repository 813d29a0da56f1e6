// src/controller/sync_unit.rs - Simulated sync unit: execution FIFO and pulse chaining
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::command::{Command, CommandAction, CommandParameters, Completion, ExecutionInformation};
use crate::config::SimulationConfig;
use crate::controller::{Bufferable, ControllerEvent, ControllerKind, Executable, SyncCapable, SyncPulse, SyncSignal};
use crate::device::{DeviceArena, DeviceId, DeviceName};
use crate::error::{MotionError, MotionResult};

/// Pulse lines the sync unit is wired to.
#[derive(Default)]
pub struct SyncWiring {
    /// Sync-in line of the controller owning each device
    pub inputs: HashMap<DeviceId, mpsc::UnboundedSender<SyncPulse>>,
    /// Shutter device and its sync-in line
    pub shutter: Option<(DeviceId, mpsc::UnboundedSender<SyncPulse>)>,
    /// Event streams carrying sync-out pulses
    pub outputs: Vec<broadcast::Receiver<ControllerEvent>>,
}

/// Fired records kept for inspection; older ones are dropped.
pub const HISTORY_LIMIT: usize = 1024;

/// A record the unit has fired, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredRecord {
    pub seq: u64,
    pub devices: Vec<DeviceName>,
    pub launch: bool,
    /// Fired by the completion of the previous record rather than by a start
    pub chained: bool,
    pub at: Instant,
}

struct QueuedRecord {
    seq: u64,
    devices: Vec<DeviceId>,
    info: ExecutionInformation,
}

struct ActiveRecord {
    seq: u64,
    pending: HashSet<DeviceId>,
}

#[derive(Default)]
struct SyncState {
    queue: VecDeque<QueuedRecord>,
    running: bool,
    active: Option<ActiveRecord>,
    next_seq: u64,
    history: VecDeque<FiredRecord>,
    rethrow: Option<JoinHandle<()>>,
    shutter_tasks: Vec<JoinHandle<()>>,
}

struct SyncInner {
    name: String,
    capacity: usize,
    simulation: SimulationConfig,
    arena: Arc<DeviceArena>,
    inputs: HashMap<DeviceId, mpsc::UnboundedSender<SyncPulse>>,
    shutter: Option<(DeviceId, mpsc::UnboundedSender<SyncPulse>)>,
    events: broadcast::Sender<ControllerEvent>,
    state: Mutex<SyncState>,
}

/// Simulated sync unit.
///
/// Holds a FIFO of execution records and drains it one record at a time: a
/// record fires sync-in to its devices, and the next record fires once every
/// device of the current one has reported sync-out or the rethrow timeout
/// elapsed.
pub struct SimulatedSyncUnit {
    sync_in: mpsc::UnboundedSender<SyncPulse>,
    inner: Arc<SyncInner>,
}

impl SimulatedSyncUnit {
    pub fn new(
        name: &str,
        capacity: usize,
        arena: Arc<DeviceArena>,
        wiring: SyncWiring,
        simulation: SimulationConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (sync_in, pulses) = mpsc::unbounded_channel();
        let inner = Arc::new(SyncInner {
            name: name.to_string(),
            capacity,
            simulation,
            arena,
            inputs: wiring.inputs,
            shutter: wiring.shutter,
            events,
            state: Mutex::new(SyncState::default()),
        });
        for output in wiring.outputs {
            tokio::spawn(sync_out_listener(Arc::downgrade(&inner), output));
        }
        tokio::spawn(external_pulse_listener(Arc::downgrade(&inner), pulses));
        Arc::new(Self { sync_in, inner })
    }

    /// The last [`HISTORY_LIMIT`] records fired, oldest first.
    pub async fn history(&self) -> Vec<FiredRecord> {
        self.inner.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }
}

impl SyncInner {
    fn emit(&self, event: ControllerEvent) {
        tracing::trace!("{}: {:?}", self.name, event);
        let _ = self.events.send(event);
    }

    async fn enqueue(&self, info: ExecutionInformation) -> MotionResult<()> {
        let devices = self.arena.ids_of(&info.devices)?;
        if let Some(missing) = devices.iter().find(|id| !self.inputs.contains_key(id)) {
            return Err(MotionError::unavailable(format!(
                "sync unit '{}' has no sync-in line to device {}",
                self.name, missing.0
            )));
        }
        if info.shutter.uses_shutter() && self.shutter.is_none() {
            tracing::warn!("{}: record uses the shutter but none is wired", self.name);
        }
        let mut state = self.state.lock().await;
        if state.queue.len() >= self.capacity {
            return Err(MotionError::hardware(&self.name, "execution buffer overflow"));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(QueuedRecord { seq, devices, info });
        Ok(())
    }

    async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.running && state.active.is_some() {
            return;
        }
        state.running = true;
        if state.active.is_none() {
            self.fire_next(&mut state, false);
        }
    }

    /// Fire the oldest queued record, or finish the run if none is left.
    fn fire_next(self: &Arc<Self>, state: &mut SyncState, chained: bool) {
        if let Some(task) = state.rethrow.take() {
            task.abort();
        }
        state.active = None;
        state.shutter_tasks.retain(|t| !t.is_finished());

        let Some(record) = state.queue.pop_front() else {
            if state.running {
                state.running = false;
                tracing::debug!("{}: execution completed", self.name);
                self.emit(ControllerEvent::ExecutionCompleted);
            }
            return;
        };

        if !chained && !record.info.launch {
            tracing::warn!(
                "{}: buffer underrun, record {} started without a launch flag",
                self.name,
                record.seq
            );
        }

        for device in &record.devices {
            if let Some(input) = self.inputs.get(device) {
                let _ = input.send(SyncPulse {
                    device: *device,
                    signal: SyncSignal::Trigger,
                });
            }
        }

        if let Some((shutter, input)) = &self.shutter {
            let timing = record.info.shutter;
            for (delay, signal) in [
                (timing.delay_on_ms, SyncSignal::ShutterOpen),
                (timing.delay_off_ms, SyncSignal::ShutterClose),
            ] {
                let Some(delay) = delay else { continue };
                let input = input.clone();
                let device = *shutter;
                let wait = self.simulation.scaled(delay as f64 / 1000.0);
                state.shutter_tasks.push(tokio::spawn(async move {
                    sleep(wait).await;
                    let _ = input.send(SyncPulse { device, signal });
                }));
            }
        }

        let seq = record.seq;
        let weak = Arc::downgrade(self);
        let timeout = self.simulation.scaled(record.info.rethrow_timeout.as_secs_f64());
        state.rethrow = Some(tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_rethrow(seq).await;
            }
        }));

        remember(
            &mut state.history,
            FiredRecord {
                seq,
                devices: record.info.devices.clone(),
                launch: record.info.launch,
                chained,
                at: Instant::now(),
            },
        );
        state.active = Some(ActiveRecord {
            seq,
            pending: record.devices.iter().copied().collect(),
        });
        tracing::debug!("{}: fired record {} ({:?})", self.name, seq, record.info.devices);

        self.emit(ControllerEvent::BufferHasFreeSpace);
        if state.queue.is_empty() {
            self.emit(ControllerEvent::LastBufferItemTaken);
        }
    }

    async fn on_sync_out(self: &Arc<Self>, device: DeviceId) {
        let mut state = self.state.lock().await;
        let finished = match state.active.as_mut() {
            Some(active) => active.pending.remove(&device) && active.pending.is_empty(),
            None => false,
        };
        if finished {
            self.fire_next(&mut state, true);
        }
    }

    async fn on_rethrow(self: &Arc<Self>, seq: u64) {
        let mut state = self.state.lock().await;
        if state.active.as_ref().map(|a| a.seq) != Some(seq) {
            return;
        }
        tracing::debug!("{}: rethrow timeout advanced record {}", self.name, seq);
        self.fire_next(&mut state, true);
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        let dropped = state.queue.len();
        state.queue.clear();
        state.active = None;
        state.running = false;
        if let Some(task) = state.rethrow.take() {
            task.abort();
        }
        for task in state.shutter_tasks.drain(..) {
            task.abort();
        }
        if let Some((device, input)) = &self.shutter {
            let _ = input.send(SyncPulse {
                device: *device,
                signal: SyncSignal::ShutterClose,
            });
        }
        tracing::info!("{}: stopped, {} queued record(s) dropped", self.name, dropped);
    }
}

async fn sync_out_listener(inner: Weak<SyncInner>, mut events: broadcast::Receiver<ControllerEvent>) {
    loop {
        match events.recv().await {
            Ok(ControllerEvent::SyncOut { device }) => {
                let Some(inner) = inner.upgrade() else { break };
                inner.on_sync_out(device).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Sync unit missed {} sync-out event(s)", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// Pulses on the unit's own input count as sync-out observed on a device.
async fn external_pulse_listener(inner: Weak<SyncInner>, mut pulses: mpsc::UnboundedReceiver<SyncPulse>) {
    while let Some(pulse) = pulses.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        if pulse.signal == SyncSignal::Trigger {
            inner.on_sync_out(pulse.device).await;
        }
    }
}

#[async_trait]
impl Executable for SimulatedSyncUnit {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Sync
    }

    fn devices(&self) -> &[DeviceId] {
        &[]
    }

    async fn execute(&self, command: &Command) -> MotionResult<Completion> {
        let latency = self.inner.simulation.latency();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        match (&command.action, &command.parameters) {
            (CommandAction::AddSyncControllerBufferItem, CommandParameters::BufferItem(info)) => {
                self.inner.enqueue(info.clone()).await?;
            }
            (CommandAction::StartQueueExecution, _) => self.inner.start().await,
            (CommandAction::GetBufferCount, _) => return Ok(Completion::buffer_free(self.free_slots().await)),
            (CommandAction::Stop, _) => self.inner.stop().await,
            (CommandAction::UpdateState, _) => {}
            (action, _) => {
                return Err(MotionError::invalid(format!(
                    "sync unit '{}' does not support {:?}",
                    self.inner.name, action
                )));
            }
        }
        Ok(Completion::done())
    }

    fn bufferable(&self) -> Option<&dyn Bufferable> {
        Some(self)
    }

    fn sync_capable(&self) -> Option<&dyn SyncCapable> {
        Some(self)
    }
}

#[async_trait]
impl Bufferable for SimulatedSyncUnit {
    fn buffer_capacity(&self) -> usize {
        self.inner.capacity
    }

    async fn free_slots(&self) -> usize {
        let queued = self.inner.state.lock().await.queue.len();
        self.inner.capacity.saturating_sub(queued)
    }
}

impl SyncCapable for SimulatedSyncUnit {
    fn sync_in(&self) -> mpsc::UnboundedSender<SyncPulse> {
        self.sync_in.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }
}

fn remember(history: &mut VecDeque<FiredRecord>, fired: FiredRecord) {
    if history.len() >= HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(fired);
}
