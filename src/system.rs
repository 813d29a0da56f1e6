// src/system.rs - Composition root and the script-facing motion functions
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};

use crate::command::{Command, CommandLine};
use crate::config::{Config, ConfigError};
use crate::controller::sync_unit::SyncWiring;
use crate::controller::{
    ControllerHandle, ControllerKind, ControllerRegistry, Executable, MasterController, MasterSettings,
    SimulatedPositioner, SimulatedShutter, SimulatedSyncUnit, SyncCapable,
};
use crate::device::{Device, DeviceArena, DeviceName, parse_device_names};
use crate::diagnostics::DiagnosticLog;
use crate::dispatch::{CommandDispatcher, RefreshReport, spawn_state_refresh, update_states};
use crate::error::{MotionError, MotionResult};
use crate::planner::{ArcRequest, MotionPlan, MoveProperties, ResolvedWait, TrajectoryPlanner};

const SOURCE: &str = "system";

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),
}

/// What a motion call did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MotionReport {
    pub commands: usize,
    pub segments: usize,
    /// Planned seconds, pre-positioning excluded
    pub duration: f64,
    pub wait: Option<ResolvedWait>,
    pub final_targets: Vec<(DeviceName, f64)>,
}

impl MotionReport {
    fn from_plan(plan: &MotionPlan) -> Self {
        Self {
            commands: plan.command_count(),
            segments: plan.segments.len(),
            duration: plan.duration,
            wait: plan.wait.clone(),
            final_targets: plan.final_targets.clone(),
        }
    }
}

/// Geometry of an arc call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcGeometry {
    pub radius: f64,
    pub center: (f64, f64),
    /// Radians
    pub start_angle: f64,
    pub end_angle: f64,
    pub ccw: bool,
}

/// A complete simulated rig: devices, controllers, master, dispatcher,
/// planner and the background state refresh.
pub struct MotionSystem {
    config: Config,
    arena: Arc<DeviceArena>,
    registry: Arc<ControllerRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    planner: TrajectoryPlanner,
    diagnostics: DiagnosticLog,
    positioners: HashMap<String, Arc<SimulatedPositioner>>,
    shutters: HashMap<String, Arc<SimulatedShutter>>,
    sync_units: HashMap<String, Arc<SimulatedSyncUnit>>,
    master: Option<MasterController>,
    /// Controllers a stop or state update is addressed to
    top_level: Vec<String>,
    properties: Mutex<MoveProperties>,
    /// Bumped by every stop; a plan interrupted by one is never committed
    stops: AtomicU64,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl MotionSystem {
    /// Build and start the rig described by `config`.
    pub async fn new(config: Config) -> Result<Self, SystemError> {
        config.validate()?;
        let diagnostics = DiagnosticLog::new();
        let (shutdown, _) = broadcast::channel(4);
        let simulation = config.simulation.clone();

        let devices: Vec<Device> = config
            .controllers
            .iter()
            .flat_map(|c| c.devices.iter().map(|d| d.build(&c.name, c.kind)))
            .collect();
        let arena = Arc::new(DeviceArena::new(devices)?);

        let mut positioners = HashMap::new();
        let mut shutters = HashMap::new();
        let mut handles = Vec::new();
        for controller in &config.controllers {
            let names: Vec<DeviceName> = controller.devices.iter().map(|d| d.name).collect();
            let ids = arena.ids_of(&names)?;
            match controller.kind {
                ControllerKind::Positioner => {
                    let positioner = SimulatedPositioner::new(
                        &controller.name,
                        ids,
                        arena.clone(),
                        controller.buffer_capacity,
                        simulation.clone(),
                    );
                    handles.push(ControllerHandle::new(positioner.clone()));
                    positioners.insert(controller.name.clone(), positioner);
                }
                ControllerKind::Shutter => {
                    let shutter = SimulatedShutter::new(&controller.name, ids, arena.clone(), simulation.clone());
                    handles.push(ControllerHandle::new(shutter.clone()));
                    shutters.insert(controller.name.clone(), shutter);
                }
                ControllerKind::Sync | ControllerKind::Master => {}
            }
        }

        // Sync units are wired to every positioner and the first shutter
        let mut sync_units = HashMap::new();
        for controller in config.controllers.iter().filter(|c| c.kind == ControllerKind::Sync) {
            let mut wiring = SyncWiring::default();
            for positioner in positioners.values() {
                for id in positioner.devices() {
                    wiring.inputs.insert(*id, positioner.sync_in());
                }
                wiring.outputs.push(positioner.subscribe());
            }
            wiring.shutter = shutters
                .values()
                .find_map(|s| s.devices().first().map(|id| (*id, s.sync_in())));
            let unit = SimulatedSyncUnit::new(
                &controller.name,
                controller.buffer_capacity,
                arena.clone(),
                wiring,
                simulation.clone(),
            );
            handles.push(ControllerHandle::new(unit.clone()));
            sync_units.insert(controller.name.clone(), unit);
        }

        let mut registry = ControllerRegistry::new();
        for handle in handles {
            registry.register(handle)?;
        }

        let mut tasks = Vec::new();
        let mut top_level: Vec<String> = Vec::new();
        let master = match &config.master {
            Some(master_config) => {
                let mut slaves = Vec::new();
                let mut events = None;
                for slave in &master_config.slaves {
                    slaves.push(registry.get(slave)?.clone());
                    if let Some(unit) = sync_units.get(slave) {
                        events = Some(unit.subscribe());
                    }
                }
                let events = events
                    .ok_or_else(|| MotionError::invalid(format!("master '{}' has no sync unit", master_config.name)))?;
                let master = MasterController::new(
                    &master_config.name,
                    slaves,
                    arena.clone(),
                    MasterSettings {
                        buffer_safety_margin: master_config.buffer_safety_margin,
                        rethrow_margin: Duration::from_millis(master_config.rethrow_margin_ms),
                    },
                    diagnostics.clone(),
                )?;
                tasks.push(master.start(events, shutdown.subscribe()));
                registry.register(ControllerHandle::with_lock(Arc::new(master.clone()), master.lock()))?;
                top_level.push(master_config.name.clone());
                Some(master)
            }
            None => None,
        };
        let enslaved: Vec<&String> = config.master.iter().flat_map(|m| m.slaves.iter()).collect();
        for controller in &config.controllers {
            if !enslaved.contains(&&controller.name) {
                top_level.push(controller.name.clone());
            }
        }

        let registry = Arc::new(registry);
        let dispatcher = CommandDispatcher::new(registry.clone(), diagnostics.clone());
        tasks.push(dispatcher.start(shutdown.subscribe()));
        if let Some(task) = spawn_state_refresh(
            registry.clone(),
            arena.clone(),
            diagnostics.clone(),
            config.dispatcher.refresh_interval(),
            config.dispatcher.refresh_timeout(),
            shutdown.subscribe(),
        ) {
            tasks.push(task);
        }

        let planner = TrajectoryPlanner::from_registry(config.planner.clone(), arena.clone(), &registry)?;
        let properties = Mutex::new(planner.default_properties());
        diagnostics.info(
            SOURCE,
            format!(
                "'{}' ready: {} device(s), {} controller(s)",
                config.system.name,
                arena.len(),
                registry.len()
            ),
        );

        Ok(Self {
            config,
            arena,
            registry,
            dispatcher,
            planner,
            diagnostics,
            positioners,
            shutters,
            sync_units,
            master,
            top_level,
            properties,
            stops: AtomicU64::new(0),
            shutdown,
            tasks,
        })
    }

    /// Point-to-point move of every listed device.
    pub async fn jump(&self, devices: &str, positions: &[f64], props: &MoveProperties) -> MotionResult<MotionReport> {
        let devices = parse_device_names(devices)?;
        let plan = self.planner.plan_jump(&devices, positions, props)?;
        self.run_plan(plan).await
    }

    /// Synchronized straight line.
    pub async fn line(&self, devices: &str, positions: &[f64], props: &MoveProperties) -> MotionResult<MotionReport> {
        let devices = parse_device_names(devices)?;
        let plan = self.planner.plan_line(&devices, positions, props)?;
        self.run_plan(plan).await
    }

    /// Circular arc in the plane of exactly two devices.
    pub async fn arc(&self, devices: &str, geometry: ArcGeometry, props: &MoveProperties) -> MotionResult<MotionReport> {
        let names = parse_device_names(devices)?;
        let &[u, v] = names.as_slice() else {
            return Err(MotionError::invalid(format!(
                "an arc needs exactly two devices, got \"{}\"",
                devices
            )));
        };
        let speed = match props.speed {
            Some(speed) => speed,
            None => {
                let pu = self.arena.positioner(u)?;
                let pv = self.arena.positioner(v)?;
                pu.limits.default_speed.min(pv.limits.default_speed)
            }
        };
        let request = ArcRequest {
            devices: [u, v],
            radius: geometry.radius,
            center: geometry.center,
            start_angle: geometry.start_angle,
            end_angle: geometry.end_angle,
            ccw: geometry.ccw,
            speed,
            accuracy: props.accuracy,
            time_accuracy: props.time_accuracy,
        };
        let plan = self.planner.plan_arc(&request, props)?;
        self.run_plan(plan).await
    }

    async fn run_plan(&self, plan: MotionPlan) -> MotionResult<MotionReport> {
        let report = MotionReport::from_plan(&plan);
        if plan.is_empty() {
            return Ok(report);
        }
        let generation = self.stops.load(Ordering::SeqCst);
        let mut started = None;
        for line in plan.lines.iter().cloned() {
            if started.is_none() && line.label != "pre-position" {
                started = Some(Instant::now());
            }
            if let Err(e) = self.dispatcher.execute_line(line).await {
                self.planner.reset_tracking();
                return Err(e);
            }
        }
        if self.stops.load(Ordering::SeqCst) != generation {
            self.planner.reset_tracking();
            return Err(MotionError::Aborted("motion interrupted by stop".to_string()));
        }
        self.planner.commit(&plan);
        if let (Some(wait), Some(started)) = (&plan.wait, started) {
            sleep_until(started + self.config.simulation.scaled(wait.time)).await;
        }
        Ok(report)
    }

    /// Write a device property through its owning controller.
    pub async fn set_device_property(&self, device: DeviceName, property: &str, value: Value) -> MotionResult<()> {
        let route = self.registry.route_for_name(&self.arena, device)?;
        let command = Command::update_device_property(route.name(), device, property, value)?.awaited(true);
        self.dispatcher
            .execute_line(CommandLine::new(format!("set {}.{}", device, property), vec![command]))
            .await
    }

    pub async fn change_shutter(&self, open: bool) -> MotionResult<()> {
        let shutter = self
            .planner
            .shutter_device()
            .ok_or_else(|| MotionError::unavailable("no shutter configured"))?;
        let route = self.registry.route_for_name(&self.arena, shutter)?;
        let command = Command::change_shutter_state(route.name(), vec![shutter], open)?.awaited(true);
        self.dispatcher
            .execute_line(CommandLine::new("shutter", vec![command]))
            .await
    }

    /// Abort everything: discard queued lines, stop every controller and
    /// forget planned targets.
    pub async fn stop(&self) -> MotionResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let discarded = self.dispatcher.clear_queue();
        let commands = self
            .top_level
            .iter()
            .map(|name| Command::stop(name, Vec::new()))
            .collect::<MotionResult<Vec<_>>>()?;
        let result = self
            .dispatcher
            .execute_immediate(CommandLine::new("stop", commands))
            .await;
        self.planner.reset_tracking();
        self.diagnostics
            .info(SOURCE, format!("stop: {} queued line(s) discarded", discarded));
        result
    }

    /// Pull fresh device states after all queued lines and drop planned-target tracking.
    pub async fn synchronize(&self) -> MotionResult<()> {
        let commands = self
            .top_level
            .iter()
            .map(|name| Command::update_state(name, Vec::new()).map(|c| c.awaited(true)))
            .collect::<MotionResult<Vec<_>>>()?;
        self.dispatcher
            .execute_line(CommandLine::new("synchronize", commands))
            .await?;
        self.planner.reset_tracking();
        Ok(())
    }

    /// One state refresh pass, outside the periodic schedule.
    pub async fn refresh_states(&self) -> RefreshReport {
        update_states(
            &self.registry,
            &self.arena,
            &self.diagnostics,
            self.config.dispatcher.refresh_timeout(),
        )
        .await
    }

    pub fn device(&self, name: DeviceName) -> MotionResult<Device> {
        self.arena.snapshot(name)
    }

    pub fn position(&self, name: DeviceName) -> MotionResult<f64> {
        Ok(self.arena.positioner(name)?.position)
    }

    /// The current script-level move properties.
    pub fn move_properties(&self) -> MoveProperties {
        self.properties.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_move_property(&self, name: &str, value: &Value) -> MotionResult<()> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(name, value)
    }

    pub fn default_properties(&self) -> MoveProperties {
        self.planner.default_properties()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn arena(&self) -> &Arc<DeviceArena> {
        &self.arena
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn planner(&self) -> &TrajectoryPlanner {
        &self.planner
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn master(&self) -> Option<&MasterController> {
        self.master.as_ref()
    }

    pub fn positioner(&self, controller: &str) -> Option<&Arc<SimulatedPositioner>> {
        self.positioners.get(controller)
    }

    pub fn shutter(&self, controller: &str) -> Option<&Arc<SimulatedShutter>> {
        self.shutters.get(controller)
    }

    pub fn sync_unit(&self, controller: &str) -> Option<&Arc<SimulatedSyncUnit>> {
        self.sync_units.get(controller)
    }

    /// Stop background tasks. Tasks that do not exit within a second are aborted.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down '{}'", self.config.system.name);
        let _ = self.shutdown.send(());
        for mut task in self.tasks {
            if timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}
