// src/planner/mod.rs - Trajectory planner: Jump, Line and Arc into command lines
pub mod arc;
pub mod blend;
pub mod kinematics;
pub mod lead;
pub mod line;
pub mod profile;
pub mod properties;
pub mod timeline;
pub mod wait;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::command::{AwaitTarget, Command, CommandAction, CommandLine, MoveTarget, ShutterTiming};
use crate::config::PlannerConfig;
use crate::controller::{ControllerKind, ControllerRegistry};
use crate::device::{DeviceArena, DeviceKind, DeviceName, MoveSettings, Positioner};
use crate::error::{MotionError, MotionResult};

pub use arc::{ArcDiscretization, ArcRequest, calculate_tangent_endpoint};
pub use blend::{BlendedPath, JointVelocities, PvtSegment};
pub use kinematics::{AxisScaleMapping, ToolMapping};
pub use lead::{LeadInfo, LeadRamp, LeadSegment};
pub use line::{AxisMove, EdgeSpeeds, LineAxis, SynchronizedLine, synchronize_line};
pub use profile::{KinematicState, PositionerMovementInformation};
pub use properties::MoveProperties;
pub use timeline::ShutterTimeline;
pub use wait::{ResolvedWait, WaitUntil, resolve_wait, resolve_wait_across};

/// Where commands for one device go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRoute {
    pub controller: String,
    /// Routed through a master, so moves are buffered and sync-triggered
    pub buffered: bool,
}

/// One buffered movement: per-device targets plus shutter offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSegment {
    pub targets: Vec<(DeviceName, MoveTarget)>,
    pub shutter: ShutterTiming,
    /// Seconds
    pub duration: f64,
}

/// Everything a motion request turned into.
#[derive(Debug, Clone, Default)]
pub struct MotionPlan {
    /// Executed in order; a pre-positioning line comes first when needed
    pub lines: Vec<CommandLine>,
    pub segments: Vec<PlannedSegment>,
    /// Axis profiles of the nominal move (the first chord for arcs)
    pub axes: Vec<AxisMove>,
    pub wait: Option<ResolvedWait>,
    pub final_targets: Vec<(DeviceName, f64)>,
    /// Seconds, pre-positioning excluded
    pub duration: f64,
}

impl MotionPlan {
    pub fn command_count(&self) -> usize {
        self.lines.iter().map(CommandLine::len).sum()
    }

    pub fn count(&self, action: CommandAction) -> usize {
        self.lines.iter().map(|line| line.count(action)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.command_count() == 0
    }
}

/// Turns Jump, Line and Arc requests into command lines.
///
/// Keeps the last planned target of every device so that blended moves chain
/// from where the previous move will end rather than from a stale position.
pub struct TrajectoryPlanner {
    config: PlannerConfig,
    arena: Arc<DeviceArena>,
    routes: HashMap<DeviceName, DeviceRoute>,
    shutter: Option<DeviceName>,
    mapping: Arc<dyn ToolMapping>,
    tracked: Mutex<HashMap<DeviceName, f64>>,
}

impl TrajectoryPlanner {
    pub fn new(
        config: PlannerConfig,
        arena: Arc<DeviceArena>,
        routes: HashMap<DeviceName, DeviceRoute>,
        mapping: Arc<dyn ToolMapping>,
    ) -> Self {
        let shutter = arena.names().into_iter().find(|name| {
            arena
                .snapshot(*name)
                .is_ok_and(|device| device.kind() == DeviceKind::Shutter)
        });
        Self {
            config,
            arena,
            routes,
            shutter,
            mapping,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Derive routes from the registry and the tool mapping from each axis's tool scale.
    pub fn from_registry(config: PlannerConfig, arena: Arc<DeviceArena>, registry: &ControllerRegistry) -> MotionResult<Self> {
        let mut routes = HashMap::new();
        let mut scales = HashMap::new();
        for name in arena.names() {
            let handle = registry.route_for_name(&arena, name)?;
            routes.insert(
                name,
                DeviceRoute {
                    controller: handle.name().to_string(),
                    buffered: handle.kind() == ControllerKind::Master,
                },
            );
            if let Ok(positioner) = arena.positioner(name) {
                scales.insert(name, positioner.tool_scale);
            }
        }
        let mapping: Arc<dyn ToolMapping> = Arc::new(AxisScaleMapping::new(scales));
        Ok(Self::new(config, arena, routes, mapping))
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn default_properties(&self) -> MoveProperties {
        MoveProperties::new(self.config.default_accuracy, self.config.default_time_accuracy)
    }

    pub fn route(&self, device: DeviceName) -> MotionResult<&DeviceRoute> {
        self.routes
            .get(&device)
            .ok_or_else(|| MotionError::unavailable(format!("no route for device '{}'", device)))
    }

    pub fn shutter_device(&self) -> Option<DeviceName> {
        self.shutter
    }

    /// Remember where a plan leaves its devices.
    pub fn commit(&self, plan: &MotionPlan) {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        for (device, position) in &plan.final_targets {
            tracked.insert(*device, *position);
        }
    }

    /// Forget planned targets; the next move starts from the reported positions.
    pub fn reset_tracking(&self) {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn tracked_target(&self, device: DeviceName) -> Option<f64> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .copied()
    }

    /// Position and speed a new move of `device` starts from.
    fn start_state(&self, device: DeviceName, positioner: &Positioner) -> KinematicState {
        match self.tracked_target(device) {
            Some(position) => KinematicState::at_rest(position),
            None => KinematicState {
                position: positioner.position,
                speed: positioner.speed,
                acceleration: 0.0,
            },
        }
    }

    fn check_target(&self, device: DeviceName, positioner: &Positioner, position: f64) -> MotionResult<()> {
        if !position.is_finite() {
            return Err(MotionError::invalid(format!("target of device '{}' is not finite", device)));
        }
        if !positioner.limits.contains(position) {
            return Err(MotionError::invalid(format!(
                "target {} of device '{}' is outside its travel limits",
                position, device
            )));
        }
        Ok(())
    }

    /// Independent point-to-point move of every listed device.
    pub fn plan_jump(&self, devices: &[DeviceName], positions: &[f64], props: &MoveProperties) -> MotionResult<MotionPlan> {
        check_request(devices, positions)?;
        let mut axes = Vec::new();
        let mut settings = Vec::new();
        for (&device, &target) in devices.iter().zip(positions) {
            let positioner = self.arena.positioner(device)?;
            self.check_target(device, &positioner, target)?;
            let start = self.start_state(device, &positioner);
            if (target - start.position).abs() <= props.accuracy {
                tracing::trace!("Device '{}' already at {}", device, target);
                continue;
            }
            let limits = &positioner.limits;
            let speed = props.speed.unwrap_or(limits.default_speed).min(limits.max_speed);
            let profile = PositionerMovementInformation::new(
                limits,
                start,
                target,
                speed,
                limits.max_acceleration,
                limits.max_deceleration,
            )?;
            settings.push((
                device,
                MoveSettings {
                    acceleration: limits.max_acceleration,
                    deceleration: limits.max_deceleration,
                    speed,
                },
            ));
            axes.push(AxisMove {
                device,
                movement_ratio: None,
                profile,
            });
        }
        if axes.is_empty() {
            tracing::debug!("Jump: every device already in place");
            return Ok(MotionPlan::default());
        }

        let duration = axes.iter().map(|a| a.profile.total_time()).fold(0.0, f64::max);
        let shutter = if props.shutter {
            ShutterTimeline::new(vec![duration]).assign(0.0, duration)[0]
        } else {
            ShutterTiming::default()
        };
        let segment = PlannedSegment {
            targets: axes
                .iter()
                .map(|a| (a.device, MoveTarget::new(a.profile.target.position, a.profile.total_time())))
                .collect(),
            shutter,
            duration,
        };
        let wait = props
            .wait_until()
            .map(|w| resolve_wait(w, &axes, 0.0))
            .transpose()?;
        let segments = vec![segment];
        let lines = self.build_lines("jump", &segments, &settings, props, wait.is_some())?;
        tracing::debug!("Planned jump of {} device(s) in {:.4}s", axes.len(), duration);
        Ok(MotionPlan {
            lines,
            final_targets: axes.iter().map(|a| (a.device, a.profile.target.position)).collect(),
            segments,
            axes,
            wait,
            duration,
        })
    }

    /// Synchronized straight line, optionally extended by lead-in and lead-out ramps.
    pub fn plan_line(&self, devices: &[DeviceName], positions: &[f64], props: &MoveProperties) -> MotionResult<MotionPlan> {
        check_request(devices, positions)?;
        let mut line_axes = Vec::with_capacity(devices.len());
        let mut positioners = HashMap::new();
        for (&device, &target) in devices.iter().zip(positions) {
            let positioner = self.arena.positioner(device)?;
            self.check_target(device, &positioner, target)?;
            line_axes.push(LineAxis {
                device,
                limits: positioner.limits.clone(),
                start: self.start_state(device, &positioner).position,
                target,
            });
            positioners.insert(device, positioner);
        }

        let tolerance = self.config.sync_tolerance;
        let rest = synchronize_line(&line_axes, self.mapping.as_ref(), props.speed, EdgeSpeeds::REST, tolerance)?;
        let sync = if props.lead_in || props.lead_out {
            let edges = EdgeSpeeds {
                start: match (props.lead_in, props.lead_out) {
                    (false, _) => 0.0,
                    (true, true) => rest.speed,
                    (true, false) => (2.0 * rest.deceleration * rest.length).sqrt().min(rest.speed),
                },
                end: match (props.lead_in, props.lead_out) {
                    (_, false) => 0.0,
                    (true, true) => rest.speed,
                    (false, true) => (2.0 * rest.acceleration * rest.length).sqrt().min(rest.speed),
                },
            };
            synchronize_line(&line_axes, self.mapping.as_ref(), props.speed, edges, tolerance)?
        } else {
            rest
        };

        let jerk_time = self.config.jerk_time;
        let ramp_in = props
            .lead_in
            .then(|| lead::ramp(sync.trajectory.parameters.start_speed, sync.acceleration, jerk_time));
        let ramp_out = props
            .lead_out
            .then(|| lead::ramp(sync.trajectory.target.end_speed, sync.deceleration, jerk_time));
        let lead_in_time = ramp_in.map_or(0.0, |r| r.time);
        let lead_out_time = ramp_out.map_or(0.0, |r| r.time);
        let nominal = sync.total_time();
        let duration = lead_in_time + nominal + lead_out_time;

        let mut targets = Vec::with_capacity(line_axes.len());
        let mut lead_starts = Vec::new();
        let mut settings = Vec::new();
        for (axis, planned) in line_axes.iter().zip(&sync.axes) {
            let direction = if axis.target < axis.start { -1.0 } else { 1.0 };
            let ratio = planned.movement_ratio;
            let lead_in = ramp_in.map(|r| match ratio {
                Some(ratio) => lead::lead_in(axis.start, direction, &scale_ramp(&r, ratio)),
                None => stationary_lead(axis.start, r.time),
            });
            let lead_out = ramp_out.map(|r| match ratio {
                Some(ratio) => lead::lead_out(axis.target, direction, &scale_ramp(&r, ratio)),
                None => stationary_lead(axis.target, r.time),
            });
            let positioner = &positioners[&axis.device];
            if let Some(segment) = lead_in {
                self.check_target(axis.device, positioner, segment.start_position)?;
                lead_starts.push((axis.device, segment.start_position));
            }
            if let Some(segment) = lead_out {
                self.check_target(axis.device, positioner, segment.end_position)?;
            }
            let info = LeadInfo { lead_in, lead_out };
            let end = lead_out.map_or(axis.target, |s| s.end_position);
            targets.push((
                axis.device,
                MoveTarget {
                    position: end,
                    allocated_time: duration,
                    lead: (!info.is_empty()).then_some(info),
                    velocity: None,
                },
            ));
            if ratio.is_some() {
                settings.push((
                    axis.device,
                    MoveSettings {
                        acceleration: planned.profile.target.acceleration,
                        deceleration: planned.profile.target.deceleration,
                        speed: planned.profile.target.speed,
                    },
                ));
            }
        }

        let shutter = if props.shutter {
            ShutterTimeline::new(vec![duration]).assign(lead_in_time, lead_in_time + nominal)[0]
        } else {
            ShutterTiming::default()
        };
        let wait = props
            .wait_until()
            .map(|w| resolve_wait(w, &sync.axes, lead_in_time))
            .transpose()?;

        let mut lines = self.pre_position(&lead_starts, props)?;
        let final_targets = targets.iter().map(|(d, t)| (*d, t.position)).collect();
        let segments = vec![PlannedSegment {
            targets,
            shutter,
            duration,
        }];
        lines.extend(self.build_lines("line", &segments, &settings, props, wait.is_some())?);
        tracing::debug!(
            "Planned line of length {:.4} over {} axes in {:.4}s (lead-in {:.4}s, lead-out {:.4}s)",
            sync.length,
            line_axes.len(),
            duration,
            lead_in_time,
            lead_out_time
        );
        Ok(MotionPlan {
            lines,
            segments,
            axes: sync.axes,
            wait,
            final_targets,
            duration,
        })
    }

    /// Circular arc in the plane of two axes, run as a chain of chords.
    pub fn plan_arc(&self, request: &ArcRequest, props: &MoveProperties) -> MotionResult<MotionPlan> {
        let layout = request.discretize()?;
        let [u, v] = request.devices;
        let pu = self.arena.positioner(u)?;
        let pv = self.arena.positioner(v)?;
        for point in &layout.points {
            self.check_target(u, &pu, point.0)?;
            self.check_target(v, &pv, point.1)?;
        }

        let acceleration = pu.limits.max_acceleration.min(pv.limits.max_acceleration);
        let deceleration = pu.limits.max_deceleration.min(pv.limits.max_deceleration);
        let speed = request.speed.min(pu.limits.max_speed).min(pv.limits.max_speed);
        let chord = 2.0 * request.radius * (layout.segment_angle.abs() / 2.0).sin();
        // Speed carried across chord boundaries; every chord can reach it and stop from it
        let boundary = speed.min((acceleration * chord).sqrt()).min((deceleration * chord).sqrt());
        let n = layout.number_of_segments;

        let mut chords = Vec::with_capacity(n);
        for i in 0..n {
            let (from, to) = (layout.points[i], layout.points[i + 1]);
            let axes = [
                LineAxis {
                    device: u,
                    limits: pu.limits.clone(),
                    start: from.0,
                    target: to.0,
                },
                LineAxis {
                    device: v,
                    limits: pv.limits.clone(),
                    start: from.1,
                    target: to.1,
                },
            ];
            let edges = EdgeSpeeds {
                start: if i > 0 || props.lead_in { boundary } else { 0.0 },
                end: if i + 1 < n || props.lead_out { boundary } else { 0.0 },
            };
            chords.push(synchronize_line(
                &axes,
                self.mapping.as_ref(),
                Some(speed),
                edges,
                self.config.sync_tolerance,
            )?);
        }

        let jerk_time = self.config.jerk_time;
        let first = layout.points[0];
        let last = layout.points[n];
        let end_angle = request.start_angle + layout.sweep;
        let mut segments = Vec::with_capacity(n + 2);
        let mut pre_target = first;

        if props.lead_in {
            let ramp = lead::ramp(boundary, acceleration, jerk_time);
            let start = calculate_tangent_endpoint(first, request.tangent_at(request.start_angle), -ramp.distance);
            self.check_target(u, &pu, start.0)?;
            self.check_target(v, &pv, start.1)?;
            pre_target = start;
            segments.push(lead_segment(
                [u, v],
                start,
                first,
                ramp.time,
                true,
            ));
        }
        // Neighbouring chords share the tangent velocity at their joint
        let joints = layout.joint_velocities(
            request,
            if props.lead_in { boundary } else { 0.0 },
            boundary,
            if props.lead_out { boundary } else { 0.0 },
        );
        for (i, (chord, to)) in chords.iter().zip(&layout.points[1..]).enumerate() {
            let time = chord.total_time();
            let (entry, exit) = (joints[i], joints[i + 1]);
            segments.push(PlannedSegment {
                targets: vec![
                    (u, MoveTarget::new(to.0, time).with_velocities(entry.0, exit.0)),
                    (v, MoveTarget::new(to.1, time).with_velocities(entry.1, exit.1)),
                ],
                shutter: ShutterTiming::default(),
                duration: time,
            });
        }
        if props.lead_out {
            let ramp = lead::ramp(boundary, deceleration, jerk_time);
            let end = calculate_tangent_endpoint(last, request.tangent_at(end_angle), ramp.distance);
            self.check_target(u, &pu, end.0)?;
            self.check_target(v, &pv, end.1)?;
            segments.push(lead_segment([u, v], last, end, ramp.time, false));
        }

        let lead_in_time = if props.lead_in { segments[0].duration } else { 0.0 };
        let arc_time: f64 = chords.iter().map(SynchronizedLine::total_time).sum();
        if props.shutter {
            let timeline = ShutterTimeline::new(segments.iter().map(|s| s.duration).collect());
            for (segment, timing) in segments
                .iter_mut()
                .zip(timeline.assign(lead_in_time, lead_in_time + arc_time))
            {
                segment.shutter = timing;
            }
        }

        let mut pieces = Vec::with_capacity(n);
        let mut offset = lead_in_time;
        for chord in &chords {
            pieces.push((offset, chord.axes.clone()));
            offset += chord.total_time();
        }
        let wait = props
            .wait_until()
            .map(|w| resolve_wait_across(w, &pieces))
            .transpose()?;

        let settings = [(u, &pu), (v, &pv)]
            .into_iter()
            .map(|(device, positioner)| (device, chord_envelope(device, positioner, &chords)))
            .collect::<Vec<_>>();

        let mut lines = self.pre_position(&[(u, pre_target.0), (v, pre_target.1)], props)?;
        lines.extend(self.build_lines("arc", &segments, &settings, props, wait.is_some())?);
        let duration = segments.iter().map(|s| s.duration).sum();
        let final_targets = segments
            .last()
            .map(|s| s.targets.iter().map(|(d, t)| (*d, t.position)).collect())
            .unwrap_or_default();
        tracing::debug!(
            "Planned arc: {} chord(s) of {:.4} rad, boundary speed {:.4}, {:.4}s",
            n,
            layout.segment_angle,
            boundary,
            duration
        );
        Ok(MotionPlan {
            lines,
            segments,
            axes: chords.first().map(|c| c.axes.clone()).unwrap_or_default(),
            wait,
            final_targets,
            duration,
        })
    }

    /// Jump that brings devices to the start of a move, if any of them is elsewhere.
    fn pre_position(&self, targets: &[(DeviceName, f64)], props: &MoveProperties) -> MotionResult<Vec<CommandLine>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let (devices, positions): (Vec<_>, Vec<_>) = targets.iter().copied().unzip();
        let jump_props = MoveProperties::new(props.accuracy, props.time_accuracy);
        let plan = self.plan_jump(&devices, &positions, &jump_props)?;
        Ok(plan
            .lines
            .into_iter()
            .map(|mut line| {
                line.label = "pre-position".to_string();
                line
            })
            .collect())
    }

    /// Commands for a chain of segments: settings updates first, then one
    /// MoveAbsolute per controller and segment, then the completion wait.
    fn build_lines(
        &self,
        label: &str,
        segments: &[PlannedSegment],
        settings: &[(DeviceName, MoveSettings)],
        props: &MoveProperties,
        has_wait: bool,
    ) -> MotionResult<Vec<CommandLine>> {
        let mut commands = Vec::new();

        let mut updates: Vec<(String, Vec<DeviceName>, Vec<MoveSettings>)> = Vec::new();
        for (device, s) in settings {
            let positioner = self.arena.positioner(*device)?;
            if !positioner.settings_update_pending
                && !positioner.settings.differs_from(s, self.config.position_tolerance)
            {
                continue;
            }
            let route = self.route(*device)?;
            match updates.iter_mut().find(|(c, _, _)| *c == route.controller) {
                Some((_, devices, values)) => {
                    devices.push(*device);
                    values.push(*s);
                }
                None => updates.push((route.controller.clone(), vec![*device], vec![*s])),
            }
        }
        for (controller, devices, values) in updates {
            commands.push(Command::update_move_settings(&controller, devices, values)?.awaited(true));
        }

        let mut masters: Vec<String> = Vec::new();
        let mut direct_shutter = false;
        for segment in segments {
            let mut groups: Vec<(&DeviceRoute, Vec<DeviceName>, Vec<MoveTarget>)> = Vec::new();
            for (device, target) in &segment.targets {
                let route = self.route(*device)?;
                match groups.iter_mut().find(|(r, _, _)| r.controller == route.controller) {
                    Some((_, devices, targets)) => {
                        devices.push(*device);
                        targets.push(*target);
                    }
                    None => groups.push((route, vec![*device], vec![*target])),
                }
            }
            for (route, devices, targets) in groups {
                let estimate = Duration::from_secs_f64(segment.duration.max(0.0));
                let command = if route.buffered {
                    if !masters.contains(&route.controller) {
                        masters.push(route.controller.clone());
                    }
                    Command::move_absolute(&route.controller, devices, targets, segment.shutter)?.awaited(false)
                } else {
                    direct_shutter |= segment.shutter.uses_shutter();
                    Command::move_absolute(&route.controller, devices, targets, ShutterTiming::default())?
                        .awaited(!has_wait)
                };
                commands.push(command.with_estimate(estimate));
            }
        }

        let await_target = if props.blending || has_wait {
            AwaitTarget::LastItemTaken
        } else {
            AwaitTarget::Completed
        };
        for master in masters {
            commands.push(Command::await_queued_items(&master, await_target)?);
        }
        let main = CommandLine::new(label, commands);

        match self.shutter.filter(|_| direct_shutter) {
            Some(shutter) => {
                let route = self.route(shutter)?;
                let switch = |open: bool, suffix: &str| -> MotionResult<CommandLine> {
                    Ok(CommandLine::new(
                        format!("{} shutter {}", label, suffix),
                        vec![Command::change_shutter_state(&route.controller, vec![shutter], open)?.awaited(true)],
                    ))
                };
                Ok(vec![switch(true, "open")?, main, switch(false, "close")?])
            }
            None => Ok(vec![main]),
        }
    }
}

fn check_request(devices: &[DeviceName], positions: &[f64]) -> MotionResult<()> {
    if devices.is_empty() {
        return Err(MotionError::invalid("no devices given"));
    }
    if devices.len() != positions.len() {
        return Err(MotionError::invalid(format!(
            "{} device(s) but {} position(s)",
            devices.len(),
            positions.len()
        )));
    }
    for (i, device) in devices.iter().enumerate() {
        if devices[..i].contains(device) {
            return Err(MotionError::invalid(format!("device '{}' given twice", device)));
        }
    }
    Ok(())
}

fn scale_ramp(ramp: &LeadRamp, ratio: f64) -> LeadRamp {
    LeadRamp {
        distance: ramp.distance / ratio,
        time: ramp.time,
        jerk_distance: ramp.jerk_distance / ratio,
        constant_acceleration_distance: ramp.constant_acceleration_distance / ratio,
    }
}

fn stationary_lead(position: f64, time: f64) -> LeadSegment {
    LeadSegment {
        start_position: position,
        end_position: position,
        allocated_time: time,
    }
}

/// Straight lead segment of both arc axes from `from` to `to`.
fn lead_segment(devices: [DeviceName; 2], from: (f64, f64), to: (f64, f64), time: f64, lead_in: bool) -> PlannedSegment {
    let target = |start: f64, end: f64| {
        let segment = LeadSegment {
            start_position: start,
            end_position: end,
            allocated_time: time,
        };
        let info = if lead_in {
            LeadInfo {
                lead_in: Some(segment),
                lead_out: None,
            }
        } else {
            LeadInfo {
                lead_in: None,
                lead_out: Some(segment),
            }
        };
        MoveTarget {
            position: end,
            allocated_time: time,
            lead: Some(info),
            velocity: None,
        }
    };
    PlannedSegment {
        targets: vec![(devices[0], target(from.0, to.0)), (devices[1], target(from.1, to.1))],
        shutter: ShutterTiming::default(),
        duration: time,
    }
}

/// Largest settings any chord asks of `device`, capped by its limits.
fn chord_envelope(device: DeviceName, positioner: &Positioner, chords: &[SynchronizedLine]) -> MoveSettings {
    let limits = &positioner.limits;
    let mut envelope = MoveSettings {
        acceleration: 0.0,
        deceleration: 0.0,
        speed: 0.0,
    };
    for axis in chords.iter().filter_map(|c| c.axis(device)).filter(|a| a.movement_ratio.is_some()) {
        envelope.acceleration = envelope.acceleration.max(axis.profile.target.acceleration);
        envelope.deceleration = envelope.deceleration.max(axis.profile.target.deceleration);
        envelope.speed = envelope.speed.max(axis.profile.target.speed);
    }
    MoveSettings {
        acceleration: positive_or(envelope.acceleration, limits.max_acceleration).min(limits.max_acceleration),
        deceleration: positive_or(envelope.deceleration, limits.max_deceleration).min(limits.max_deceleration),
        speed: positive_or(envelope.speed, limits.default_speed).min(limits.max_speed),
    }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value > 0.0 { value } else { fallback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{Device, PositionerLimits};

    fn planner(buffered: bool) -> TrajectoryPlanner {
        let config = Config::default();
        let stage = config.controller("stage").map(|c| c.devices.clone()).unwrap_or_default();
        let mut devices: Vec<Device> = stage
            .iter()
            .map(|d| d.build("stage", ControllerKind::Positioner))
            .collect();
        devices.push(Device::shutter('s', "shutter"));
        let arena = Arc::new(DeviceArena::new(devices).unwrap());
        let controller = if buffered { "master" } else { "stage" };
        let routes = HashMap::from([
            ('x', DeviceRoute { controller: controller.to_string(), buffered }),
            ('y', DeviceRoute { controller: controller.to_string(), buffered }),
            ('s', DeviceRoute { controller: if buffered { "master" } else { "shutter" }.to_string(), buffered }),
        ]);
        TrajectoryPlanner::new(config.planner, arena, routes, Arc::new(AxisScaleMapping::default()))
    }

    #[test]
    fn jump_to_current_position_plans_nothing() {
        let p = planner(true);
        let plan = p.plan_jump(&['x', 'y'], &[0.0, 0.0005], &p.default_properties()).unwrap();
        assert!(plan.is_empty());
        assert!(plan.final_targets.is_empty());
    }

    #[test]
    fn buffered_jump_ends_with_queue_wait() {
        let p = planner(true);
        let plan = p.plan_jump(&['x'], &[10.0], &p.default_properties()).unwrap();
        let commands = &plan.lines[0].commands;
        assert_eq!(commands[0].action, CommandAction::UpdateMoveSettings);
        assert_eq!(commands.last().map(|c| c.action), Some(CommandAction::AwaitQueuedItems));
        assert_eq!(plan.count(CommandAction::MoveAbsolute), 1);
    }

    #[test]
    fn direct_jump_is_awaited() {
        let p = planner(false);
        let plan = p.plan_jump(&['y'], &[-3.0], &p.default_properties()).unwrap();
        let moves: Vec<_> = plan.lines[0]
            .commands
            .iter()
            .filter(|c| c.action == CommandAction::MoveAbsolute)
            .collect();
        assert_eq!(moves.len(), 1);
        assert!(moves[0].await_completion);
        assert_eq!(plan.count(CommandAction::AwaitQueuedItems), 0);
    }

    #[test]
    fn tracking_chains_blended_moves() {
        let p = planner(true);
        let props = p.default_properties().with_blending(true);
        let first = p.plan_jump(&['x'], &[10.0], &props).unwrap();
        p.commit(&first);
        assert_eq!(p.tracked_target('x'), Some(10.0));
        let second = p.plan_jump(&['x'], &[10.0], &props).unwrap();
        assert!(second.is_empty());
        p.reset_tracking();
        assert_eq!(p.tracked_target('x'), None);
    }

    #[test]
    fn soft_limits_reject_the_move() {
        let config = Config::default();
        let mut x = config.controllers[0].devices[0].clone();
        x.max_position = Some(5.0);
        let arena = Arc::new(DeviceArena::new(vec![x.build("stage", ControllerKind::Positioner)]).unwrap());
        let routes = HashMap::from([('x', DeviceRoute { controller: "stage".to_string(), buffered: false })]);
        let p = TrajectoryPlanner::new(config.planner, arena, routes, Arc::new(AxisScaleMapping::default()));
        let result = p.plan_jump(&['x'], &[6.0], &p.default_properties());
        assert!(matches!(result, Err(MotionError::InvalidRequest(_))));
    }

    #[test]
    fn line_with_leads_opens_shutter_after_lead_in() {
        let p = planner(true);
        let props = p.default_properties().with_leads(true, true).with_shutter(true).with_speed(50.0);
        let plan = p.plan_line(&['x', 'y'], &[30.0, 40.0], &props).unwrap();
        // pre-position line, then the move
        assert_eq!(plan.lines.len(), 2);
        let segment = &plan.segments[0];
        let lead = segment.targets[0].1.lead.unwrap();
        let lead_in = lead.lead_in.unwrap();
        assert!(lead_in.start_position < 0.0);
        let on = segment.shutter.delay_on_ms.unwrap();
        assert_eq!(on, (lead_in.allocated_time * 1000.0).round() as u64);
        let off = segment.shutter.delay_off_ms.unwrap();
        // 50 units at 50/s
        assert_eq!(off - on, 1000);
    }

    #[test]
    fn arc_chords_blend_along_the_tangent() {
        let p = planner(true);
        let request = ArcRequest {
            devices: ['x', 'y'],
            radius: 50.0,
            center: (-50.0, 0.0),
            start_angle: 0.0,
            end_angle: std::f64::consts::FRAC_PI_2,
            ccw: true,
            speed: 100.0,
            accuracy: 1.0,
            time_accuracy: 0.03,
        };
        let layout = request.discretize().unwrap();
        let n = layout.number_of_segments;
        let plan = p.plan_arc(&request, &p.default_properties()).unwrap();
        assert_eq!(plan.segments.len(), n);
        let joints = |segment: &PlannedSegment| {
            let (u, v) = (segment.targets[0].1.velocity.unwrap(), segment.targets[1].1.velocity.unwrap());
            ((u.start, v.start), (u.end, v.end))
        };

        let (start, _) = joints(&plan.segments[0]);
        assert_eq!(start, (0.0, 0.0));
        let (_, end) = joints(&plan.segments[n - 1]);
        assert_eq!(end, (0.0, 0.0));
        let mut carried = None;
        for i in 1..n {
            let (_, exit) = joints(&plan.segments[i - 1]);
            let (entry, _) = joints(&plan.segments[i]);
            assert_eq!(exit, entry);
            let tangent = request.tangent_at(layout.segment_angle * i as f64);
            let speed = entry.0.hypot(entry.1);
            assert!(speed > 0.0);
            assert!((entry.0 - speed * tangent.0).abs() < 1e-9);
            assert!((entry.1 - speed * tangent.1).abs() < 1e-9);
            let carried = *carried.get_or_insert(speed);
            assert!((speed - carried).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_length_line_is_rejected() {
        let p = planner(true);
        let result = p.plan_line(&['x', 'y'], &[0.0, 0.0], &p.default_properties());
        assert!(matches!(result, Err(MotionError::InvalidRequest(_))));
    }

    #[test]
    fn mismatched_request_is_rejected() {
        let p = planner(true);
        assert!(p.plan_jump(&['x', 'y'], &[1.0], &p.default_properties()).is_err());
        assert!(p.plan_jump(&['s'], &[1.0], &p.default_properties()).is_err());
        assert!(p.plan_jump(&['q'], &[1.0], &p.default_properties()).is_err());
    }

    #[test]
    fn chord_envelope_falls_back_to_limits() {
        let positioner = Positioner {
            position: 0.0,
            speed: 0.0,
            acceleration: 0.0,
            settings: MoveSettings { acceleration: 1.0, deceleration: 1.0, speed: 1.0 },
            limits: PositionerLimits {
                max_speed: 10.0,
                max_acceleration: 100.0,
                max_deceleration: 50.0,
                default_speed: 5.0,
                min_position: None,
                max_position: None,
            },
            tool_scale: 1.0,
            native_sync_out: true,
            settings_update_pending: false,
            properties: HashMap::new(),
        };
        let envelope = chord_envelope('x', &positioner, &[]);
        assert_eq!(envelope, MoveSettings { acceleration: 100.0, deceleration: 50.0, speed: 5.0 });
    }
}
