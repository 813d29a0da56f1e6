// src/planner/line.rs - Multi-axis synchronization through trajectory space
use crate::device::{DeviceName, PositionerLimits};
use crate::error::{MotionError, MotionResult};
use crate::planner::kinematics::ToolMapping;
use crate::planner::profile::{EPSILON, KinematicState, PositionerMovementInformation};

/// One participating axis of a straight line move.
#[derive(Debug, Clone)]
pub struct LineAxis {
    pub device: DeviceName,
    pub limits: PositionerLimits,
    pub start: f64,
    pub target: f64,
}

/// Planned profile of one axis.
#[derive(Debug, Clone)]
pub struct AxisMove {
    pub device: DeviceName,
    /// Trajectory length divided by the axis displacement. `None` for axes that do not move.
    pub movement_ratio: Option<f64>,
    pub profile: PositionerMovementInformation,
}

#[derive(Debug, Clone)]
pub struct SynchronizedLine {
    /// Tool-space length of the line
    pub length: f64,
    /// Common trajectory-space limits
    pub speed: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    /// The 1-D profile along the trajectory
    pub trajectory: PositionerMovementInformation,
    pub axes: Vec<AxisMove>,
}

impl SynchronizedLine {
    pub fn total_time(&self) -> f64 {
        self.trajectory.total_time()
    }

    pub fn axis(&self, device: DeviceName) -> Option<&AxisMove> {
        self.axes.iter().find(|axis| axis.device == device)
    }
}

/// Edge speeds of a line in trajectory space. Values above the line speed are
/// clamped to it, so `f64::INFINITY` means "enter/leave at full speed".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeSpeeds {
    pub start: f64,
    pub end: f64,
}

impl EdgeSpeeds {
    pub const REST: EdgeSpeeds = EdgeSpeeds { start: 0.0, end: 0.0 };
}

/// Plan a straight line on which every axis starts and stops together.
///
/// Each axis limit is projected into trajectory space through its movement
/// ratio, the minimum is taken as the common limit, and the result is
/// back-projected per axis. A second pass scales acceleration and deceleration
/// so every axis spends exactly as long ramping as the slowest one.
pub fn synchronize_line(
    axes: &[LineAxis],
    mapping: &dyn ToolMapping,
    requested_speed: Option<f64>,
    edges: EdgeSpeeds,
    tolerance: f64,
) -> MotionResult<SynchronizedLine> {
    if axes.is_empty() {
        return Err(MotionError::invalid("a line needs at least one axis"));
    }
    for axis in axes {
        if !axis.start.is_finite() || !axis.target.is_finite() {
            return Err(MotionError::invalid(format!("target of axis '{}' is not finite", axis.device)));
        }
    }
    if let Some(speed) = requested_speed
        && !(speed.is_finite() && speed > 0.0)
    {
        return Err(MotionError::invalid(format!("line speed must be positive, got {}", speed)));
    }

    let deltas: Vec<(DeviceName, f64)> = axes.iter().map(|a| (a.device, a.target - a.start)).collect();
    let length = mapping.trajectory_length(&deltas);
    if !(length > EPSILON) {
        return Err(MotionError::invalid("degenerate zero-length trajectory"));
    }

    let ratios: Vec<Option<f64>> = deltas
        .iter()
        .map(|(_, delta)| (delta.abs() > EPSILON).then(|| length / delta.abs()))
        .collect();

    let mut acceleration = f64::INFINITY;
    let mut deceleration = f64::INFINITY;
    let mut max_speed = f64::INFINITY;
    let mut default_speed = f64::INFINITY;
    for (axis, ratio) in axes.iter().zip(&ratios) {
        let Some(ratio) = ratio else { continue };
        acceleration = acceleration.min(axis.limits.max_acceleration * ratio);
        deceleration = deceleration.min(axis.limits.max_deceleration * ratio);
        max_speed = max_speed.min(axis.limits.max_speed * ratio);
        default_speed = default_speed.min(axis.limits.default_speed * ratio);
    }
    let speed = requested_speed.unwrap_or(default_speed).min(max_speed);
    let start_speed = edges.start.clamp(0.0, speed);
    let end_speed = edges.end.clamp(0.0, speed);

    let trajectory_limits = PositionerLimits {
        max_speed: speed,
        max_acceleration: acceleration,
        max_deceleration: deceleration,
        default_speed: speed,
        min_position: None,
        max_position: None,
    };
    let trajectory = PositionerMovementInformation::with_end_speed(
        &trajectory_limits,
        KinematicState {
            position: 0.0,
            speed: start_speed,
            acceleration: 0.0,
        },
        length,
        speed,
        acceleration,
        deceleration,
        end_speed,
    )?;

    let project = |axis: &LineAxis, ratio: f64, a: f64, d: f64| {
        let direction = (axis.target - axis.start).signum();
        PositionerMovementInformation::with_end_speed(
            &axis.limits,
            KinematicState {
                position: axis.start,
                speed: direction * start_speed / ratio,
                acceleration: 0.0,
            },
            axis.target,
            speed / ratio,
            a,
            d,
            end_speed / ratio,
        )
    };

    let mut moving = Vec::with_capacity(axes.len());
    for (axis, ratio) in axes.iter().zip(&ratios) {
        if let Some(ratio) = *ratio {
            let profile = project(axis, ratio, acceleration / ratio, deceleration / ratio)?;
            moving.push((axis, ratio, profile));
        }
    }

    let slowest_accel = moving.iter().map(|(_, _, p)| p.acceleration_time()).fold(0.0, f64::max);
    let slowest_decel = moving.iter().map(|(_, _, p)| p.deceleration_time()).fold(0.0, f64::max);
    for (axis, ratio, profile) in moving.iter_mut() {
        let accel_time = profile.acceleration_time();
        let decel_time = profile.deceleration_time();
        let mut a = profile.target.acceleration;
        let mut d = profile.target.deceleration;
        let mut rescaled = false;
        if accel_time > EPSILON && accel_time < slowest_accel - EPSILON {
            a *= accel_time / slowest_accel;
            rescaled = true;
        }
        if decel_time > EPSILON && decel_time < slowest_decel - EPSILON {
            d *= decel_time / slowest_decel;
            rescaled = true;
        }
        if rescaled {
            tracing::trace!(device = %axis.device, a, d, "Rescaled axis ramps to the slowest axis");
            *profile = project(axis, *ratio, a, d)?;
        }
    }

    let total = trajectory.total_time();
    let mut planned = Vec::with_capacity(axes.len());
    for (axis, ratio) in axes.iter().zip(&ratios) {
        let profile = match ratio {
            Some(_) => moving
                .iter()
                .find(|(m, _, _)| m.device == axis.device)
                .map(|(_, _, p)| p.clone())
                .ok_or_else(|| MotionError::invalid(format!("axis '{}' was not planned", axis.device)))?,
            None => PositionerMovementInformation::hold(&axis.limits, axis.start, total),
        };
        let drift = (profile.total_time() - total).abs();
        if drift > tolerance * total.max(1.0) {
            return Err(MotionError::invalid(format!(
                "axis '{}' cannot follow the line: {:.9}s vs {:.9}s",
                axis.device,
                profile.total_time(),
                total
            )));
        }
        planned.push(AxisMove {
            device: axis.device,
            movement_ratio: *ratio,
            profile,
        });
    }

    tracing::debug!(
        length,
        speed,
        acceleration,
        deceleration,
        total_time = total,
        "Synchronized line"
    );

    Ok(SynchronizedLine {
        length,
        speed,
        acceleration,
        deceleration,
        trajectory,
        axes: planned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::kinematics::AxisScaleMapping;

    fn axis(device: DeviceName, start: f64, target: f64, accel: f64) -> LineAxis {
        LineAxis {
            device,
            limits: PositionerLimits {
                max_speed: 100.0,
                max_acceleration: accel,
                max_deceleration: accel,
                default_speed: 50.0,
                min_position: None,
                max_position: None,
            },
            start,
            target,
        }
    }

    #[test]
    fn axes_share_total_time() {
        let axes = [axis('x', 0.0, 30.0, 1000.0), axis('y', 0.0, 40.0, 200.0)];
        let line =
            synchronize_line(&axes, &AxisScaleMapping::default(), Some(80.0), EdgeSpeeds::REST, 1e-9).unwrap();
        assert!((line.length - 50.0).abs() < 1e-12);
        let t = line.total_time();
        for axis in &line.axes {
            assert!((axis.profile.total_time() - t).abs() < 1e-9);
        }
        // y is the limiting axis: 200 * 50/40 = 250 in trajectory space
        assert!((line.acceleration - 250.0).abs() < 1e-9);
        let y = line.axis('y').unwrap();
        assert!((y.profile.target.acceleration - 200.0).abs() < 1e-9);
    }

    #[test]
    fn stationary_axis_holds() {
        let axes = [axis('x', 0.0, 10.0, 1000.0), axis('y', 5.0, 5.0, 1000.0)];
        let line = synchronize_line(&axes, &AxisScaleMapping::default(), None, EdgeSpeeds::REST, 1e-9).unwrap();
        let y = line.axis('y').unwrap();
        assert!(y.movement_ratio.is_none());
        assert_eq!(y.profile.position_at(0.01), 5.0);
        assert!((y.profile.total_time() - line.total_time()).abs() < 1e-12);
    }

    #[test]
    fn zero_length_fails() {
        let axes = [axis('x', 1.0, 1.0, 1000.0), axis('y', 2.0, 2.0, 1000.0)];
        let err = synchronize_line(&axes, &AxisScaleMapping::default(), None, EdgeSpeeds::REST, 1e-9).unwrap_err();
        assert!(matches!(err, MotionError::InvalidRequest(_)));
    }

    #[test]
    fn requested_speed_is_capped_by_axis_limits() {
        let axes = [axis('x', 0.0, 10.0, 1000.0)];
        let line =
            synchronize_line(&axes, &AxisScaleMapping::default(), Some(1_000.0), EdgeSpeeds::REST, 1e-9).unwrap();
        assert_eq!(line.speed, 100.0);
    }
}
