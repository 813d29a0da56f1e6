// src/planner/profile.rs - Single-axis trapezoidal / triangular velocity profiles
use crate::device::PositionerLimits;
use crate::error::{MotionError, MotionResult};

/// Numerical slack used when comparing kinematic quantities.
pub const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KinematicState {
    pub position: f64,
    /// Signed velocity
    pub speed: f64,
    pub acceleration: f64,
}

impl KinematicState {
    pub fn at_rest(position: f64) -> Self {
        Self {
            position,
            speed: 0.0,
            acceleration: 0.0,
        }
    }
}

/// Where the axis must go and how hard it may push to get there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetState {
    pub position: f64,
    /// +1.0 or -1.0
    pub direction: f64,
    /// Always `|position - start|`
    pub distance: f64,
    pub speed: f64,
    pub acceleration: f64,
    pub deceleration: f64,
    /// Speed the axis still has when it reaches `position`
    pub end_speed: f64,
}

/// Phase timings derived from a start and a target state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KinematicParameters {
    pub total_time: f64,
    pub constant_speed_start_time: f64,
    pub constant_speed_end_time: f64,
    pub constant_speed_start_position: f64,
    pub constant_speed_end_position: f64,
    /// Highest speed actually reached (the target speed for trapezoids)
    pub peak_speed: f64,
    /// Speed along the direction of travel at t = 0
    pub start_speed: f64,
    /// Distance needed to reach the target speed from `start_speed`
    pub distance_to_accelerate: f64,
    /// Distance needed to come down from the target speed to the end speed
    pub distance_to_decelerate: f64,
    pub triangular: bool,
}

/// Planning record for one axis: limits, start, target and the derived profile.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionerMovementInformation {
    pub limits: PositionerLimits,
    pub start: KinematicState,
    pub target: TargetState,
    pub parameters: KinematicParameters,
}

impl PositionerMovementInformation {
    /// Plan a move that ends at rest.
    pub fn new(
        limits: &PositionerLimits,
        start: KinematicState,
        target_position: f64,
        speed: f64,
        acceleration: f64,
        deceleration: f64,
    ) -> MotionResult<Self> {
        Self::with_end_speed(limits, start, target_position, speed, acceleration, deceleration, 0.0)
    }

    /// Plan a move that still travels at `end_speed` when it reaches the target.
    pub fn with_end_speed(
        limits: &PositionerLimits,
        start: KinematicState,
        target_position: f64,
        speed: f64,
        acceleration: f64,
        deceleration: f64,
        end_speed: f64,
    ) -> MotionResult<Self> {
        for (label, value) in [
            ("start position", start.position),
            ("start speed", start.speed),
            ("target position", target_position),
            ("speed", speed),
            ("acceleration", acceleration),
            ("deceleration", deceleration),
            ("end speed", end_speed),
        ] {
            if !value.is_finite() {
                return Err(MotionError::invalid(format!("{} is not finite ({})", label, value)));
            }
        }
        if speed <= 0.0 || acceleration <= 0.0 || deceleration <= 0.0 {
            return Err(MotionError::invalid(format!(
                "speed, acceleration and deceleration must be positive (v={}, a={}, d={})",
                speed, acceleration, deceleration
            )));
        }
        if acceleration > limits.max_acceleration * (1.0 + 1e-6) {
            return Err(MotionError::invalid(format!(
                "required acceleration {:.6} exceeds the maximum {:.6}",
                acceleration, limits.max_acceleration
            )));
        }
        if deceleration > limits.max_deceleration * (1.0 + 1e-6) {
            return Err(MotionError::invalid(format!(
                "required deceleration {:.6} exceeds the maximum {:.6}",
                deceleration, limits.max_deceleration
            )));
        }
        if end_speed < 0.0 || end_speed > speed * (1.0 + 1e-9) {
            return Err(MotionError::invalid(format!(
                "end speed {} must lie within [0, {}]",
                end_speed, speed
            )));
        }

        let delta = target_position - start.position;
        let direction = if delta < 0.0 { -1.0 } else { 1.0 };
        let mut info = Self {
            limits: limits.clone(),
            start,
            target: TargetState {
                position: target_position,
                direction,
                distance: delta.abs(),
                speed,
                acceleration,
                deceleration,
                end_speed: end_speed.min(speed),
            },
            parameters: KinematicParameters::default(),
        };
        info.calculate()?;
        Ok(info)
    }

    /// An axis that holds `position` for `duration` seconds.
    pub fn hold(limits: &PositionerLimits, position: f64, duration: f64) -> Self {
        Self {
            limits: limits.clone(),
            start: KinematicState::at_rest(position),
            target: TargetState {
                position,
                direction: 1.0,
                distance: 0.0,
                speed: limits.default_speed,
                acceleration: limits.max_acceleration,
                deceleration: limits.max_deceleration,
                end_speed: 0.0,
            },
            parameters: KinematicParameters {
                total_time: duration.max(0.0),
                constant_speed_start_time: 0.0,
                constant_speed_end_time: duration.max(0.0),
                constant_speed_start_position: position,
                constant_speed_end_position: position,
                ..KinematicParameters::default()
            },
        }
    }

    /// A profile covering `start -> target` in exactly `duration` seconds,
    /// starting and ending at rest. Accelerations are scaled up when the
    /// requested duration is shorter than the fastest triangular profile.
    pub fn fitted(start: f64, target: f64, duration: f64, acceleration: f64, deceleration: f64) -> MotionResult<Self> {
        let distance = (target - start).abs();
        let limits = PositionerLimits {
            max_speed: f64::MAX,
            max_acceleration: f64::MAX,
            max_deceleration: f64::MAX,
            default_speed: 1.0,
            min_position: None,
            max_position: None,
        };
        if distance <= EPSILON || duration <= EPSILON {
            return Ok(Self::hold(&limits, target, duration));
        }
        let k = (acceleration + deceleration) / (2.0 * acceleration * deceleration);
        let minimum = 2.0 * (k * distance).sqrt();
        let (a, d, speed) = if duration < minimum {
            let scale = (minimum / duration).powi(2);
            let (a, d) = (acceleration * scale, deceleration * scale);
            (a, d, fit_cruise_speed(distance, duration, a, d))
        } else {
            (acceleration, deceleration, fit_cruise_speed(distance, duration, acceleration, deceleration))
        };
        Self::new(&limits, KinematicState::at_rest(start), target, speed.max(EPSILON), a, d)
    }

    /// Solve the phase layout of the profile.
    pub fn calculate(&mut self) -> MotionResult<()> {
        let a = self.target.acceleration;
        let d = self.target.deceleration;
        let v = self.target.speed;
        let v1 = self.target.end_speed;
        let dx = self.target.distance;
        let v0 = (self.start.speed * self.target.direction).clamp(0.0, v);

        let distance_to_accelerate = (v * v - v0 * v0) / (2.0 * a);
        let distance_to_decelerate = (v * v - v1 * v1) / (2.0 * d);
        let triangular = distance_to_accelerate + distance_to_decelerate > dx + EPSILON;

        let peak = if triangular {
            ((2.0 * a * d * dx + d * v0 * v0 + a * v1 * v1) / (a + d)).max(0.0).sqrt().min(v)
        } else {
            v
        };
        if peak + 1e-6 < v0.max(v1) {
            return Err(MotionError::invalid(format!(
                "distance {:.6} is too short to change speed from {:.6} to {:.6}",
                dx, v0, v1
            )));
        }
        let peak = peak.max(v0).max(v1);

        let accel_distance = (peak * peak - v0 * v0) / (2.0 * a);
        let decel_distance = (peak * peak - v1 * v1) / (2.0 * d);
        let accel_time = (peak - v0) / a;
        let decel_time = (peak - v1) / d;
        let cruise_distance = (dx - accel_distance - decel_distance).max(0.0);
        let cruise_time = if peak > EPSILON { cruise_distance / peak } else { 0.0 };

        let origin = self.start.position;
        let dir = self.target.direction;
        self.parameters = KinematicParameters {
            total_time: accel_time + cruise_time + decel_time,
            constant_speed_start_time: accel_time,
            constant_speed_end_time: accel_time + cruise_time,
            constant_speed_start_position: origin + dir * accel_distance,
            constant_speed_end_position: origin + dir * (accel_distance + cruise_distance),
            peak_speed: peak,
            start_speed: v0,
            distance_to_accelerate,
            distance_to_decelerate,
            triangular,
        };
        Ok(())
    }

    pub fn total_time(&self) -> f64 {
        self.parameters.total_time
    }

    pub fn acceleration_time(&self) -> f64 {
        self.parameters.constant_speed_start_time
    }

    pub fn deceleration_time(&self) -> f64 {
        self.parameters.total_time - self.parameters.constant_speed_end_time
    }

    pub fn constant_speed_duration(&self) -> f64 {
        self.parameters.constant_speed_end_time - self.parameters.constant_speed_start_time
    }

    fn travelled_at(&self, t: f64) -> f64 {
        let p = &self.parameters;
        let v0 = p.start_speed;
        let vp = p.peak_speed;
        let a = self.target.acceleration;
        let d = self.target.deceleration;
        let t = t.clamp(0.0, p.total_time);

        let ta = p.constant_speed_start_time;
        let accel_distance = v0 * ta + 0.5 * a * ta * ta;
        if t <= ta {
            return v0 * t + 0.5 * a * t * t;
        }
        if t <= p.constant_speed_end_time {
            return accel_distance + vp * (t - ta);
        }
        let cruise = vp * (p.constant_speed_end_time - ta);
        let tau = t - p.constant_speed_end_time;
        (accel_distance + cruise + vp * tau - 0.5 * d * tau * tau).min(self.target.distance)
    }

    /// Position reached `t` seconds after the move started.
    pub fn position_at(&self, t: f64) -> f64 {
        if self.target.distance <= EPSILON {
            return self.target.position;
        }
        self.start.position + self.target.direction * self.travelled_at(t)
    }

    /// Speed magnitude `t` seconds after the move started.
    pub fn speed_at(&self, t: f64) -> f64 {
        let p = &self.parameters;
        if t <= 0.0 {
            return p.start_speed;
        }
        if t <= p.constant_speed_start_time {
            return p.start_speed + self.target.acceleration * t;
        }
        if t <= p.constant_speed_end_time {
            return p.peak_speed;
        }
        if t >= p.total_time {
            return self.target.end_speed;
        }
        p.peak_speed - self.target.deceleration * (t - p.constant_speed_end_time)
    }

    /// Time at which the axis passes `position`, solved per phase.
    pub fn time_to_reach(&self, position: f64) -> MotionResult<f64> {
        if !position.is_finite() {
            return Err(MotionError::invalid("wait position is not finite"));
        }
        let s = (position - self.start.position) * self.target.direction;
        let tolerance = 1e-9 * self.target.distance.max(1.0);
        if s < -tolerance || s > self.target.distance + tolerance {
            return Err(MotionError::invalid(format!(
                "position {} is not on the path from {} to {}",
                position, self.start.position, self.target.position
            )));
        }
        if self.target.distance <= EPSILON {
            return Ok(0.0);
        }
        let s = s.clamp(0.0, self.target.distance);
        let p = &self.parameters;
        let v0 = p.start_speed;
        let vp = p.peak_speed;
        let a = self.target.acceleration;
        let d = self.target.deceleration;
        let ta = p.constant_speed_start_time;
        let accel_distance = v0 * ta + 0.5 * a * ta * ta;
        let cruise_time = p.constant_speed_end_time - ta;
        let cruise_distance = vp * cruise_time;

        if s <= accel_distance {
            let t = (-v0 + (v0 * v0 + 2.0 * a * s).max(0.0).sqrt()) / a;
            return Ok(t.min(ta));
        }
        if s <= accel_distance + cruise_distance && vp > EPSILON {
            return Ok(ta + (s - accel_distance) / vp);
        }
        let rest = s - accel_distance - cruise_distance;
        let tau = (vp - (vp * vp - 2.0 * d * rest).max(0.0).sqrt()) / d;
        Ok((p.constant_speed_end_time + tau).min(p.total_time))
    }
}

/// Cruise speed that covers `distance` in `duration` seconds with a symmetric
/// rest-to-rest trapezoid. Falls back to the triangular peak when the duration
/// is at or below the minimum.
pub fn fit_cruise_speed(distance: f64, duration: f64, acceleration: f64, deceleration: f64) -> f64 {
    let k = (acceleration + deceleration) / (2.0 * acceleration * deceleration);
    let discriminant = duration * duration - 4.0 * k * distance;
    if discriminant <= 0.0 {
        return (distance / k).sqrt();
    }
    (duration - discriminant.sqrt()) / (2.0 * k)
}
