// src/planner/lead.rs - Jerk-limited lead-in / lead-out ramps
use serde::Serialize;

/// One ramp extension of an axis move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LeadSegment {
    pub start_position: f64,
    pub end_position: f64,
    /// Seconds
    pub allocated_time: f64,
}

/// Optional ramp-up before and ramp-down after the nominal move of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LeadInfo {
    pub lead_in: Option<LeadSegment>,
    pub lead_out: Option<LeadSegment>,
}

impl LeadInfo {
    pub fn is_empty(&self) -> bool {
        self.lead_in.is_none() && self.lead_out.is_none()
    }

    pub fn lead_in_time(&self) -> f64 {
        self.lead_in.map_or(0.0, |s| s.allocated_time)
    }

    pub fn lead_out_time(&self) -> f64 {
        self.lead_out.map_or(0.0, |s| s.allocated_time)
    }
}

/// Distance and time to ramp between rest and a cruise speed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LeadRamp {
    pub distance: f64,
    pub time: f64,
    /// Distance covered while acceleration itself ramps up and down
    pub jerk_distance: f64,
    /// Distance covered at full acceleration
    pub constant_acceleration_distance: f64,
}

/// Closed-form ramp from rest to `speed`.
///
/// Acceleration rises linearly to `acceleration` over `jerk_time`, holds, and
/// falls back to zero over another `jerk_time`. When the speed is reached
/// before full acceleration can be held, the ramp is two symmetric jerk phases
/// with a lower peak acceleration.
pub fn ramp(speed: f64, acceleration: f64, jerk_time: f64) -> LeadRamp {
    if speed <= 0.0 || acceleration <= 0.0 {
        return LeadRamp::default();
    }
    if jerk_time <= 0.0 {
        let distance = speed * speed / (2.0 * acceleration);
        return LeadRamp {
            distance,
            time: speed / acceleration,
            jerk_distance: 0.0,
            constant_acceleration_distance: distance,
        };
    }

    let ramp_time = speed / acceleration;
    if ramp_time >= jerk_time {
        let tj = jerk_time;
        let a = acceleration;
        let v1 = a * tj / 2.0;
        let s1 = a * tj * tj / 6.0;
        let tc = ramp_time - tj;
        let s2 = v1 * tc + a * tc * tc / 2.0;
        let v2 = speed - a * tj / 2.0;
        let s3 = v2 * tj + a * tj * tj / 3.0;
        LeadRamp {
            distance: s1 + s2 + s3,
            time: tj + ramp_time,
            jerk_distance: s1 + s3,
            constant_acceleration_distance: s2,
        }
    } else {
        let jerk = acceleration / jerk_time;
        let tau = (speed / jerk).sqrt();
        let distance = speed * tau;
        LeadRamp {
            distance,
            time: 2.0 * tau,
            jerk_distance: distance,
            constant_acceleration_distance: 0.0,
        }
    }
}

/// Lead-in ending at `start` for an axis travelling in `direction`.
pub fn lead_in(start: f64, direction: f64, ramp: &LeadRamp) -> LeadSegment {
    LeadSegment {
        start_position: start - direction * ramp.distance,
        end_position: start,
        allocated_time: ramp.time,
    }
}

/// Lead-out starting at `end` for an axis travelling in `direction`.
pub fn lead_out(end: f64, direction: f64, ramp: &LeadRamp) -> LeadSegment {
    LeadSegment {
        start_position: end,
        end_position: end + direction * ramp.distance,
        allocated_time: ramp.time,
    }
}
