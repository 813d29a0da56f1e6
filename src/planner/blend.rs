// src/planner/blend.rs - Position-velocity-time paths for blended axis motion
use serde::Serialize;

use crate::command::MoveTarget;
use crate::planner::lead::LeadSegment;
use crate::planner::profile::EPSILON;

/// Signed axis velocity when a move starts and when it reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct JointVelocities {
    pub start: f64,
    pub end: f64,
}

/// Cubic Hermite segment: exact positions and velocities at both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PvtSegment {
    pub start: f64,
    pub end: f64,
    pub start_velocity: f64,
    pub end_velocity: f64,
    pub duration: f64,
}

impl PvtSegment {
    pub fn new(start: f64, start_velocity: f64, end: f64, end_velocity: f64, duration: f64) -> Self {
        Self {
            start,
            end,
            start_velocity,
            end_velocity,
            duration,
        }
    }

    pub fn position_at(&self, t: f64) -> f64 {
        let h = self.duration;
        if h <= EPSILON {
            return self.end;
        }
        let s = (t / h).clamp(0.0, 1.0);
        let (s2, s3) = (s * s, s * s * s);
        (2.0 * s3 - 3.0 * s2 + 1.0) * self.start
            + (s3 - 2.0 * s2 + s) * h * self.start_velocity
            + (-2.0 * s3 + 3.0 * s2) * self.end
            + (s3 - s2) * h * self.end_velocity
    }

    pub fn velocity_at(&self, t: f64) -> f64 {
        let h = self.duration;
        if h <= EPSILON {
            return self.end_velocity;
        }
        let s = (t / h).clamp(0.0, 1.0);
        let s2 = s * s;
        ((6.0 * s2 - 6.0 * s) * self.start
            + (3.0 * s2 - 4.0 * s + 1.0) * h * self.start_velocity
            + (-6.0 * s2 + 6.0 * s) * self.end
            + (3.0 * s2 - 2.0 * s) * h * self.end_velocity)
            / h
    }
}

/// Segments played back to back.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendedPath {
    segments: Vec<PvtSegment>,
}

impl BlendedPath {
    /// Path an axis at `from` follows to honour the lead phases or joint
    /// velocities of `target`. `None` when the target carries neither, in
    /// which case a rest-to-rest profile applies.
    ///
    /// Lead ramps are symmetric, so an axis covering a ramp of length `L` in
    /// `t` seconds leaves it at `2L/t`; the nominal part is played between
    /// those junction speeds.
    pub fn for_target(from: f64, target: &MoveTarget) -> Option<Self> {
        let total = target.allocated_time;
        if total <= EPSILON {
            return None;
        }
        if let Some(lead) = target.lead.filter(|l| !l.is_empty()) {
            let mut segments = Vec::with_capacity(3);
            let mut position = from;
            let mut velocity = 0.0;
            if let Some(lead_in) = lead.lead_in {
                velocity = ramp_velocity(&lead_in);
                segments.push(PvtSegment::new(
                    position,
                    0.0,
                    lead_in.end_position,
                    velocity,
                    lead_in.allocated_time,
                ));
                position = lead_in.end_position;
            }
            let (nominal_end, end_velocity) = match lead.lead_out {
                Some(lead_out) => (lead_out.start_position, ramp_velocity(&lead_out)),
                None => (target.position, 0.0),
            };
            let nominal_time = total - lead.lead_in_time() - lead.lead_out_time();
            segments.push(PvtSegment::new(position, velocity, nominal_end, end_velocity, nominal_time));
            if let Some(lead_out) = lead.lead_out {
                segments.push(PvtSegment::new(
                    nominal_end,
                    end_velocity,
                    target.position,
                    0.0,
                    lead_out.allocated_time,
                ));
            }
            segments.retain(|s| s.duration > EPSILON);
            return (!segments.is_empty()).then_some(Self { segments });
        }
        let joints = target.velocity?;
        Some(Self {
            segments: vec![PvtSegment::new(from, joints.start, target.position, joints.end, total)],
        })
    }

    pub fn segments(&self) -> &[PvtSegment] {
        &self.segments
    }

    pub fn total_time(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn end_position(&self) -> f64 {
        self.segments.last().map_or(0.0, |s| s.end)
    }

    fn locate(&self, t: f64) -> Option<(&PvtSegment, f64)> {
        let mut offset = 0.0;
        for segment in &self.segments {
            if t < offset + segment.duration {
                return Some((segment, t - offset));
            }
            offset += segment.duration;
        }
        self.segments.last().map(|s| (s, s.duration))
    }

    pub fn position_at(&self, t: f64) -> f64 {
        self.locate(t.max(0.0)).map_or(0.0, |(s, local)| s.position_at(local))
    }

    pub fn velocity_at(&self, t: f64) -> f64 {
        self.locate(t.max(0.0)).map_or(0.0, |(s, local)| s.velocity_at(local))
    }
}

fn ramp_velocity(segment: &LeadSegment) -> f64 {
    if segment.allocated_time <= EPSILON {
        return 0.0;
    }
    2.0 * (segment.end_position - segment.start_position) / segment.allocated_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::lead::{self, LeadInfo};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn hermite_meets_both_ends() {
        let segment = PvtSegment::new(1.0, 2.0, 4.0, -1.0, 1.5);
        assert!(close(segment.position_at(0.0), 1.0));
        assert!(close(segment.position_at(1.5), 4.0));
        assert!(close(segment.velocity_at(0.0), 2.0));
        assert!(close(segment.velocity_at(1.5), -1.0));
    }

    #[test]
    fn constant_velocity_is_linear() {
        let segment = PvtSegment::new(0.0, 10.0, 20.0, 10.0, 2.0);
        for i in 0..=20 {
            let t = i as f64 * 0.1;
            assert!(close(segment.position_at(t), 10.0 * t));
            assert!(close(segment.velocity_at(t), 10.0));
        }
    }

    #[test]
    fn plain_target_has_no_path() {
        assert!(BlendedPath::for_target(0.0, &MoveTarget::new(5.0, 1.0)).is_none());
        let target = MoveTarget::new(5.0, 0.0).with_velocities(1.0, 1.0);
        assert!(BlendedPath::for_target(0.0, &target).is_none());
    }

    #[test]
    fn joint_velocities_are_honoured() {
        let target = MoveTarget::new(3.0, 0.5).with_velocities(4.0, 8.0);
        let path = BlendedPath::for_target(1.0, &target).unwrap();
        assert!(close(path.velocity_at(0.0), 4.0));
        assert!(close(path.velocity_at(0.5), 8.0));
        assert!(close(path.end_position(), 3.0));
    }

    #[test]
    fn leads_frame_a_constant_velocity_window() {
        let ramp = lead::ramp(20.0, 200.0, 0.02);
        let lead_in = lead::lead_in(0.0, 1.0, &ramp);
        let lead_out = lead::lead_out(10.0, 1.0, &ramp);
        let nominal = 0.5;
        let target = MoveTarget {
            position: lead_out.end_position,
            allocated_time: ramp.time + nominal + ramp.time,
            lead: Some(LeadInfo {
                lead_in: Some(lead_in),
                lead_out: Some(lead_out),
            }),
            velocity: None,
        };
        let path = BlendedPath::for_target(lead_in.start_position, &target).unwrap();
        assert_eq!(path.segments().len(), 3);
        assert!(close(path.total_time(), target.allocated_time));
        assert!(close(path.position_at(ramp.time), 0.0));
        assert!(close(path.position_at(ramp.time + nominal), 10.0));
        for i in 0..=10 {
            let t = ramp.time + nominal * i as f64 / 10.0;
            assert!(close(path.velocity_at(t), 20.0), "speed {} at {}", path.velocity_at(t), t);
        }
        assert!(close(path.velocity_at(target.allocated_time), 0.0));
        assert!(close(path.end_position(), lead_out.end_position));
    }
}
