// src/planner/arc.rs - Arc discretization into synchronized chords
use std::f64::consts::TAU;

use crate::device::DeviceName;
use crate::error::{MotionError, MotionResult};
use crate::planner::profile::EPSILON;

/// A circular arc in the plane of two axes.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcRequest {
    pub devices: [DeviceName; 2],
    pub radius: f64,
    pub center: (f64, f64),
    /// Radians
    pub start_angle: f64,
    pub end_angle: f64,
    pub ccw: bool,
    /// Tool-space speed along the arc
    pub speed: f64,
    /// Maximum chord sagitta
    pub accuracy: f64,
    /// Maximum time spent on one chord, seconds
    pub time_accuracy: f64,
}

/// Chord layout of an arc.
#[derive(Debug, Clone, PartialEq)]
pub struct ArcDiscretization {
    /// Signed sweep, positive for counter-clockwise
    pub sweep: f64,
    pub segment_angle: f64,
    pub number_of_segments: usize,
    /// `number_of_segments + 1` points including both ends
    pub points: Vec<(f64, f64)>,
}

impl ArcRequest {
    pub fn validate(&self) -> MotionResult<()> {
        if self.devices[0] == self.devices[1] {
            return Err(MotionError::invalid("an arc needs two distinct axes"));
        }
        for (label, value) in [
            ("radius", self.radius),
            ("center x", self.center.0),
            ("center y", self.center.1),
            ("start angle", self.start_angle),
            ("end angle", self.end_angle),
            ("speed", self.speed),
            ("accuracy", self.accuracy),
            ("time accuracy", self.time_accuracy),
        ] {
            if !value.is_finite() {
                return Err(MotionError::invalid(format!("arc {} is not finite", label)));
            }
        }
        if self.radius <= EPSILON {
            return Err(MotionError::invalid(format!("arc radius must be positive, got {}", self.radius)));
        }
        if self.speed <= 0.0 || self.accuracy <= 0.0 || self.time_accuracy < 0.0 {
            return Err(MotionError::invalid("arc speed and accuracy must be positive"));
        }
        Ok(())
    }

    /// Signed angle travelled from start to end in the requested direction.
    pub fn sweep(&self) -> f64 {
        let raw = self.end_angle - self.start_angle;
        if self.ccw {
            let s = raw.rem_euclid(TAU);
            if s <= EPSILON && raw.abs() > EPSILON { TAU } else { s }
        } else {
            let s = -(-raw).rem_euclid(TAU);
            if s >= -EPSILON && raw.abs() > EPSILON { -TAU } else { s }
        }
    }

    pub fn point_at(&self, angle: f64) -> (f64, f64) {
        (
            self.center.0 + self.radius * angle.cos(),
            self.center.1 + self.radius * angle.sin(),
        )
    }

    /// Unit tangent in the direction of travel at `angle`.
    pub fn tangent_at(&self, angle: f64) -> (f64, f64) {
        let sign = if self.ccw { 1.0 } else { -1.0 };
        (-sign * angle.sin(), sign * angle.cos())
    }

    /// Split the arc into equal chords.
    ///
    /// The chord angle is the larger of the sagitta bound
    /// `2·acos(1 − accuracy/r)` and the time bound `ω·time_accuracy`.
    pub fn discretize(&self) -> MotionResult<ArcDiscretization> {
        self.validate()?;
        let sweep = self.sweep();
        if sweep.abs() <= EPSILON {
            return Err(MotionError::invalid("arc sweep is zero"));
        }
        let accuracy_angle = 2.0 * (1.0 - self.accuracy / self.radius).clamp(-1.0, 1.0).acos();
        let omega = self.speed / self.radius;
        let time_angle = omega * self.time_accuracy;
        let chord_angle = accuracy_angle.max(time_angle);
        if chord_angle <= EPSILON {
            return Err(MotionError::invalid("arc accuracy yields a zero chord angle"));
        }
        let segments = (sweep.abs() / chord_angle).ceil();
        if !segments.is_finite() || segments < 2.0 {
            return Err(MotionError::invalid(format!(
                "arc resolves to {} segment(s), at least 2 are required",
                segments
            )));
        }
        let number_of_segments = segments as usize;
        let segment_angle = sweep / number_of_segments as f64;
        let points = (0..=number_of_segments)
            .map(|i| self.point_at(self.start_angle + segment_angle * i as f64))
            .collect();
        tracing::debug!(
            sweep,
            accuracy_angle,
            time_angle,
            number_of_segments,
            "Discretized arc"
        );
        Ok(ArcDiscretization {
            sweep,
            segment_angle,
            number_of_segments,
            points,
        })
    }
}

impl ArcDiscretization {
    /// Velocity vector at every chord joint of `arc`: along the tangent, with
    /// `speed` between chords and the given speeds at the two ends.
    pub fn joint_velocities(&self, arc: &ArcRequest, start_speed: f64, speed: f64, end_speed: f64) -> Vec<(f64, f64)> {
        let n = self.number_of_segments;
        (0..=n)
            .map(|i| {
                let magnitude = match i {
                    0 => start_speed,
                    i if i == n => end_speed,
                    _ => speed,
                };
                let tangent = arc.tangent_at(arc.start_angle + self.segment_angle * i as f64);
                calculate_tangent_endpoint((0.0, 0.0), tangent, magnitude)
            })
            .collect()
    }
}

/// Point `distance` along the tangent through `point`. Negative distances
/// step backwards, which is how a lead-in start is placed before the arc.
pub fn calculate_tangent_endpoint(point: (f64, f64), tangent: (f64, f64), distance: f64) -> (f64, f64) {
    (point.0 + tangent.0 * distance, point.1 + tangent.1 * distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn quarter() -> ArcRequest {
        ArcRequest {
            devices: ['x', 'y'],
            radius: 50.0,
            center: (0.0, 0.0),
            start_angle: 0.0,
            end_angle: FRAC_PI_2,
            ccw: true,
            speed: 100.0,
            accuracy: 1.0,
            time_accuracy: 0.03,
        }
    }

    #[test]
    fn quarter_circle_chords() {
        let d = quarter().discretize().unwrap();
        assert_eq!(d.number_of_segments, 4);
        assert_eq!(d.points.len(), 5);
        let last = d.points[4];
        assert!(last.0.abs() < 1e-9);
        assert!((last.1 - 50.0).abs() < 1e-9);
        for p in &d.points {
            assert!(((p.0 * p.0 + p.1 * p.1).sqrt() - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn clockwise_sweep_is_negative() {
        let mut arc = quarter();
        arc.ccw = false;
        assert!((arc.sweep() + 3.0 * FRAC_PI_2).abs() < 1e-12);
        arc.end_angle = -PI;
        assert!((arc.sweep() + PI).abs() < 1e-12);
    }

    #[test]
    fn coarse_accuracy_fails_with_one_segment() {
        let mut arc = quarter();
        arc.accuracy = 49.0;
        assert!(arc.discretize().is_err());
    }

    #[test]
    fn joint_velocities_follow_the_tangent() {
        let arc = quarter();
        let layout = arc.discretize().unwrap();
        let joints = layout.joint_velocities(&arc, 0.0, 10.0, 0.0);
        assert_eq!(joints.len(), layout.number_of_segments + 1);
        assert_eq!(joints[0], (0.0, 0.0));
        assert_eq!(joints[layout.number_of_segments], (0.0, 0.0));
        for (point, velocity) in layout.points.iter().zip(&joints).skip(1).take(layout.number_of_segments - 1) {
            let radial = (point.0 - arc.center.0, point.1 - arc.center.1);
            assert!((radial.0 * velocity.0 + radial.1 * velocity.1).abs() < 1e-9);
            assert!((velocity.0.hypot(velocity.1) - 10.0).abs() < 1e-9);
            // Counter-clockwise: radial x velocity points out of the plane
            assert!(radial.0 * velocity.1 - radial.1 * velocity.0 > 0.0);
        }
    }

    #[test]
    fn tangent_points_forward() {
        let arc = quarter();
        let t = arc.tangent_at(0.0);
        assert!((t.0).abs() < 1e-12 && (t.1 - 1.0).abs() < 1e-12);
        let before = calculate_tangent_endpoint(arc.point_at(0.0), t, -2.0);
        assert!((before.0 - 50.0).abs() < 1e-12 && (before.1 + 2.0).abs() < 1e-12);
    }
}
