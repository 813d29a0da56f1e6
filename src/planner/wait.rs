// src/planner/wait.rs - Wait-until resolution by profile inversion
use serde::Serialize;

use crate::device::DeviceName;
use crate::error::{MotionError, MotionResult};
use crate::planner::line::AxisMove;
use crate::planner::profile::EPSILON;

/// When a blocking move call should hand control back to the script.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitUntil {
    /// Seconds after the move starts
    Time(f64),
    /// As soon as `device` passes `position`
    Position { device: DeviceName, position: f64 },
}

/// A wait condition turned into a time plus the positions at that time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedWait {
    pub time: f64,
    pub positions: Vec<(DeviceName, f64)>,
}

/// Resolve `wait` against the planned axis profiles. `offset` is the time
/// spent before these profiles start (a lead-in).
pub fn resolve_wait(wait: WaitUntil, axes: &[AxisMove], offset: f64) -> MotionResult<ResolvedWait> {
    let total = axes.iter().map(|a| a.profile.total_time()).fold(0.0, f64::max);
    let local = match wait {
        WaitUntil::Time(t) => {
            if !t.is_finite() || t < 0.0 {
                return Err(MotionError::invalid(format!("wait time must be non-negative, got {}", t)));
            }
            (t - offset).clamp(0.0, total)
        }
        WaitUntil::Position { device, position } => {
            let axis = axes
                .iter()
                .find(|a| a.device == device)
                .ok_or_else(|| MotionError::invalid(format!("device '{}' is not part of this move", device)))?;
            axis.profile.time_to_reach(position)?
        }
    };
    Ok(ResolvedWait {
        time: local + offset,
        positions: axes
            .iter()
            .map(|a| (a.device, a.profile.position_at(local)))
            .collect(),
    })
}

/// Resolve `wait` over a chain of pieces, each given as its start offset and
/// its axis profiles. A position wait stops at the first piece whose travel
/// of that device covers the position.
pub fn resolve_wait_across(wait: WaitUntil, pieces: &[(f64, Vec<AxisMove>)]) -> MotionResult<ResolvedWait> {
    match wait {
        WaitUntil::Time(t) => {
            let (offset, axes) = pieces
                .iter()
                .rev()
                .find(|(offset, _)| t >= *offset)
                .or_else(|| pieces.first())
                .ok_or_else(|| MotionError::invalid("nothing to wait on"))?;
            resolve_wait(wait, axes, *offset)
        }
        WaitUntil::Position { device, position } => {
            for (offset, axes) in pieces {
                let Some(axis) = axes.iter().find(|a| a.device == device) else { continue };
                let from = axis.profile.start.position;
                let to = axis.profile.target.position;
                if position >= from.min(to) - EPSILON && position <= from.max(to) + EPSILON {
                    return resolve_wait(wait, axes, *offset);
                }
            }
            Err(MotionError::invalid(format!(
                "device '{}' never reaches {} during this move",
                device, position
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PositionerLimits;
    use crate::planner::profile::{KinematicState, PositionerMovementInformation};

    fn axis_move(device: DeviceName, target: f64) -> AxisMove {
        axis_move_from(device, 0.0, target)
    }

    fn axis_move_from(device: DeviceName, from: f64, target: f64) -> AxisMove {
        let limits = PositionerLimits {
            max_speed: 10.0,
            max_acceleration: 100.0,
            max_deceleration: 100.0,
            default_speed: 10.0,
            min_position: None,
            max_position: None,
        };
        AxisMove {
            device,
            movement_ratio: Some(1.0),
            profile: PositionerMovementInformation::new(&limits, KinematicState::at_rest(from), target, 10.0, 100.0, 100.0)
                .unwrap(),
        }
    }

    #[test]
    fn position_wait_returns_time_and_positions() {
        let axes = [axis_move('x', 10.0)];
        let wait = resolve_wait(WaitUntil::Position { device: 'x', position: 5.0 }, &axes, 0.0).unwrap();
        // 0.1s ramp covers 0.5, then cruise at 10
        assert!((wait.time - 0.55).abs() < 1e-9);
        assert!((wait.positions[0].1 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn time_wait_accounts_for_lead_offset() {
        let axes = [axis_move('x', 10.0)];
        let wait = resolve_wait(WaitUntil::Time(0.65), &axes, 0.1).unwrap();
        assert!((wait.positions[0].1 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let axes = [axis_move('x', 10.0)];
        assert!(resolve_wait(WaitUntil::Position { device: 'q', position: 1.0 }, &axes, 0.0).is_err());
    }

    #[test]
    fn position_wait_picks_the_piece_that_covers_it() {
        let first = axis_move('x', 10.0);
        let second_offset = first.profile.total_time();
        let pieces = vec![
            (0.0, vec![first]),
            (second_offset, vec![axis_move_from('x', 10.0, 20.0)]),
        ];
        let wait = resolve_wait_across(WaitUntil::Position { device: 'x', position: 15.0 }, &pieces).unwrap();
        assert!((wait.time - (second_offset + 0.55)).abs() < 1e-9);
        assert!((wait.positions[0].1 - 15.0).abs() < 1e-9);

        let missing = resolve_wait_across(WaitUntil::Position { device: 'x', position: 25.0 }, &pieces);
        assert!(missing.is_err());
    }
}
