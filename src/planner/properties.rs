// src/planner/properties.rs - Named per-move properties exposed to scripts
use serde_json::Value;

use crate::error::{MotionError, MotionResult};
use crate::planner::wait::WaitUntil;

/// Options a script can attach to a Jump, Line or Arc.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveProperties {
    /// Open the shutter during the constant-speed part of the move
    pub shutter: bool,
    /// Position tolerance; also the arc sagitta bound
    pub accuracy: f64,
    /// Longest chord duration on arcs, seconds
    pub time_accuracy: f64,
    /// Tool-space speed. `None` uses the device defaults.
    pub speed: Option<f64>,
    pub lead_in: bool,
    pub lead_out: bool,
    /// Return once the last segment is taken instead of when motion ends
    pub blending: bool,
    pub wait_until_time: Option<f64>,
    pub wait_until_position: Option<(char, f64)>,
}

impl MoveProperties {
    pub fn new(accuracy: f64, time_accuracy: f64) -> Self {
        Self {
            shutter: false,
            accuracy,
            time_accuracy,
            speed: None,
            lead_in: false,
            lead_out: false,
            blending: false,
            wait_until_time: None,
            wait_until_position: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_shutter(mut self, shutter: bool) -> Self {
        self.shutter = shutter;
        self
    }

    pub fn with_leads(mut self, lead_in: bool, lead_out: bool) -> Self {
        self.lead_in = lead_in;
        self.lead_out = lead_out;
        self
    }

    pub fn with_blending(mut self, blending: bool) -> Self {
        self.blending = blending;
        self
    }

    /// The wait condition, if any. A position wait wins over a time wait.
    pub fn wait_until(&self) -> Option<WaitUntil> {
        match (self.wait_until_position, self.wait_until_time) {
            (Some((device, position)), _) => Some(WaitUntil::Position { device, position }),
            (None, Some(t)) => Some(WaitUntil::Time(t)),
            (None, None) => None,
        }
    }

    /// Set a property by its script name. `null` resets nullable properties.
    pub fn set(&mut self, name: &str, value: &Value) -> MotionResult<()> {
        match name.to_ascii_lowercase().as_str() {
            "shutter" => self.shutter = boolean(name, value)?,
            "accuracy" => self.accuracy = positive(name, value)?,
            "timeaccuracy" | "time_accuracy" => self.time_accuracy = positive(name, value)?,
            "speed" => self.speed = nullable(name, value, positive)?,
            "leadin" | "lead_in" => self.lead_in = boolean(name, value)?,
            "leadout" | "lead_out" => self.lead_out = boolean(name, value)?,
            "blending" => self.blending = boolean(name, value)?,
            "waituntiltime" | "wait_until_time" => self.wait_until_time = nullable(name, value, non_negative)?,
            "waituntilposition" | "wait_until_position" => {
                self.wait_until_position = if value.is_null() {
                    None
                } else {
                    Some(device_position(name, value)?)
                }
            }
            _ => return Err(MotionError::invalid(format!("unknown move property '{}'", name))),
        }
        Ok(())
    }
}

fn boolean(name: &str, value: &Value) -> MotionResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| MotionError::invalid(format!("property '{}' expects true or false, got {}", name, value)))
}

fn number(name: &str, value: &Value) -> MotionResult<f64> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| MotionError::invalid(format!("property '{}' expects a number, got {}", name, value)))
}

fn positive(name: &str, value: &Value) -> MotionResult<f64> {
    let v = number(name, value)?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(MotionError::invalid(format!("property '{}' must be positive, got {}", name, v)))
    }
}

fn non_negative(name: &str, value: &Value) -> MotionResult<f64> {
    let v = number(name, value)?;
    if v >= 0.0 {
        Ok(v)
    } else {
        Err(MotionError::invalid(format!("property '{}' must not be negative, got {}", name, v)))
    }
}

fn nullable(
    name: &str,
    value: &Value,
    parse: fn(&str, &Value) -> MotionResult<f64>,
) -> MotionResult<Option<f64>> {
    if value.is_null() { Ok(None) } else { parse(name, value).map(Some) }
}

// Accepts {"device": "x", "position": 1.5} or ["x", 1.5]
fn device_position(name: &str, value: &Value) -> MotionResult<(char, f64)> {
    let (device, position) = match value {
        Value::Object(map) => (map.get("device"), map.get("position")),
        Value::Array(items) if items.len() == 2 => (items.first(), items.get(1)),
        _ => (None, None),
    };
    let device = device
        .and_then(Value::as_str)
        .and_then(|s| {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        })
        .ok_or_else(|| MotionError::invalid(format!("property '{}' needs a single-character device", name)))?;
    let position = position
        .ok_or_else(|| MotionError::invalid(format!("property '{}' needs a position", name)))
        .and_then(|p| number(name, p))?;
    Ok((device, position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let p = MoveProperties::new(0.001, 0.03);
        assert!(!p.shutter && !p.lead_in && !p.lead_out && !p.blending);
        assert_eq!(p.speed, None);
        assert_eq!(p.wait_until(), None);
    }

    #[test]
    fn script_names_are_case_insensitive() {
        let mut p = MoveProperties::new(0.001, 0.03);
        p.set("Shutter", &json!(true)).unwrap();
        p.set("Speed", &json!(25.0)).unwrap();
        p.set("LeadIn", &json!(true)).unwrap();
        p.set("WaitUntilTime", &json!(0.5)).unwrap();
        assert!(p.shutter && p.lead_in);
        assert_eq!(p.speed, Some(25.0));
        assert_eq!(p.wait_until(), Some(WaitUntil::Time(0.5)));
        p.set("Speed", &Value::Null).unwrap();
        assert_eq!(p.speed, None);
    }

    #[test]
    fn position_wait_takes_precedence() {
        let mut p = MoveProperties::new(0.001, 0.03);
        p.set("WaitUntilTime", &json!(0.5)).unwrap();
        p.set("WaitUntilPosition", &json!({"device": "y", "position": 2.0})).unwrap();
        assert_eq!(p.wait_until(), Some(WaitUntil::Position { device: 'y', position: 2.0 }));
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut p = MoveProperties::new(0.001, 0.03);
        assert!(p.set("Accuracy", &json!(0.0)).is_err());
        assert!(p.set("Blending", &json!("yes")).is_err());
        assert!(p.set("Warp", &json!(1)).is_err());
        assert!(p.set("WaitUntilPosition", &json!(["xy", 1.0])).is_err());
    }
}
