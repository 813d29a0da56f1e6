// src/planner/kinematics.rs
use std::collections::HashMap;

use crate::device::DeviceName;

/// Maps axis displacements into tool space, where trajectory length is measured.
pub trait ToolMapping: Send + Sync {
    /// Convert an axis displacement to its tool-space component
    fn axis_to_tool(&self, device: DeviceName, axis_delta: f64) -> f64;

    /// Convert a tool-space component back to axis units
    fn tool_to_axis(&self, device: DeviceName, tool_delta: f64) -> f64;

    /// Euclidean length of the tool-space displacement vector
    fn trajectory_length(&self, deltas: &[(DeviceName, f64)]) -> f64 {
        deltas
            .iter()
            .map(|(device, delta)| self.axis_to_tool(*device, *delta).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Linear per-axis scaling (Cartesian stage, no coupling between axes).
#[derive(Debug, Clone, Default)]
pub struct AxisScaleMapping {
    scales: HashMap<DeviceName, f64>,
}

impl AxisScaleMapping {
    pub fn new(scales: HashMap<DeviceName, f64>) -> Self {
        Self { scales }
    }

    pub fn scale(&self, device: DeviceName) -> f64 {
        self.scales.get(&device).copied().unwrap_or(1.0)
    }
}

impl ToolMapping for AxisScaleMapping {
    fn axis_to_tool(&self, device: DeviceName, axis_delta: f64) -> f64 {
        axis_delta * self.scale(device)
    }

    fn tool_to_axis(&self, device: DeviceName, tool_delta: f64) -> f64 {
        tool_delta / self.scale(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_mapping_is_euclidean() {
        let mapping = AxisScaleMapping::default();
        let length = mapping.trajectory_length(&[('x', 3.0), ('y', -4.0)]);
        assert!((length - 5.0).abs() < 1e-12);
    }

    #[test]
    fn scaled_axis() {
        let mapping = AxisScaleMapping::new(HashMap::from([('z', 2.0)]));
        assert_eq!(mapping.axis_to_tool('z', 1.5), 3.0);
        assert_eq!(mapping.tool_to_axis('z', 3.0), 1.5);
        assert_eq!(mapping.axis_to_tool('x', 1.5), 1.5);
    }
}
