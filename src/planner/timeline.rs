// src/planner/timeline.rs - Shutter engagement across consecutive segments
use crate::command::ShutterTiming;

/// Places one shutter-open and one shutter-close instant on a chain of
/// segments by elapsed-time accounting. Each resulting delay is relative to
/// the start of the segment that carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutterTimeline {
    durations: Vec<f64>,
}

impl ShutterTimeline {
    pub fn new(durations: Vec<f64>) -> Self {
        Self { durations }
    }

    pub fn total(&self) -> f64 {
        self.durations.iter().sum()
    }

    /// Shutter timing for every segment, opening `open_at` and closing
    /// `close_at` seconds after the first segment starts.
    pub fn assign(&self, open_at: f64, close_at: f64) -> Vec<ShutterTiming> {
        let mut timings = vec![ShutterTiming::default(); self.durations.len()];
        if self.durations.is_empty() || close_at <= open_at {
            return timings;
        }
        if let Some((index, offset)) = self.locate(open_at) {
            timings[index].delay_on_ms = Some(to_ms(offset));
        }
        if let Some((index, offset)) = self.locate(close_at) {
            timings[index].delay_off_ms = Some(to_ms(offset));
        }
        timings
    }

    /// Segment containing `at` and the offset into it. An instant on a
    /// boundary belongs to the later segment, except at the very end.
    fn locate(&self, at: f64) -> Option<(usize, f64)> {
        let at = at.max(0.0);
        let mut elapsed = 0.0;
        for (index, duration) in self.durations.iter().enumerate() {
            if at < elapsed + duration {
                return Some((index, at - elapsed));
            }
            elapsed += duration;
        }
        let last = self.durations.len().checked_sub(1)?;
        Some((last, (at - (elapsed - self.durations[last])).min(self.durations[last])))
    }
}

fn to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round().max(0.0) as u64
}
