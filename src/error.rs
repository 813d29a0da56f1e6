// src/error.rs - Error taxonomy shared by planner, dispatcher and controllers
use thiserror::Error;

/// Errors raised by the motion engine.
///
/// Validation failures (`InvalidRequest`) are produced before any command is
/// enqueued. Only `HardwareFault` and `Timeout` are worth retrying.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Hardware fault on '{controller}': {message}")]
    HardwareFault { controller: String, message: String },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl MotionError {
    pub fn invalid(message: impl Into<String>) -> Self {
        MotionError::InvalidRequest(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        MotionError::DeviceUnavailable(message.into())
    }

    pub fn hardware(controller: &str, message: impl Into<String>) -> Self {
        MotionError::HardwareFault {
            controller: controller.to_string(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, MotionError::HardwareFault { .. } | MotionError::Timeout(_))
    }
}

pub type MotionResult<T> = Result<T, MotionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_hardware_and_timeout_are_retryable() {
        assert!(MotionError::hardware("stage", "link lost").is_retryable());
        assert!(MotionError::Timeout("state refresh".into()).is_retryable());
        assert!(!MotionError::invalid("bad").is_retryable());
        assert!(!MotionError::unavailable("q").is_retryable());
        assert!(!MotionError::Aborted("cleared".into()).is_retryable());
    }

    #[test]
    fn hardware_fault_message_names_controller() {
        let err = MotionError::hardware("sync", "buffer overflow");
        assert_eq!(err.to_string(), "Hardware fault on 'sync': buffer overflow");
    }
}
