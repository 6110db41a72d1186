// Error taxonomy for the motion stack

use std::time::Duration;

use crate::motor::{Axis, MotorState};

/// Errors raised by the transport, axis drivers, registry, shared memory and manager.
///
/// Cloneable so that one move outcome can be handed to every party awaiting it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for reply to '{command}' after {timeout:?}")]
    TransportTimeout { command: String, timeout: Duration },

    #[error("Axis {0} is not connected")]
    NotConnected(Axis),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Axis {axis} is busy ({state})")]
    Busy { axis: Axis, state: MotorState },

    #[error("Axis {axis} settled at {actual:.3} instead of {target:.3} (tolerance {tolerance})")]
    MotionFailed {
        axis: Axis,
        target: f64,
        actual: f64,
        tolerance: f64,
    },

    #[error("Axis {axis} did not report completion within {timeout:?}")]
    MotionTimeout { axis: Axis, timeout: Duration },

    #[error("Motion on axis {0} was cancelled")]
    Cancelled(Axis),

    #[error("No driver registered under '{0}'")]
    UnknownDriver(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shared memory error: {0}")]
    Shm(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StageError {
    /// True for failures that leave the serial port unusable until reconnect.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, StageError::Transport(_))
    }
}

impl From<serialport::Error> for StageError {
    fn from(e: serialport::Error) -> Self {
        StageError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        StageError::Shm(e.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        StageError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StageError::Busy {
            axis: Axis::X,
            state: MotorState::Moving,
        };
        assert_eq!(err.to_string(), "Axis X is busy (MOVING)");

        let err = StageError::UnknownDriver("piezo".to_string());
        assert!(err.to_string().contains("piezo"));
    }

    #[test]
    fn test_transport_fatal() {
        assert!(StageError::Transport("port gone".into()).is_transport_fatal());
        assert!(
            !StageError::TransportTimeout {
                command: "1STA?".into(),
                timeout: Duration::from_millis(300),
            }
            .is_transport_fatal()
        );
        assert!(!StageError::Cancelled(Axis::Y).is_transport_fatal());
    }
}
