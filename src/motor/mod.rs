// Motor control module for the probe-station micropositioner
//
// Provides:
// - Axis identity, motor state and position records
// - MMC-100 serial vocabulary and the shared serial transport
// - The axis driver capability trait, the serial driver and the driver registry
// - An in-process controller emulator for bench work without hardware

pub mod driver;
pub mod mmc;
pub mod protocol;
pub mod registry;
pub mod sim;
pub mod transport;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::monotonic_seconds;
use crate::error::StageError;

pub use driver::{AxisDriver, AxisSnapshot, DriverParams, HomeDirection, MoveHandle};
pub use mmc::MmcAxis;
pub use registry::{DriverFactory, DriverRegistry};
pub use sim::SimulatedController;
pub use transport::{SerialLink, Transport};

/// Number of physical axes on the stage
pub const AXIS_COUNT: usize = 5;

/// Default position units
pub const DEFAULT_UNITS: &str = "um";

/// One controllable degree of freedom.
///
/// Serialized by name (`X`, `Y`, `Z`, `ROTATION_FIBER`, `ROTATION_CHIP`), which is
/// how per-axis maps are keyed in the shared configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Axis {
    X,
    Y,
    Z,
    RotationFiber,
    RotationChip,
}

impl Axis {
    /// All physical axes in slot order
    pub const ALL: [Axis; AXIS_COUNT] = [
        Axis::X,
        Axis::Y,
        Axis::Z,
        Axis::RotationFiber,
        Axis::RotationChip,
    ];

    /// Stable slot index (0..4), also the shared-memory slot
    pub fn to_index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::RotationFiber => 3,
            Axis::RotationChip => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<Axis> {
        Axis::ALL.get(index).copied()
    }

    /// Controller address used as the command prefix (1..5)
    pub fn prefix(self) -> u8 {
        self.to_index() as u8 + 1
    }

    pub fn name(self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::RotationFiber => "ROTATION_FIBER",
            Axis::RotationChip => "ROTATION_CHIP",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Axis {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Axis::ALL
            .into_iter()
            .find(|axis| axis.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| StageError::InvalidArgument(format!("unknown axis '{s}'")))
    }
}

/// Target of a manager-level operation: one axis or every initialized axis.
///
/// `All` is a broadcast tag only; it never indexes storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSelector {
    One(Axis),
    All,
}

impl From<Axis> for AxisSelector {
    fn from(axis: Axis) -> Self {
        AxisSelector::One(axis)
    }
}

/// Operational state of one axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotorState {
    #[default]
    Disconnected,
    Idle,
    Homing,
    Moving,
    Stopped,
    Error,
}

impl MotorState {
    /// Motion in progress (a move or a homing run)
    pub fn is_busy(self) -> bool {
        matches!(self, MotorState::Moving | MotorState::Homing)
    }

    /// Accepts a new move, homing run or zeroing
    pub fn is_ready(self) -> bool {
        matches!(self, MotorState::Idle | MotorState::Stopped)
    }
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotorState::Disconnected => "DISCONNECTED",
            MotorState::Idle => "IDLE",
            MotorState::Homing => "HOMING",
            MotorState::Moving => "MOVING",
            MotorState::Stopped => "STOPPED",
            MotorState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Position reading with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Commanded position
    pub theoretical: f64,
    /// Encoder (measured) position
    pub actual: f64,
    pub units: String,
    /// Monotonic seconds when the reading was taken
    pub timestamp: f64,
}

impl Position {
    pub fn new(theoretical: f64, actual: f64, units: &str) -> Self {
        Self {
            theoretical,
            actual,
            units: units.to_string(),
            timestamp: monotonic_seconds(),
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new(0.0, 0.0, DEFAULT_UNITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_indices_and_prefixes() {
        for (i, axis) in Axis::ALL.iter().enumerate() {
            assert_eq!(axis.to_index(), i);
            assert_eq!(axis.prefix() as usize, i + 1);
            assert_eq!(Axis::from_index(i), Some(*axis));
        }
        assert_eq!(Axis::from_index(5), None);
    }

    #[test]
    fn test_axis_names() {
        assert_eq!(serde_json::to_string(&Axis::RotationFiber).unwrap(), "\"ROTATION_FIBER\"");
        assert_eq!("rotation_chip".parse::<Axis>().unwrap(), Axis::RotationChip);
        assert!("ALL".parse::<Axis>().is_err());
    }

    #[test]
    fn test_state_predicates() {
        assert!(MotorState::Moving.is_busy());
        assert!(MotorState::Homing.is_busy());
        assert!(MotorState::Stopped.is_ready());
        assert!(!MotorState::Error.is_ready());
        assert!(!MotorState::Disconnected.is_ready());
        assert_eq!(MotorState::default(), MotorState::Disconnected);
    }
}
