// Motion control for the probe-station micropositioner
//
// Five axes (X, Y, Z, fiber rotation, chip rotation) on one MMC-100 serial
// daisy chain. Positions and configuration are published to cooperating
// processes through shared memory.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod motor;
pub mod shm;

pub use config::{MotionTiming, MotorConfig, ShmOptions, StageConfiguration};
pub use error::{Result, StageError};
pub use events::{EventBus, EventKind, EventPayload, MotorEvent};
pub use manager::{CallbackId, MoveCommand, StageManager, StageStatus};
pub use motor::{Axis, AxisSelector, HomeDirection, MotorState, Position};
