// Shared memory IPC
//
// Two independent named blocks published by the manager process:
// - `stage_position`: fixed binary layout, timestamp bracketed
// - `stage_config`: length-prefixed JSON (the same framing carries `ldc_config`)

pub mod config_block;
pub mod position;
pub mod segment;

pub use config_block::{CONFIG_BLOCK_SIZE, ConfigBlock, MAX_PAYLOAD};
pub use position::{POSITION_BLOCK_SIZE, PositionBlock, PositionSnapshot};
pub use segment::Segment;
