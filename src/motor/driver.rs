// Axis driver capability set
//
// Every hardware backend implements AxisDriver. The manager only ever talks to
// `Arc<dyn AxisDriver>` built through the registry, so backends can be swapped
// by changing the driver key in the configuration.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::transport::Transport;
use super::{Axis, MotorState, Position};
use crate::config::{MotionTiming, MotorConfig};
use crate::error::{Result, StageError};
use crate::events::EventBus;

/// Everything a driver factory receives
#[derive(Clone)]
pub struct DriverParams {
    pub axis: Axis,
    pub transport: Transport,
    pub config: MotorConfig,
    pub timing: MotionTiming,
    pub events: EventBus,
}

/// Which limit switch a single-ended homing run drives to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomeDirection {
    /// Drive to the negative switch and zero there
    Negative,
    /// Drive to the positive switch and record it as the upper limit
    Positive,
}

/// Cached view of an axis, readable without touching the bus
#[derive(Debug, Clone, PartialEq)]
pub struct AxisSnapshot {
    pub axis: Axis,
    pub state: MotorState,
    pub position: Position,
    pub is_homed: bool,
    pub config: MotorConfig,
    /// Target of the move in flight, if any
    pub target: Option<f64>,
}

type Outcome = Option<Result<Position>>;

/// Completion handle for a move.
///
/// Resolves exactly once; any number of clones can await the same outcome.
#[derive(Debug, Clone)]
pub struct MoveHandle {
    axis: Axis,
    target: f64,
    rx: watch::Receiver<Outcome>,
}

/// Resolving side of a [`MoveHandle`]
#[derive(Debug)]
pub struct MoveCompleter {
    tx: watch::Sender<Outcome>,
}

impl MoveHandle {
    pub fn channel(axis: Axis, target: f64) -> (MoveCompleter, MoveHandle) {
        let (tx, rx) = watch::channel(None);
        (MoveCompleter { tx }, MoveHandle { axis, target, rx })
    }

    /// Handle that is already resolved
    pub fn resolved(axis: Axis, target: f64, outcome: Result<Position>) -> MoveHandle {
        let (completer, handle) = Self::channel(axis, target);
        completer.complete(outcome);
        handle
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Outcome if the move has finished
    pub fn outcome(&self) -> Option<Result<Position>> {
        self.rx.borrow().clone()
    }

    /// Wait for the move to finish
    pub async fn wait(&self) -> Result<Position> {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(StageError::Cancelled(self.axis))),
            // Completer dropped without resolving: the tracking task went away
            Err(_) => Err(StageError::Cancelled(self.axis)),
        }
    }

    /// Wait with an upper bound
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Position> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StageError::MotionTimeout {
                axis: self.axis,
                timeout,
            }),
        }
    }
}

impl MoveCompleter {
    pub fn complete(&self, outcome: Result<Position>) {
        self.tx.send_replace(Some(outcome));
    }
}

/// Capability set of one axis.
///
/// All methods take `&self`; implementations keep their state behind interior
/// mutability so that `stop` and `emergency_stop` can run while a move is in flight.
#[async_trait]
pub trait AxisDriver: Send + Sync {
    fn axis(&self) -> Axis;

    /// Registry key this driver was built under
    fn driver_key(&self) -> &'static str;

    fn snapshot(&self) -> AxisSnapshot;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Discover both travel endpoints; returns (lo, hi)
    async fn home_limits(&self) -> Result<(f64, f64)>;

    /// Drive to one limit switch; returns the position recorded there
    async fn home(&self, direction: HomeDirection) -> Result<f64>;

    /// Query the controller for the current position
    async fn get_position(&self) -> Result<Position>;

    async fn get_state(&self) -> MotorState {
        self.snapshot().state
    }

    async fn is_moving(&self) -> bool {
        self.snapshot().state.is_busy()
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Put back a velocity saved before a temporary override. The cached
    /// configuration takes it even when the controller is unreachable, so the
    /// next `connect` programs the restored value.
    async fn restore_velocity(&self, velocity: f64) -> Result<()>;

    async fn set_acceleration(&self, acceleration: f64) -> Result<()>;

    async fn set_zero(&self) -> Result<()>;

    /// Start an absolute move. With `wait` the returned handle is already resolved.
    async fn move_absolute(&self, target: f64, wait: bool) -> Result<MoveHandle>;

    async fn move_relative(&self, delta: f64, wait: bool) -> Result<MoveHandle>;

    async fn stop(&self) -> Result<()>;

    async fn emergency_stop(&self) -> Result<()>;

    /// Wait for the move in flight, if any, and return the settled position
    async fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<Position>;

    /// Force the axis into ERROR after a failure detected elsewhere (e.g. the transport)
    fn mark_fault(&self, reason: &str);
}
