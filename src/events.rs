// Motion events and the bus that carries them
//
// Drivers emit onto a broadcast channel; they never call subscribers directly.
// The manager drains the channel and runs registered callbacks in its own task.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::monotonic_seconds;
use crate::error::StageError;
use crate::motor::{Axis, MotorState, Position};

/// Buffered events per subscriber before the slowest one starts lagging
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    MoveStarted,
    MoveComplete,
    MoveFailed,
    HomeStarted,
    HomeComplete,
    HomeFailed,
    Stopped,
    Error,
    StateChanged,
}

impl EventKind {
    /// Events after which the published position snapshot is stale
    pub fn changes_position(self) -> bool {
        matches!(
            self,
            EventKind::MoveComplete
                | EventKind::MoveFailed
                | EventKind::HomeComplete
                | EventKind::HomeFailed
                | EventKind::Stopped
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    None,
    Target { target: f64 },
    Position { position: Position },
    Limits { lo: f64, hi: f64 },
    Failure { error: StageError },
    State { from: MotorState, to: MotorState },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotorEvent {
    pub axis: Axis,
    pub kind: EventKind,
    /// Monotonic seconds at emission
    pub timestamp: f64,
    pub payload: EventPayload,
}

impl MotorEvent {
    pub fn new(axis: Axis, kind: EventKind, payload: EventPayload) -> Self {
        Self {
            axis,
            kind,
            timestamp: monotonic_seconds(),
            payload,
        }
    }

    /// Error carried by a failure event
    pub fn error(&self) -> Option<&StageError> {
        match &self.payload {
            EventPayload::Failure { error } => Some(error),
            _ => None,
        }
    }
}

/// One-to-many event channel, cheap to clone
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MotorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: MotorEvent) {
        trace!("event {:?} on {}", event.kind, event.axis);
        let _ = self.tx.send(event);
    }

    pub fn emit_kind(&self, axis: Axis, kind: EventKind, payload: EventPayload) {
        self.emit(MotorEvent::new(axis, kind, payload));
    }

    pub fn state_changed(&self, axis: Axis, from: MotorState, to: MotorState) {
        if from != to {
            self.emit_kind(axis, EventKind::StateChanged, EventPayload::State { from, to });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MotorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit_kind(Axis::X, EventKind::MoveStarted, EventPayload::Target { target: 5.0 });
        bus.state_changed(Axis::X, MotorState::Idle, MotorState::Moving);
        bus.state_changed(Axis::X, MotorState::Moving, MotorState::Moving); // no-op
        bus.emit_kind(
            Axis::X,
            EventKind::MoveFailed,
            EventPayload::Failure {
                error: StageError::Cancelled(Axis::X),
            },
        );

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::MoveStarted);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::StateChanged);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.kind, EventKind::MoveFailed);
        assert_eq!(failed.error(), Some(&StageError::Cancelled(Axis::X)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit_kind(Axis::Z, EventKind::Stopped, EventPayload::None);
    }
}
