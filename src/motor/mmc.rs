// MMC-100 serial axis driver
//
// One MmcAxis per controller address on the shared bus. A move is issued from the
// caller's task and then followed by a spawned tracker that polls STA? until the
// controller reports stationary. Stop, e-stop and faults take the in-flight
// operation away from the tracker, so every move resolves exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::driver::{
    AxisDriver, AxisSnapshot, DriverParams, HomeDirection, MoveCompleter, MoveHandle,
};
use super::protocol::{self, Command, FEEDBACK_CLOSED_LOOP, StatusWord, um_to_mm};
use super::registry::DriverRegistry;
use super::transport::Transport;
use super::{Axis, MotorState, Position};
use crate::config::{DEFAULT_DRIVER, MotionTiming, MotorConfig};
use crate::error::{Result, StageError};
use crate::events::{EventBus, EventKind, EventPayload};

/// Registry key for this driver
pub const DRIVER_KEY: &str = DEFAULT_DRIVER;

pub fn register(registry: &mut DriverRegistry) {
    registry.register(DRIVER_KEY, create);
}

fn create(params: DriverParams) -> Arc<dyn AxisDriver> {
    Arc::new(MmcAxis::new(params))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Move,
    Homing,
}

impl OpKind {
    fn failed_event(self) -> EventKind {
        match self {
            OpKind::Move => EventKind::MoveFailed,
            OpKind::Homing => EventKind::HomeFailed,
        }
    }
}

/// Move or homing run currently owning the axis
struct InFlight {
    id: u64,
    kind: OpKind,
    target: Option<f64>,
    cancel: watch::Sender<bool>,
    completer: Option<MoveCompleter>,
    handle: Option<MoveHandle>,
}

impl InFlight {
    /// Resolve with `error`, emit the matching failure event and wake the tracker
    fn abandon(self, events: &EventBus, axis: Axis, error: StageError) {
        self.cancel.send_replace(true);
        events.emit_kind(
            axis,
            self.kind.failed_event(),
            EventPayload::Failure {
                error: error.clone(),
            },
        );
        if let Some(completer) = self.completer {
            completer.complete(Err(error));
        }
    }
}

struct Inner {
    state: MotorState,
    position: Position,
    config: MotorConfig,
    homed: bool,
    op: Option<InFlight>,
}

struct Shared {
    axis: Axis,
    transport: Transport,
    timing: MotionTiming,
    events: EventBus,
    inner: Mutex<Inner>,
    /// Serializes command issue on this axis in submission order
    commands: AsyncMutex<()>,
    next_op: AtomicU64,
}

/// Serial driver for one MMC-100 axis
pub struct MmcAxis(Arc<Shared>);

impl MmcAxis {
    pub fn new(params: DriverParams) -> Self {
        let DriverParams {
            axis,
            transport,
            config,
            timing,
            events,
        } = params;
        let position = Position::new(0.0, 0.0, &config.units);
        Self(Arc::new(Shared {
            axis,
            transport,
            timing,
            events,
            inner: Mutex::new(Inner {
                state: MotorState::Disconnected,
                position,
                config,
                homed: false,
                op: None,
            }),
            commands: AsyncMutex::new(()),
            next_op: AtomicU64::new(1),
        }))
    }
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, to: MotorState) {
        let from = inner.state;
        if from != to {
            debug!("Axis {}: {} -> {}", self.axis, from, to);
            inner.state = to;
            self.events.state_changed(self.axis, from, to);
        }
    }

    fn check_connected(&self, inner: &Inner) -> Result<()> {
        match inner.state {
            MotorState::Disconnected | MotorState::Error => Err(StageError::NotConnected(self.axis)),
            _ => Ok(()),
        }
    }

    /// IDLE or STOPPED: may start a move, a homing run or a zeroing
    fn check_ready(&self, inner: &Inner) -> Result<()> {
        self.check_connected(inner)?;
        if inner.state.is_busy() {
            return Err(StageError::Busy {
                axis: self.axis,
                state: inner.state,
            });
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        let result = self.transport.send(self.axis.prefix(), &command.encode()).await;
        if let Err(e) = &result {
            self.on_transport_error(e);
        }
        result
    }

    async fn query(&self, command: Command) -> Result<String> {
        let result = self.transport.query(self.axis.prefix(), &command.encode()).await;
        if let Err(e) = &result {
            self.on_transport_error(e);
        }
        result
    }

    fn on_transport_error(&self, e: &StageError) {
        if e.is_transport_fatal() {
            self.fault(e.clone());
        }
    }

    /// Drop whatever is in flight and park the axis in ERROR
    fn fault(&self, error: StageError) {
        let op = {
            let mut inner = self.inner();
            if inner.state == MotorState::Disconnected
                || (inner.state == MotorState::Error && inner.op.is_none())
            {
                return;
            }
            let op = inner.op.take();
            self.set_state(&mut inner, MotorState::Error);
            op
        };
        error!("Axis {} fault: {}", self.axis, error);
        self.events.emit_kind(
            self.axis,
            EventKind::Error,
            EventPayload::Failure {
                error: error.clone(),
            },
        );
        if let Some(op) = op {
            op.abandon(&self.events, self.axis, error);
        }
    }

    fn start_op(
        &self,
        inner: &mut Inner,
        kind: OpKind,
        target: Option<f64>,
        handle: Option<(MoveCompleter, MoveHandle)>,
    ) -> (u64, watch::Receiver<bool>) {
        let id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = watch::channel(false);
        let (completer, handle) = match handle {
            Some((completer, handle)) => (Some(completer), Some(handle)),
            None => (None, None),
        };
        inner.op = Some(InFlight {
            id,
            kind,
            target,
            cancel,
            completer,
            handle,
        });
        if inner.state == MotorState::Stopped {
            self.set_state(inner, MotorState::Idle);
        }
        let busy = match kind {
            OpKind::Move => MotorState::Moving,
            OpKind::Homing => MotorState::Homing,
        };
        self.set_state(inner, busy);
        (id, cancelled)
    }

    /// Retire operation `id` if nobody has taken it in the meantime
    fn finish(&self, id: u64, next: MotorState, update: impl FnOnce(&mut Inner)) -> Option<InFlight> {
        let mut inner = self.inner();
        let op = inner.op.take_if(|op| op.id == id)?;
        update(&mut inner);
        self.set_state(&mut inner, next);
        Some(op)
    }

    fn fail(&self, id: u64, next: MotorState, error: StageError) {
        if let Some(op) = self.finish(id, next, |_| {}) {
            warn!("Axis {} {:?} failed: {}", self.axis, op.kind, error);
            op.abandon(&self.events, self.axis, error);
        }
    }

    /// Issue a command on behalf of an operation. A halt that lands before the
    /// command reaches the bus wins, and one that races it gets a trailing STP.
    async fn send_for_op(&self, command: Command, cancelled: &watch::Receiver<bool>) -> Result<()> {
        if *cancelled.borrow() {
            return Err(StageError::Cancelled(self.axis));
        }
        self.send(command).await?;
        if *cancelled.borrow() {
            debug!("Axis {}: halted while commanding; stopping again", self.axis);
            let _ = self.send(Command::Stop).await;
            return Err(StageError::Cancelled(self.axis));
        }
        Ok(())
    }

    async fn read_position(&self) -> Result<Position> {
        let reply = self.query(Command::Position).await?;
        let (theoretical, actual) = protocol::parse_position(&reply)?;
        let mut inner = self.inner();
        let position = Position::new(theoretical, actual, &inner.config.units);
        inner.position = position.clone();
        Ok(position)
    }

    /// Poll STA? until bit 3 is set, the deadline passes or the operation is cancelled
    async fn wait_stationary(
        &self,
        timeout: Duration,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<StatusWord> {
        let deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                biased;
                _ = cancelled.changed() => return Err(StageError::Cancelled(self.axis)),
                _ = tokio::time::sleep(self.timing.status_poll_interval) => {}
            }
            if *cancelled.borrow() {
                return Err(StageError::Cancelled(self.axis));
            }

            let status = protocol::parse_status(&self.query(Command::Status).await?)?;
            if status.is_stationary() {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(StageError::MotionTimeout {
                    axis: self.axis,
                    timeout,
                });
            }
        }
    }

    async fn settle(&self, target: f64) -> Result<Position> {
        let position = self.read_position().await?;
        let tolerance = self.timing.position_tolerance;
        if (position.actual - target).abs() <= tolerance {
            Ok(position)
        } else {
            Err(StageError::MotionFailed {
                axis: self.axis,
                target,
                actual: position.actual,
                tolerance,
            })
        }
    }

    async fn start_move(self: &Arc<Self>, target: f64, command: Command) -> Result<MoveHandle> {
        let (id, cancelled, handle) = {
            let mut inner = self.inner();
            self.check_ready(&inner)?;
            if !inner.config.contains(target) {
                let (lo, hi) = inner.config.position_limits;
                return Err(StageError::InvalidArgument(format!(
                    "target {target} for axis {} outside limits [{lo}, {hi}]",
                    self.axis
                )));
            }
            let (completer, handle) = MoveHandle::channel(self.axis, target);
            let (id, cancelled) = self.start_op(
                &mut inner,
                OpKind::Move,
                Some(target),
                Some((completer, handle.clone())),
            );
            (id, cancelled, handle)
        };

        info!("Axis {} moving to {:.3}", self.axis, target);
        self.events
            .emit_kind(self.axis, EventKind::MoveStarted, EventPayload::Target { target });

        if let Err(e) = self.send_for_op(command, &cancelled).await {
            self.fail(id, MotorState::Error, e.clone());
            return Err(e);
        }
        tokio::spawn(Arc::clone(self).track_move(id, target, cancelled));
        Ok(handle)
    }

    async fn track_move(self: Arc<Self>, id: u64, target: f64, mut cancelled: watch::Receiver<bool>) {
        let outcome = match self.wait_stationary(self.timing.move_timeout, &mut cancelled).await {
            Ok(_) => self.settle(target).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(position) => {
                if let Some(op) = self.finish(id, MotorState::Idle, |_| {}) {
                    info!("Axis {} reached {:.3}", self.axis, position.actual);
                    self.events.emit_kind(
                        self.axis,
                        EventKind::MoveComplete,
                        EventPayload::Position {
                            position: position.clone(),
                        },
                    );
                    if let Some(completer) = op.completer {
                        completer.complete(Ok(position));
                    }
                }
            }
            // Resolved by whoever cancelled
            Err(StageError::Cancelled(_)) => {}
            Err(e @ StageError::MotionTimeout { .. }) => {
                let _ = self.send(Command::Stop).await;
                self.fail(id, MotorState::Stopped, e);
            }
            Err(e) => self.fail(id, MotorState::Error, e),
        }
    }

    fn begin_homing(&self) -> Result<(u64, watch::Receiver<bool>)> {
        let started = {
            let mut inner = self.inner();
            self.check_ready(&inner)?;
            self.start_op(&mut inner, OpKind::Homing, None, None)
        };
        info!("Axis {} homing", self.axis);
        self.events
            .emit_kind(self.axis, EventKind::HomeStarted, EventPayload::None);
        Ok(started)
    }

    /// Drive into one switch and return the position where the axis came to rest
    async fn drive_to_limit(
        &self,
        command: Command,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<f64> {
        self.send_for_op(command, cancelled).await?;
        let status = match self.wait_stationary(self.timing.homing_timeout, cancelled).await {
            Err(e @ StageError::MotionTimeout { .. }) => {
                let _ = self.send(Command::Stop).await;
                return Err(e);
            }
            other => other?,
        };
        if !status.at_limit() {
            warn!(
                "Axis {} stopped without a limit switch reported (status {:?})",
                self.axis, status
            );
        }
        Ok(self.read_position().await?.actual)
    }

    async fn search_limits(&self, cancelled: &mut watch::Receiver<bool>) -> Result<(f64, f64)> {
        let hi = self
            .drive_to_limit(Command::MoveToPositiveLimit, cancelled)
            .await?;
        let lo = self
            .drive_to_limit(Command::MoveToNegativeLimit, cancelled)
            .await?;
        if hi > lo {
            Ok((lo, hi))
        } else {
            Err(StageError::InvalidConfig(format!(
                "limit search on axis {} found lo {lo} not below hi {hi}",
                self.axis
            )))
        }
    }

    async fn halt(&self, command: Command, emergency: bool) -> Result<()> {
        let (taken, stopped) = {
            let mut inner = self.inner();
            if inner.state == MotorState::Disconnected {
                return Ok(());
            }
            let op = inner.op.take();
            if let Some(op) = &op {
                op.cancel.send_replace(true);
            }
            let stop_state = inner.state.is_busy()
                || op.is_some()
                || (emergency && inner.state == MotorState::Idle);
            if stop_state {
                self.set_state(&mut inner, MotorState::Stopped);
            }
            (op, stop_state)
        };

        let sent = self.send(command).await;
        if stopped {
            info!("Axis {} stopped", self.axis);
            self.events
                .emit_kind(self.axis, EventKind::Stopped, EventPayload::None);
        }
        if let Some(op) = taken {
            op.abandon(&self.events, self.axis, StageError::Cancelled(self.axis));
        }
        sent
    }
}

#[async_trait]
impl AxisDriver for MmcAxis {
    fn axis(&self) -> Axis {
        self.0.axis
    }

    fn driver_key(&self) -> &'static str {
        DRIVER_KEY
    }

    fn snapshot(&self) -> AxisSnapshot {
        let inner = self.0.inner();
        AxisSnapshot {
            axis: self.0.axis,
            state: inner.state,
            position: inner.position.clone(),
            is_homed: inner.homed,
            config: inner.config.clone(),
            target: inner.op.as_ref().and_then(|op| op.target),
        }
    }

    async fn connect(&self) -> Result<()> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let state = shared.inner().state;
        if !matches!(state, MotorState::Disconnected | MotorState::Error) {
            return Ok(());
        }

        let config = shared.inner().config.clone();
        shared.send(Command::Feedback(FEEDBACK_CLOSED_LOOP)).await?;
        shared.send(Command::Velocity(um_to_mm(config.velocity))).await?;
        shared
            .send(Command::Acceleration(um_to_mm(config.acceleration)))
            .await?;
        let position = shared.read_position().await?;

        {
            let mut inner = shared.inner();
            inner.op = None;
            shared.set_state(&mut inner, MotorState::Idle);
        }
        info!(
            "Axis {} connected on {} at {:.3} {}",
            shared.axis,
            shared.transport.name(),
            position.actual,
            position.units
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let (op, was_busy) = {
            let mut inner = shared.inner();
            if inner.state == MotorState::Disconnected {
                return Ok(());
            }
            let op = inner.op.take();
            let was_busy = inner.state.is_busy();
            inner.homed = false;
            shared.set_state(&mut inner, MotorState::Disconnected);
            (op, was_busy)
        };

        if was_busy {
            // Straight to the transport: a failure here must not fault a disconnected axis
            if let Err(e) = shared
                .transport
                .send(shared.axis.prefix(), &Command::Stop.encode())
                .await
            {
                warn!("Axis {} stop on disconnect failed: {}", shared.axis, e);
            }
        }
        if let Some(op) = op {
            op.abandon(&shared.events, shared.axis, StageError::Cancelled(shared.axis));
        }
        info!("Axis {} disconnected", shared.axis);
        Ok(())
    }

    async fn home_limits(&self) -> Result<(f64, f64)> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let (id, mut cancelled) = shared.begin_homing()?;

        match shared.search_limits(&mut cancelled).await {
            Ok((lo, hi)) => {
                let finished = shared.finish(id, MotorState::Idle, |inner| {
                    inner.homed = true;
                    inner.config.position_limits = (lo, hi);
                });
                if finished.is_none() {
                    return Err(StageError::Cancelled(shared.axis));
                }
                info!("Axis {} homed: limits [{:.3}, {:.3}]", shared.axis, lo, hi);
                shared.events.emit_kind(
                    shared.axis,
                    EventKind::HomeComplete,
                    EventPayload::Limits { lo, hi },
                );
                Ok((lo, hi))
            }
            Err(e) => {
                shared.fail(id, MotorState::Error, e.clone());
                Err(e)
            }
        }
    }

    async fn home(&self, direction: HomeDirection) -> Result<f64> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let (id, mut cancelled) = shared.begin_homing()?;

        let result = match direction {
            HomeDirection::Positive => {
                shared
                    .drive_to_limit(Command::MoveToPositiveLimit, &mut cancelled)
                    .await
            }
            HomeDirection::Negative => {
                match shared
                    .drive_to_limit(Command::MoveToNegativeLimit, &mut cancelled)
                    .await
                {
                    Ok(at_switch) => match shared.send_for_op(Command::Zero, &cancelled).await {
                        Ok(()) => shared.read_position().await.map(|_| at_switch),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(recorded) => {
                let mut limits = (0.0, 0.0);
                let finished = shared.finish(id, MotorState::Idle, |inner| {
                    inner.homed = true;
                    let (lo, hi) = inner.config.position_limits;
                    inner.config.position_limits = match direction {
                        // Coordinates now start at the negative switch
                        HomeDirection::Negative => (0.0, (hi - recorded).max(0.0)),
                        HomeDirection::Positive => (lo.min(recorded), recorded),
                    };
                    limits = inner.config.position_limits;
                });
                if finished.is_none() {
                    return Err(StageError::Cancelled(shared.axis));
                }
                info!("Axis {} homed {:?} at {:.3}", shared.axis, direction, recorded);
                shared.events.emit_kind(
                    shared.axis,
                    EventKind::HomeComplete,
                    EventPayload::Limits {
                        lo: limits.0,
                        hi: limits.1,
                    },
                );
                Ok(match direction {
                    HomeDirection::Negative => 0.0,
                    HomeDirection::Positive => recorded,
                })
            }
            Err(e) => {
                shared.fail(id, MotorState::Error, e.clone());
                Err(e)
            }
        }
    }

    async fn get_position(&self) -> Result<Position> {
        let state = self.0.inner().state;
        if state == MotorState::Disconnected {
            return Err(StageError::NotConnected(self.0.axis));
        }
        self.0.read_position().await
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let config = {
            let inner = shared.inner();
            shared.check_connected(&inner)?;
            inner.config.clone()
        };
        config.check_velocity(velocity)?;
        shared.send(Command::Velocity(um_to_mm(velocity))).await?;
        shared.inner().config.velocity = velocity;
        debug!("Axis {} velocity {}", shared.axis, velocity);
        Ok(())
    }

    async fn restore_velocity(&self, velocity: f64) -> Result<()> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let reachable = {
            let mut inner = shared.inner();
            inner.config.check_velocity(velocity)?;
            inner.config.velocity = velocity;
            shared.check_connected(&inner).is_ok()
        };
        if !reachable {
            debug!("Axis {} velocity {} kept for the next connect", shared.axis, velocity);
            return Ok(());
        }
        shared.send(Command::Velocity(um_to_mm(velocity))).await
    }

    async fn set_acceleration(&self, acceleration: f64) -> Result<()> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        let config = {
            let inner = shared.inner();
            shared.check_connected(&inner)?;
            inner.config.clone()
        };
        config.check_acceleration(acceleration)?;
        shared
            .send(Command::Acceleration(um_to_mm(acceleration)))
            .await?;
        shared.inner().config.acceleration = acceleration;
        debug!("Axis {} acceleration {}", shared.axis, acceleration);
        Ok(())
    }

    async fn set_zero(&self) -> Result<()> {
        let shared = &self.0;
        let _cmd = shared.commands.lock().await;
        {
            let inner = shared.inner();
            shared.check_ready(&inner)?;
        }
        shared.send(Command::Zero).await?;
        shared.read_position().await?;
        info!("Axis {} zeroed", shared.axis);
        Ok(())
    }

    async fn move_absolute(&self, target: f64, wait: bool) -> Result<MoveHandle> {
        let handle = {
            let _cmd = self.0.commands.lock().await;
            self.0
                .start_move(target, Command::MoveAbsolute(um_to_mm(target)))
                .await?
        };
        if wait {
            handle.wait().await?;
        }
        Ok(handle)
    }

    async fn move_relative(&self, delta: f64, wait: bool) -> Result<MoveHandle> {
        let handle = {
            let _cmd = self.0.commands.lock().await;
            {
                let inner = self.0.inner();
                self.0.check_ready(&inner)?;
            }
            let current = self.0.read_position().await?.actual;
            self.0
                .start_move(current + delta, Command::MoveRelative(um_to_mm(delta)))
                .await?
        };
        if wait {
            handle.wait().await?;
        }
        Ok(handle)
    }

    async fn stop(&self) -> Result<()> {
        self.0.halt(Command::Stop, false).await
    }

    async fn emergency_stop(&self) -> Result<()> {
        warn!("Axis {} emergency stop", self.0.axis);
        self.0.halt(Command::Abort, true).await
    }

    async fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<Position> {
        let handle = self.0.inner().op.as_ref().and_then(|op| op.handle.clone());
        match (handle, timeout) {
            (Some(handle), Some(timeout)) => handle.wait_timeout(timeout).await,
            (Some(handle), None) => handle.wait().await,
            (None, _) => Ok(self.0.inner().position.clone()),
        }
    }

    fn mark_fault(&self, reason: &str) {
        self.0.fault(StageError::Transport(reason.to_string()));
    }
}
