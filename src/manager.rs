// Stage manager
//
// Owns the transport, one driver per initialized axis, the event dispatcher and
// the writer side of the shared memory blocks. Aggregate operations (coordinated
// moves, stop-all, e-stop) never fail as a whole; they report per axis.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clock::monotonic_seconds;
use crate::config::{DEFAULT_STATUS_POLL_INTERVAL_S, ShmOptions, StageConfiguration};
use crate::error::{Result, StageError};
use crate::events::{EventBus, EventKind, MotorEvent};
use crate::motor::registry::{self, DriverRegistry};
use crate::motor::{
    Axis, AxisDriver, AxisSelector, DEFAULT_UNITS, DriverParams, HomeDirection, MotorState,
    MoveHandle, Position, Transport,
};
use crate::shm::{ConfigBlock, PositionBlock, PositionSnapshot};

/// Subscriber run by the dispatcher for every event. Must return quickly and
/// must not call back into the manager.
pub type EventCallback = Arc<dyn Fn(&MotorEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// Multi-axis move request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MoveCommand {
    pub targets: BTreeMap<Axis, f64>,
    /// Velocity override applied to every axis for this move only
    pub velocity: Option<f64>,
    /// Start together, wait for all, stop the rest if one fails
    pub coordinated: bool,
    pub relative: bool,
}

impl MoveCommand {
    pub fn absolute(targets: impl IntoIterator<Item = (Axis, f64)>) -> Self {
        Self {
            targets: targets.into_iter().collect(),
            velocity: None,
            coordinated: true,
            relative: false,
        }
    }

    pub fn relative(deltas: impl IntoIterator<Item = (Axis, f64)>) -> Self {
        Self {
            relative: true,
            ..Self::absolute(deltas)
        }
    }

    pub fn with_velocity(mut self, velocity: f64) -> Self {
        self.velocity = Some(velocity);
        self
    }

    /// Axes move independently; a failure on one does not stop the others
    pub fn independent(mut self) -> Self {
        self.coordinated = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisStatus {
    pub state: MotorState,
    pub driver: String,
    pub position: f64,
    pub theoretical: f64,
    pub units: String,
    pub is_homed: bool,
    pub target: Option<f64>,
    pub velocity: f64,
    pub position_limits: (f64, f64),
}

/// Manager-wide snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub connected: bool,
    pub port: String,
    pub initialized: Vec<Axis>,
    pub moving: Vec<Axis>,
    pub axes: BTreeMap<Axis, AxisStatus>,
}

type Drivers = BTreeMap<Axis, Arc<dyn AxisDriver>>;

struct Shared {
    config: RwLock<StageConfiguration>,
    registry: DriverRegistry,
    events: EventBus,
    transport: Mutex<Option<Transport>>,
    drivers: RwLock<Drivers>,
    callbacks: Mutex<Vec<(CallbackId, EventCallback)>>,
    next_callback: AtomicU64,
    positions: Mutex<PositionBlock>,
    config_block: Mutex<ConfigBlock>,
    /// Serializes initialize, reconnect, disconnect_all and configuration changes
    lifecycle: AsyncMutex<()>,
    dispatcher: JoinHandle<()>,
}

impl Shared {
    fn drivers(&self) -> Vec<(Axis, Arc<dyn AxisDriver>)> {
        read(&self.drivers)
            .iter()
            .map(|(axis, driver)| (*axis, Arc::clone(driver)))
            .collect()
    }

    fn transport(&self) -> Option<Transport> {
        lock(&self.transport).clone()
    }

    /// A hard transport failure takes every axis down until `reconnect`
    async fn escalate(&self, error: &StageError) {
        if !error.is_transport_fatal() {
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };
        if transport.is_open().await {
            return;
        }
        let drivers = self.drivers();
        if drivers
            .iter()
            .all(|(_, driver)| driver.snapshot().state == MotorState::Error)
        {
            return;
        }
        error!(
            "Transport {} lost ({}); all axes faulted until reconnect",
            transport.name(),
            error
        );
        for (_, driver) in drivers {
            driver.mark_fault(&error.to_string());
        }
    }

    fn position_snapshot(&self) -> PositionSnapshot {
        let units = read(&self.config)
            .units
            .get(&Axis::X)
            .cloned()
            .unwrap_or_else(|| DEFAULT_UNITS.to_string());
        let mut snapshot = PositionSnapshot {
            timestamp: monotonic_seconds(),
            units,
            ..Default::default()
        };
        for (axis, driver) in self.drivers() {
            let axis_snapshot = driver.snapshot();
            snapshot.positions[axis.to_index()] = axis_snapshot.position.actual;
            snapshot.is_homed[axis.to_index()] = axis_snapshot.is_homed;
        }
        snapshot
    }

    fn publish_positions(&self) {
        let snapshot = self.position_snapshot();
        if let Err(e) = lock(&self.positions).publish(&snapshot) {
            warn!("Failed to publish positions: {}", e);
        }
    }

    fn run_callbacks(&self, event: &MotorEvent) {
        let callbacks: Vec<_> = lock(&self.callbacks)
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Event callback {:?} panicked on {:?}", id, event.kind);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Drains the event bus: refreshes shared memory after terminal events and runs callbacks
async fn dispatch(shared: Weak<Shared>, mut rx: broadcast::Receiver<MotorEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event dispatcher fell behind; {} events dropped", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if event.kind.changes_position() {
            shared.publish_positions();
        }
        // Failures inside spawned move trackers only reach the manager here
        if event.kind == EventKind::Error {
            if let Some(error) = event.error() {
                shared.escalate(error).await;
            }
        }
        shared.run_callbacks(&event);
    }
    debug!("Event dispatcher stopped");
}

/// Orchestrates the axes of one stage. Cheap to clone.
#[derive(Clone)]
pub struct StageManager {
    shared: Arc<Shared>,
}

impl StageManager {
    /// Manager that opens `config.com_port` on first initialization
    pub async fn new(config: StageConfiguration, shm: ShmOptions) -> Result<Self> {
        Self::build(config, shm, None)
    }

    /// Manager using an already-open transport
    pub async fn with_transport(
        config: StageConfiguration,
        shm: ShmOptions,
        transport: Transport,
    ) -> Result<Self> {
        Self::build(config, shm, Some(transport))
    }

    fn build(
        config: StageConfiguration,
        shm: ShmOptions,
        transport: Option<Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let positions = PositionBlock::create(&shm.dir, &shm.position_name)?;
        let mut config_block = ConfigBlock::create(&shm.dir, &shm.config_name)?;
        config_block.write(&config)?;

        let events = EventBus::new();
        let rx = events.subscribe();
        info!(
            "Stage manager on {} (shared memory '{}', '{}' in {})",
            config.com_port,
            shm.position_name,
            shm.config_name,
            shm.dir.display()
        );

        let shared = Arc::new_cyclic(|weak| Shared {
            config: RwLock::new(config),
            registry: registry::global_registry(),
            events,
            transport: Mutex::new(transport),
            drivers: RwLock::new(BTreeMap::new()),
            callbacks: Mutex::new(Vec::new()),
            next_callback: AtomicU64::new(1),
            positions: Mutex::new(positions),
            config_block: Mutex::new(config_block),
            lifecycle: AsyncMutex::new(()),
            dispatcher: tokio::spawn(dispatch(weak.clone(), rx)),
        });
        Ok(Self { shared })
    }

    pub fn config(&self) -> StageConfiguration {
        read(&self.shared.config).clone()
    }

    pub fn initialized_axes(&self) -> Vec<Axis> {
        read(&self.shared.drivers).keys().copied().collect()
    }

    fn driver(&self, axis: Axis) -> Result<Arc<dyn AxisDriver>> {
        read(&self.shared.drivers)
            .get(&axis)
            .cloned()
            .ok_or(StageError::NotConnected(axis))
    }

    fn open_transport(&self) -> Result<Transport> {
        let mut slot = lock(&self.shared.transport);
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }
        let config = self.config();
        let transport =
            Transport::open(&config.com_port, config.baudrate, config.transport_timeout()?)?;
        *slot = Some(transport.clone());
        Ok(transport)
    }

    async fn escalate(&self, error: &StageError) {
        self.shared.escalate(error).await;
    }

    // ----- lifecycle -----

    /// Build and connect drivers for `axes`. Axes already initialized are left alone.
    pub async fn initialize(&self, axes: &[Axis]) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.initialize_locked(axes).await
    }

    async fn initialize_locked(&self, axes: &[Axis]) -> Result<()> {
        let config = self.config();
        let timing = config.timing()?;
        let transport = self.open_transport()?;

        for &axis in axes {
            if read(&self.shared.drivers).contains_key(&axis) {
                debug!("Axis {} already initialized", axis);
                continue;
            }
            let motor_config = config.motor_config(axis)?;
            let key = motor_config.driver.clone();
            let driver = self.shared.registry.create(
                &key,
                DriverParams {
                    axis,
                    transport: transport.clone(),
                    config: motor_config,
                    timing,
                    events: self.shared.events.clone(),
                },
            )?;
            if let Err(e) = driver.connect().await {
                error!("Failed to connect axis {}: {}", axis, e);
                self.escalate(&e).await;
                return Err(e);
            }
            write(&self.shared.drivers).insert(axis, driver);
            info!("Axis {} initialized with driver '{}'", axis, key);
        }

        self.shared.publish_positions();
        Ok(())
    }

    /// Disconnect one axis and forget its driver
    pub async fn disconnect(&self, axis: Axis) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let removed = write(&self.shared.drivers).remove(&axis);
        let driver = removed.ok_or(StageError::NotConnected(axis))?;
        driver.disconnect().await?;
        self.shared.publish_positions();
        Ok(())
    }

    /// Disconnect every axis and close the transport
    pub async fn disconnect_all(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.disconnect_all_locked().await;
    }

    async fn disconnect_all_locked(&self) {
        let drivers = std::mem::take(&mut *write(&self.shared.drivers));
        for (axis, driver) in drivers {
            if let Err(e) = driver.disconnect().await {
                warn!("Disconnect of axis {} failed: {}", axis, e);
            }
        }
        let transport = lock(&self.shared.transport).take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.shared.publish_positions();
        info!("All axes disconnected");
    }

    /// Reopen the transport and rebuild every initialized axis
    pub async fn reconnect(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let axes = self.initialized_axes();
        warn!("Reconnecting {:?}", axes);
        self.disconnect_all_locked().await;
        self.initialize_locked(&axes).await
    }

    // ----- homing -----

    /// Discover both limits of one axis and store them in the configuration
    pub async fn home_limits(&self, axis: Axis) -> Result<(f64, f64)> {
        let driver = self.driver(axis)?;
        let result = driver.home_limits().await;
        match &result {
            Ok(limits) => self.store_limits(axis, *limits),
            Err(e) => self.escalate(e).await,
        }
        self.shared.publish_positions();
        result
    }

    /// Home one axis or every initialized axis, one after another
    pub async fn home_limits_for(
        &self,
        selector: AxisSelector,
    ) -> BTreeMap<Axis, Result<(f64, f64)>> {
        let axes = match selector {
            AxisSelector::One(axis) => vec![axis],
            AxisSelector::All => self.initialized_axes(),
        };
        let mut results = BTreeMap::new();
        for axis in axes {
            results.insert(axis, self.home_limits(axis).await);
        }
        results
    }

    /// Single-switch homing; returns the position recorded at the switch
    pub async fn home(&self, axis: Axis, direction: HomeDirection) -> Result<f64> {
        let driver = self.driver(axis)?;
        let result = driver.home(direction).await;
        match &result {
            Ok(_) => self.store_limits(axis, driver.snapshot().config.position_limits),
            Err(e) => self.escalate(e).await,
        }
        self.shared.publish_positions();
        result
    }

    fn store_limits(&self, axis: Axis, limits: (f64, f64)) {
        let config = {
            let mut config = write(&self.shared.config);
            config.position_limits.insert(axis, limits);
            config.clone()
        };
        if let Err(e) = lock(&self.shared.config_block).write(&config) {
            warn!("Failed to publish limits for axis {}: {}", axis, e);
        }
    }

    // ----- motion -----

    /// Move one axis. A velocity override is restored once the move has finished.
    pub async fn move_single_axis(
        &self,
        axis: Axis,
        target: f64,
        relative: bool,
        velocity: Option<f64>,
        wait: bool,
    ) -> Result<MoveHandle> {
        let driver = self.driver(axis)?;
        let restore = match velocity {
            Some(velocity) => {
                let previous = driver.snapshot().config.velocity;
                driver.set_velocity(velocity).await?;
                Some(previous)
            }
            None => None,
        };

        let result = if relative {
            driver.move_relative(target, wait).await
        } else {
            driver.move_absolute(target, wait).await
        };

        if let Some(previous) = restore {
            match (&result, wait) {
                (Ok(handle), false) => {
                    let handle = handle.clone();
                    let driver = Arc::clone(&driver);
                    tokio::spawn(async move {
                        let _ = handle.wait().await;
                        restore_velocity(driver.as_ref(), previous).await;
                    });
                }
                _ => restore_velocity(driver.as_ref(), previous).await,
            }
        }

        if let Err(e) = &result {
            self.escalate(e).await;
        }
        if wait || result.is_err() {
            self.shared.publish_positions();
        }
        result
    }

    /// Move several axes and report the outcome per axis
    pub async fn move_multiple_axes(&self, command: MoveCommand) -> BTreeMap<Axis, Result<Position>> {
        let mut results = BTreeMap::new();
        if command.targets.is_empty() {
            return results;
        }
        let relative = command.relative;
        let velocity = command.velocity;
        info!(
            "Moving {:?} ({}, {})",
            command.targets,
            if relative { "relative" } else { "absolute" },
            if command.coordinated { "coordinated" } else { "independent" }
        );

        // Start every axis
        let mut handles = BTreeMap::new();
        if command.coordinated {
            let mut starts = JoinSet::new();
            for (&axis, &target) in &command.targets {
                let manager = self.clone();
                starts.spawn(async move {
                    let started = manager
                        .move_single_axis(axis, target, relative, velocity, false)
                        .await;
                    (axis, started)
                });
            }
            while let Some(joined) = starts.join_next().await {
                match joined {
                    Ok((axis, Ok(handle))) => {
                        handles.insert(axis, handle);
                    }
                    Ok((axis, Err(e))) => {
                        results.insert(axis, Err(e));
                    }
                    Err(e) => error!("Move start task failed: {}", e),
                }
            }
        } else {
            for (&axis, &target) in &command.targets {
                match self
                    .move_single_axis(axis, target, relative, velocity, false)
                    .await
                {
                    Ok(handle) => {
                        handles.insert(axis, handle);
                    }
                    Err(e) => {
                        results.insert(axis, Err(e));
                    }
                }
            }
        }

        let mut stopping = false;
        if command.coordinated && (!results.is_empty() || handles.len() < command.targets.len()) {
            warn!("Coordinated move could not start on every axis; stopping the rest");
            stopping = true;
            self.stop_axes(handles.keys().copied()).await;
        }

        // Wait for every started axis
        let mut waits = JoinSet::new();
        for (axis, handle) in handles {
            waits.spawn(async move { (axis, handle.wait().await) });
        }
        while let Some(joined) = waits.join_next().await {
            let (axis, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Move wait task failed: {}", e);
                    continue;
                }
            };
            if command.coordinated && !stopping && outcome.is_err() {
                stopping = true;
                warn!("Axis {} failed during coordinated move; stopping the rest", axis);
                let others: Vec<Axis> = command
                    .targets
                    .keys()
                    .copied()
                    .filter(|other| *other != axis && !results.contains_key(other))
                    .collect();
                self.stop_axes(others).await;
            }
            results.insert(axis, outcome);
        }

        for &axis in command.targets.keys() {
            results
                .entry(axis)
                .or_insert(Err(StageError::Cancelled(axis)));
        }
        self.shared.publish_positions();
        results
    }

    async fn stop_axes(&self, axes: impl IntoIterator<Item = Axis>) {
        for axis in axes {
            if let Ok(driver) = self.driver(axis) {
                if let Err(e) = driver.stop().await {
                    warn!("Stop of axis {} failed: {}", axis, e);
                }
            }
        }
    }

    /// Coordinated absolute XY move
    pub async fn move_xy_absolute(&self, x: f64, y: f64) -> BTreeMap<Axis, Result<Position>> {
        self.move_multiple_axes(MoveCommand::absolute([(Axis::X, x), (Axis::Y, y)]))
            .await
    }

    /// Coordinated relative XY move
    pub async fn move_xy_relative(&self, dx: f64, dy: f64) -> BTreeMap<Axis, Result<Position>> {
        self.move_multiple_axes(MoveCommand::relative([(Axis::X, dx), (Axis::Y, dy)]))
            .await
    }

    pub async fn stop_axis(&self, axis: Axis) -> Result<()> {
        let driver = self.driver(axis)?;
        let result = driver.stop().await;
        if let Err(e) = &result {
            self.escalate(e).await;
        }
        self.shared.publish_positions();
        result
    }

    pub async fn stop_all_axes(&self) -> BTreeMap<Axis, Result<()>> {
        self.halt_all(false).await
    }

    /// Abort motion on every axis at once. Returns when no axis is MOVING or HOMING,
    /// even if the transport failed along the way.
    pub async fn emergency_stop(&self) -> BTreeMap<Axis, Result<()>> {
        error!("EMERGENCY STOP");
        self.halt_all(true).await
    }

    async fn halt_all(&self, emergency: bool) -> BTreeMap<Axis, Result<()>> {
        let drivers = self.shared.drivers();
        let mut tasks = JoinSet::new();
        for (axis, driver) in drivers.iter().cloned() {
            tasks.spawn(async move {
                let result = if emergency {
                    driver.emergency_stop().await
                } else {
                    driver.stop().await
                };
                (axis, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((axis, result)) => {
                    if let Err(e) = &result {
                        warn!("Stop of axis {} failed: {}", axis, e);
                    }
                    results.insert(axis, result);
                }
                Err(e) => error!("Stop task failed: {}", e),
            }
        }

        for (axis, driver) in &drivers {
            if driver.snapshot().state.is_busy() {
                driver.mark_fault("stop did not complete");
            }
            results
                .entry(*axis)
                .or_insert(Err(StageError::Cancelled(*axis)));
        }
        if let Some(e) = results.values().find_map(|r| r.as_ref().err()).cloned() {
            self.escalate(&e).await;
        }
        self.shared.publish_positions();
        results
    }

    // ----- queries -----

    /// Fresh reading from the controller
    pub async fn get_position(&self, axis: Axis) -> Result<Position> {
        let driver = self.driver(axis)?;
        let result = driver.get_position().await;
        if let Err(e) = &result {
            self.escalate(e).await;
        }
        self.shared.publish_positions();
        result
    }

    pub async fn get_all_positions(&self) -> BTreeMap<Axis, Result<Position>> {
        let mut positions = BTreeMap::new();
        for (axis, driver) in self.shared.drivers() {
            let result = driver.get_position().await;
            if let Err(e) = &result {
                self.escalate(e).await;
            }
            positions.insert(axis, result);
        }
        self.shared.publish_positions();
        positions
    }

    /// State of one axis; DISCONNECTED if it was never initialized
    pub fn get_state(&self, axis: Axis) -> MotorState {
        self.driver(axis)
            .map(|driver| driver.snapshot().state)
            .unwrap_or(MotorState::Disconnected)
    }

    pub fn is_any_axis_moving(&self) -> bool {
        self.shared
            .drivers()
            .iter()
            .any(|(_, driver)| driver.snapshot().state.is_busy())
    }

    /// Wait until no axis is MOVING or HOMING
    pub async fn wait_for_all_moves_complete(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let poll = self
            .config()
            .timing()
            .map(|timing| timing.status_poll_interval)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_STATUS_POLL_INTERVAL_S));
        loop {
            let busy = self
                .shared
                .drivers()
                .into_iter()
                .find(|(_, driver)| driver.snapshot().state.is_busy());
            let Some((axis, _)) = busy else {
                return Ok(());
            };
            if Instant::now() >= deadline {
                return Err(StageError::MotionTimeout { axis, timeout });
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn get_status(&self) -> StageStatus {
        let connected = match self.shared.transport() {
            Some(transport) => transport.is_open().await,
            None => false,
        };
        let mut axes = BTreeMap::new();
        let mut moving = Vec::new();
        for (axis, driver) in self.shared.drivers() {
            let snapshot = driver.snapshot();
            if snapshot.state.is_busy() {
                moving.push(axis);
            }
            axes.insert(
                axis,
                AxisStatus {
                    state: snapshot.state,
                    driver: driver.driver_key().to_string(),
                    position: snapshot.position.actual,
                    theoretical: snapshot.position.theoretical,
                    units: snapshot.position.units,
                    is_homed: snapshot.is_homed,
                    target: snapshot.target,
                    velocity: snapshot.config.velocity,
                    position_limits: snapshot.config.position_limits,
                },
            );
        }
        StageStatus {
            connected,
            port: self.config().com_port,
            initialized: axes.keys().copied().collect(),
            moving,
            axes,
        }
    }

    /// Contents of the published position block
    pub fn published_positions(&self) -> Result<PositionSnapshot> {
        lock(&self.shared.positions).read()
    }

    // ----- events -----

    pub fn add_event_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&MotorEvent) + Send + Sync + 'static,
    {
        let id = CallbackId(self.shared.next_callback.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.callbacks).push((id, Arc::new(callback)));
        id
    }

    pub fn remove_event_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = lock(&self.shared.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Raw event stream
    pub fn subscribe(&self) -> broadcast::Receiver<MotorEvent> {
        self.shared.events.subscribe()
    }

    // ----- configuration -----

    /// Publish a new configuration and apply it to the running axes
    pub async fn update_config(&self, config: StageConfiguration) -> Result<()> {
        config.validate()?;
        let _lifecycle = self.shared.lifecycle.lock().await;
        lock(&self.shared.config_block).write(&config)?;
        self.apply_config(config).await
    }

    /// Pick up a configuration written to the config block by a peer.
    /// Returns false if it matches the one in use.
    pub async fn reload_config(&self) -> Result<bool> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let loaded: StageConfiguration = lock(&self.shared.config_block).read()?;
        loaded.validate()?;
        if loaded == self.config() {
            return Ok(false);
        }
        info!("Configuration changed in shared memory; applying");
        self.apply_config(loaded).await?;
        Ok(true)
    }

    async fn apply_config(&self, new: StageConfiguration) -> Result<()> {
        let old = std::mem::replace(&mut *write(&self.shared.config), new.clone());
        let axes = self.initialized_axes();

        if old.requires_reinit(&new) {
            info!("Transport or timing settings changed; reinitializing {:?}", axes);
            self.disconnect_all_locked().await;
            return self.initialize_locked(&axes).await;
        }

        let changed: Vec<Axis> = old
            .changed_axes(&new)
            .into_iter()
            .filter(|axis| axes.contains(axis))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }
        info!("Settings changed for {:?}; rebuilding those axes", changed);
        for &axis in &changed {
            let removed = write(&self.shared.drivers).remove(&axis);
            if let Some(driver) = removed {
                driver.disconnect().await?;
            }
        }
        self.initialize_locked(&changed).await
    }
}

async fn restore_velocity(driver: &dyn AxisDriver, velocity: f64) {
    if let Err(e) = driver.restore_velocity(velocity).await {
        warn!(
            "Could not restore velocity {} on axis {}: {}",
            velocity,
            driver.axis(),
            e
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
