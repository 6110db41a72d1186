// End-to-end scenarios against the controller emulator
//
// Each test owns an emulated MMC-100, a manager driving it through the real
// transport and axis drivers, and a private directory for the shared memory
// segments.

use std::time::Duration;

use probe_stage::config::{CONFIG_SHM_NAME, POSITION_SHM_NAME};
use probe_stage::motor::{SimulatedController, Transport};
use probe_stage::shm::{ConfigBlock, PositionBlock, PositionSnapshot};
use probe_stage::{
    Axis, AxisSelector, EventKind, MotorState, ShmOptions, StageConfiguration, StageError,
    StageManager,
};
use tempfile::TempDir;

const TOLERANCE: f64 = 1.0;

struct Bench {
    sim: SimulatedController,
    manager: StageManager,
    dir: TempDir,
}

fn lab_config() -> StageConfiguration {
    let mut config = StageConfiguration::default();
    config.com_port = "/dev/ttyUSB0".to_string();
    config.baudrate = 38_400;
    config.position_tolerance = TOLERANCE;
    config.status_poll_interval = 0.01;
    for axis in Axis::ALL {
        config.velocities.insert(axis, 20_000.0);
        config.position_limits.insert(axis, (-5000.0, 5000.0));
    }
    config
}

async fn bench() -> Bench {
    let sim = SimulatedController::new()
        .with_travel(Axis::X, -3000.0, 4000.0)
        .with_travel(Axis::Y, -5000.0, 5000.0);
    let dir = tempfile::tempdir().unwrap();
    let transport = Transport::from_link(
        "/dev/ttyUSB0",
        Box::new(sim.clone()),
        Duration::from_millis(300),
    );
    let manager =
        StageManager::with_transport(lab_config(), ShmOptions::in_dir(dir.path()), transport)
            .await
            .unwrap();
    manager.initialize(&[Axis::X, Axis::Y]).await.unwrap();
    Bench { sim, manager, dir }
}

fn published(bench: &Bench) -> PositionSnapshot {
    PositionBlock::attach(bench.dir.path(), POSITION_SHM_NAME)
        .unwrap()
        .read()
        .unwrap()
}

#[tokio::test]
async fn s1_home_and_read() {
    let bench = bench().await;

    let (lo, hi) = bench.manager.home_limits(Axis::X).await.unwrap();
    println!("X limits: ({lo}, {hi})");
    assert!(hi > lo);
    assert!((lo + 3000.0).abs() < 1e-3);
    assert!((hi - 4000.0).abs() < 1e-3);

    let status = bench.manager.get_status().await;
    assert!(status.axes[&Axis::X].is_homed);
    assert!(!status.axes[&Axis::Y].is_homed);

    let snapshot = published(&bench);
    assert!(snapshot.is_homed[0]);
    assert!(!snapshot.is_homed[1]);
    assert!(snapshot.position(Axis::X) >= lo && snapshot.position(Axis::X) <= hi);

    // Homed limits land in the shared configuration
    let config: StageConfiguration = ConfigBlock::attach(bench.dir.path(), CONFIG_SHM_NAME)
        .unwrap()
        .read()
        .unwrap();
    assert_eq!(config.position_limits[&Axis::X], (lo, hi));
}

#[tokio::test]
async fn s2_absolute_move() {
    let bench = bench().await;
    let (lo, hi) = bench.manager.home_limits(Axis::X).await.unwrap();
    let midpoint = (lo + hi) / 2.0;

    bench
        .manager
        .move_single_axis(Axis::X, midpoint, false, None, true)
        .await
        .unwrap();

    let position = bench.manager.get_position(Axis::X).await.unwrap();
    assert!((position.actual - midpoint).abs() <= TOLERANCE);
    assert_eq!(bench.manager.get_state(Axis::X), MotorState::Idle);
    assert!((published(&bench).position(Axis::X) - midpoint).abs() <= TOLERANCE);
}

#[tokio::test]
async fn s3_out_of_limits() {
    let bench = bench().await;
    let (_, hi) = bench.manager.home_limits(Axis::X).await.unwrap();

    let err = bench
        .manager
        .move_single_axis(Axis::X, hi + 10.0, false, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::InvalidArgument(_)), "got {err:?}");
    assert_eq!(bench.manager.get_state(Axis::X), MotorState::Idle);
}

#[tokio::test]
async fn s4_stop() {
    let bench = bench().await;
    let mut events = bench.manager.subscribe();

    let handle = bench
        .manager
        .move_single_axis(Axis::Y, 5000.0, true, Some(5000.0), false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    bench.manager.stop_axis(Axis::Y).await.unwrap();

    let cancelled = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.axis == Axis::Y && event.kind == EventKind::MoveFailed {
                return event;
            }
        }
    })
    .await
    .expect("MOVE_FAILED within 200 ms");
    assert_eq!(cancelled.error(), Some(&StageError::Cancelled(Axis::Y)));
    assert_eq!(bench.manager.get_state(Axis::Y), MotorState::Stopped);
    assert_eq!(handle.wait().await, Err(StageError::Cancelled(Axis::Y)));

    // Stopped somewhere short of the target
    let y = bench.manager.get_position(Axis::Y).await.unwrap();
    assert!(y.actual > 0.0 && y.actual < 5000.0);
}

#[tokio::test]
async fn s5_coordinated_xy() {
    let bench = bench().await;
    let homed = bench.manager.home_limits_for(AxisSelector::All).await;
    let (lo_x, hi_x) = homed[&Axis::X].clone().unwrap();
    let (lo_y, hi_y) = homed[&Axis::Y].clone().unwrap();

    for (x, y) in [(lo_x, lo_y), (hi_x, hi_y)] {
        let results = bench.manager.move_xy_absolute(x, y).await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(Result::is_ok), "{results:?}");

        let positions = bench.manager.get_all_positions().await;
        assert!((positions[&Axis::X].as_ref().unwrap().actual - x).abs() <= TOLERANCE);
        assert!((positions[&Axis::Y].as_ref().unwrap().actual - y).abs() <= TOLERANCE);
    }
    assert!(!bench.manager.is_any_axis_moving());
}

#[tokio::test]
async fn homed_axis_stays_within_its_limits() {
    let bench = bench().await;
    let (lo, hi) = bench.manager.home_limits(Axis::X).await.unwrap();

    let within = |actual: f64| lo <= actual && actual <= hi;
    assert!(within(bench.manager.get_position(Axis::X).await.unwrap().actual));

    for target in [lo, hi, (lo + hi) / 2.0, lo + 1.0] {
        bench
            .manager
            .move_single_axis(Axis::X, target, false, None, true)
            .await
            .unwrap();
        let actual = bench.manager.get_position(Axis::X).await.unwrap().actual;
        assert!(within(actual), "{actual} outside [{lo}, {hi}]");
    }

    // Relative moves past either end are refused before anything moves
    for delta in [hi - lo, lo - hi] {
        let err = bench
            .manager
            .move_single_axis(Axis::X, delta, true, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidArgument(_)));
        assert!(within(bench.manager.get_position(Axis::X).await.unwrap().actual));
    }
    assert!(published(&bench).homed(Axis::X));
}

#[tokio::test]
async fn s6_ipc_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let mut writer = PositionBlock::create(dir.path(), POSITION_SHM_NAME).unwrap();
    let mut snapshot = PositionSnapshot {
        timestamp: probe_stage::clock::monotonic_seconds(),
        ..Default::default()
    };
    snapshot.positions[0] = 123.456;
    snapshot.is_homed[0] = true;
    writer.publish(&snapshot).unwrap();

    let path = dir.path().to_path_buf();
    let read = std::thread::spawn(move || {
        let reader = PositionBlock::attach(&path, POSITION_SHM_NAME).unwrap();
        reader.read().unwrap()
    })
    .join()
    .unwrap();

    assert_eq!(read.positions[0], 123.456);
    assert!(read.is_homed[0]);
    assert_eq!(read.timestamp, snapshot.timestamp);
    assert_eq!(read.units, "um");
}

#[tokio::test]
async fn boundary_targets() {
    let bench = bench().await;
    let (lo, hi) = (-5000.0, 5000.0);

    for target in [lo, hi] {
        bench
            .manager
            .move_single_axis(Axis::Y, target, false, None, true)
            .await
            .unwrap();
    }
    for target in [lo - 0.001, hi + 0.001] {
        let err = bench
            .manager
            .move_single_axis(Axis::Y, target, false, None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidArgument(_)));
    }
    let err = bench
        .manager
        .move_single_axis(Axis::Y, 0.0, false, Some(0.0), true)
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::InvalidArgument(_)));
}

#[tokio::test]
async fn busy_axis_rejects_second_move() {
    let bench = bench().await;
    let first = bench
        .manager
        .move_single_axis(Axis::X, 3000.0, false, Some(1000.0), false)
        .await
        .unwrap();

    let err = bench
        .manager
        .move_single_axis(Axis::X, -1000.0, false, None, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StageError::Busy {
            axis: Axis::X,
            state: MotorState::Moving
        }
    ));

    let results = bench.manager.emergency_stop().await;
    assert!(results.values().all(Result::is_ok));
    assert!(!bench.manager.is_any_axis_moving());
    assert_eq!(first.wait().await, Err(StageError::Cancelled(Axis::X)));
}

#[tokio::test]
async fn silent_controller_times_out() {
    let bench = bench().await;
    bench.sim.set_silent(true);

    let err = bench.manager.get_position(Axis::X).await.unwrap_err();
    assert!(matches!(err, StageError::TransportTimeout { .. }), "got {err:?}");
    // A timeout is not a lost port
    assert!(bench.manager.get_status().await.connected);

    bench.sim.set_silent(false);
    bench.manager.get_position(Axis::X).await.unwrap();
}

#[tokio::test]
async fn configuration_round_trip() {
    let mut config = lab_config();
    config.position_limits.insert(Axis::RotationFiber, (-90.0, 90.0));
    config.driver_types.insert(Axis::RotationChip, "stage_control".to_string());
    let json = config.to_json().unwrap();
    assert_eq!(StageConfiguration::from_json(&json).unwrap(), config);
}
