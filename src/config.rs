// Defaults, timeouts and the stage configuration record
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};
use crate::motor::{Axis, DEFAULT_UNITS};

// Serial link
pub const DEFAULT_COM_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = crate::motor::protocol::DEFAULT_BAUDRATE;
pub const DEFAULT_TIMEOUT_S: f64 = 0.3;

// Completion detection
pub const DEFAULT_POSITION_TOLERANCE: f64 = 1.0; // um
pub const DEFAULT_STATUS_POLL_INTERVAL_S: f64 = 0.05;
pub const DEFAULT_MOVE_TIMEOUT_S: f64 = 30.0;
pub const DEFAULT_HOMING_TIMEOUT_S: f64 = 60.0;

// Hardware maxima (um/s, um/s^2)
pub const DEFAULT_MAX_VELOCITY: f64 = 20_000.0;
pub const DEFAULT_MAX_ACCELERATION: f64 = 50_000.0;

/// Registry key of the MMC-100 serial driver
pub const DEFAULT_DRIVER: &str = "stage_control";

// Shared memory block names
pub const POSITION_SHM_NAME: &str = "stage_position";
pub const CONFIG_SHM_NAME: &str = "stage_config";
pub const LDC_CONFIG_SHM_NAME: &str = "ldc_config";

fn per_axis<T: Clone>(values: [T; 5]) -> BTreeMap<Axis, T> {
    Axis::ALL.into_iter().zip(values).collect()
}

fn default_max_velocities() -> BTreeMap<Axis, f64> {
    per_axis([DEFAULT_MAX_VELOCITY; 5])
}

fn default_max_accelerations() -> BTreeMap<Axis, f64> {
    per_axis([DEFAULT_MAX_ACCELERATION; 5])
}

fn default_units() -> BTreeMap<Axis, String> {
    per_axis([(); 5].map(|_| DEFAULT_UNITS.to_string()))
}

fn default_position_tolerance() -> f64 {
    DEFAULT_POSITION_TOLERANCE
}

fn default_status_poll_interval() -> f64 {
    DEFAULT_STATUS_POLL_INTERVAL_S
}

fn default_move_timeout() -> f64 {
    DEFAULT_MOVE_TIMEOUT_S
}

fn default_homing_timeout() -> f64 {
    DEFAULT_HOMING_TIMEOUT_S
}

/// Stage configuration shared with cooperating processes.
///
/// Per-axis maps are keyed by axis name in JSON. Everything after
/// `driver_types` is optional on load and falls back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfiguration {
    pub com_port: String,
    pub baudrate: u32,
    /// Serial reply timeout, seconds
    pub timeout: f64,
    pub velocities: BTreeMap<Axis, f64>,
    pub accelerations: BTreeMap<Axis, f64>,
    pub position_limits: BTreeMap<Axis, (f64, f64)>,
    pub driver_types: BTreeMap<Axis, String>,
    #[serde(default = "default_max_velocities")]
    pub max_velocities: BTreeMap<Axis, f64>,
    #[serde(default = "default_max_accelerations")]
    pub max_accelerations: BTreeMap<Axis, f64>,
    #[serde(default = "default_units")]
    pub units: BTreeMap<Axis, String>,
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval: f64,
    #[serde(default = "default_move_timeout")]
    pub move_timeout: f64,
    #[serde(default = "default_homing_timeout")]
    pub homing_timeout: f64,
}

impl Default for StageConfiguration {
    fn default() -> Self {
        Self {
            com_port: DEFAULT_COM_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            timeout: DEFAULT_TIMEOUT_S,
            velocities: per_axis([2000.0, 2000.0, 2000.0, 1000.0, 100.0]),
            accelerations: per_axis([100.0, 100.0, 100.0, 500.0, 500.0]),
            position_limits: per_axis([
                (-24_940.0, 20_000.0),
                (-30_400.0, 20_000.0),
                (-11_100.0, 20_000.0),
                (-180.0, 180.0),
                (-180.0, 180.0),
            ]),
            driver_types: per_axis([(); 5].map(|_| DEFAULT_DRIVER.to_string())),
            max_velocities: default_max_velocities(),
            max_accelerations: default_max_accelerations(),
            units: default_units(),
            position_tolerance: DEFAULT_POSITION_TOLERANCE,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL_S,
            move_timeout: DEFAULT_MOVE_TIMEOUT_S,
            homing_timeout: DEFAULT_HOMING_TIMEOUT_S,
        }
    }
}

/// Per-axis settings cached by a driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub velocity: f64,
    pub acceleration: f64,
    pub max_velocity: f64,
    pub max_acceleration: f64,
    pub position_limits: (f64, f64),
    pub units: String,
    pub driver: String,
}

impl MotorConfig {
    pub fn contains(&self, target: f64) -> bool {
        let (lo, hi) = self.position_limits;
        lo <= target && target <= hi
    }

    pub fn check_velocity(&self, velocity: f64) -> Result<()> {
        check_rate("velocity", velocity, self.max_velocity)
    }

    pub fn check_acceleration(&self, acceleration: f64) -> Result<()> {
        check_rate("acceleration", acceleration, self.max_acceleration)
    }
}

fn check_rate(what: &str, value: f64, max: f64) -> Result<()> {
    if !(value > 0.0 && value <= max) {
        return Err(StageError::InvalidArgument(format!(
            "{what} {value} must be positive and at most {max}"
        )));
    }
    Ok(())
}

/// Completion detection settings shared by every axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionTiming {
    pub position_tolerance: f64,
    pub status_poll_interval: Duration,
    pub move_timeout: Duration,
    pub homing_timeout: Duration,
}

fn seconds(what: &str, value: f64) -> Result<Duration> {
    if !(value > 0.0) {
        return Err(StageError::InvalidConfig(format!("{what} must be positive, got {value}")));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| StageError::InvalidConfig(format!("{what}: {e}")))
}

impl StageConfiguration {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StageError::InvalidConfig(e.to_string()))
    }

    pub fn transport_timeout(&self) -> Result<Duration> {
        seconds("timeout", self.timeout)
    }

    pub fn timing(&self) -> Result<MotionTiming> {
        if !(self.position_tolerance >= 0.0) {
            return Err(StageError::InvalidConfig(format!(
                "position_tolerance must not be negative, got {}",
                self.position_tolerance
            )));
        }
        Ok(MotionTiming {
            position_tolerance: self.position_tolerance,
            status_poll_interval: seconds("status_poll_interval", self.status_poll_interval)?,
            move_timeout: seconds("move_timeout", self.move_timeout)?,
            homing_timeout: seconds("homing_timeout", self.homing_timeout)?,
        })
    }

    /// Settings for one axis, validated
    pub fn motor_config(&self, axis: Axis) -> Result<MotorConfig> {
        let missing = |field: &str| StageError::InvalidConfig(format!("{field} has no entry for {axis}"));

        let config = MotorConfig {
            velocity: *self.velocities.get(&axis).ok_or_else(|| missing("velocities"))?,
            acceleration: *self.accelerations.get(&axis).ok_or_else(|| missing("accelerations"))?,
            max_velocity: self
                .max_velocities
                .get(&axis)
                .copied()
                .unwrap_or(DEFAULT_MAX_VELOCITY),
            max_acceleration: self
                .max_accelerations
                .get(&axis)
                .copied()
                .unwrap_or(DEFAULT_MAX_ACCELERATION),
            position_limits: *self
                .position_limits
                .get(&axis)
                .ok_or_else(|| missing("position_limits"))?,
            units: self
                .units
                .get(&axis)
                .cloned()
                .unwrap_or_else(|| DEFAULT_UNITS.to_string()),
            driver: self
                .driver_types
                .get(&axis)
                .cloned()
                .ok_or_else(|| missing("driver_types"))?,
        };

        let (lo, hi) = config.position_limits;
        if !(lo <= hi) {
            return Err(StageError::InvalidConfig(format!(
                "position limits for {axis} are inverted: ({lo}, {hi})"
            )));
        }
        config
            .check_velocity(config.velocity)
            .and_then(|()| config.check_acceleration(config.acceleration))
            .map_err(|e| StageError::InvalidConfig(format!("{axis}: {e}")))?;
        if config.units.len() >= 16 {
            return Err(StageError::InvalidConfig(format!("units for {axis} too long")));
        }
        Ok(config)
    }

    /// Check every field that the drivers and transport depend on
    pub fn validate(&self) -> Result<()> {
        if self.com_port.is_empty() {
            return Err(StageError::InvalidConfig("com_port is empty".to_string()));
        }
        if self.baudrate == 0 {
            return Err(StageError::InvalidConfig("baudrate must be positive".to_string()));
        }
        self.transport_timeout()?;
        self.timing()?;
        for axis in self.driver_types.keys() {
            self.motor_config(*axis)?;
        }
        Ok(())
    }

    /// Transport or completion settings differ: every axis must be rebuilt
    pub fn requires_reinit(&self, other: &StageConfiguration) -> bool {
        self.com_port != other.com_port
            || self.baudrate != other.baudrate
            || self.timeout != other.timeout
            || self.position_tolerance != other.position_tolerance
            || self.status_poll_interval != other.status_poll_interval
            || self.move_timeout != other.move_timeout
            || self.homing_timeout != other.homing_timeout
    }

    /// Axes whose per-axis settings differ between the two configurations
    pub fn changed_axes(&self, other: &StageConfiguration) -> Vec<Axis> {
        Axis::ALL
            .into_iter()
            .filter(|axis| self.motor_config(*axis).ok() != other.motor_config(*axis).ok())
            .collect()
    }
}

/// Where the shared memory blocks live
#[derive(Debug, Clone, PartialEq)]
pub struct ShmOptions {
    /// Directory backing named segments (`/dev/shm` on Linux)
    pub dir: PathBuf,
    pub position_name: String,
    pub config_name: String,
}

impl Default for ShmOptions {
    fn default() -> Self {
        let dir = if cfg!(target_os = "linux") {
            PathBuf::from("/dev/shm")
        } else {
            std::env::temp_dir()
        };
        Self {
            dir,
            position_name: POSITION_SHM_NAME.to_string(),
            config_name: CONFIG_SHM_NAME.to_string(),
        }
    }
}

impl ShmOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = StageConfiguration::default();
        config.validate().unwrap();
        assert_eq!(config.com_port, "/dev/ttyUSB0");
        assert_eq!(config.baudrate, 38_400);
        assert_eq!(config.driver_types[&Axis::Z], "stage_control");
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = StageConfiguration::default();
        config.position_limits.insert(Axis::X, (0.0, 30_406.57));
        config.velocities.insert(Axis::RotationChip, 250.0);

        let json = config.to_json().unwrap();
        assert!(json.contains("\"ROTATION_FIBER\""));
        assert!(json.contains("\"position_limits\""));

        let back = StageConfiguration::from_json(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_minimal_schema_loads_with_defaults() {
        let json = r#"{
            "com_port": "/dev/ttyUSB1", "baudrate": 38400, "timeout": 0.3,
            "velocities": {"X": 2000.0},
            "accelerations": {"X": 100.0},
            "position_limits": {"X": [0.0, 10000.0]},
            "driver_types": {"X": "stage_control"}
        }"#;
        let config = StageConfiguration::from_json(json).unwrap();
        assert_eq!(config.position_limits[&Axis::X], (0.0, 10_000.0));
        assert_eq!(config.move_timeout, DEFAULT_MOVE_TIMEOUT_S);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_axis_key_rejected() {
        let json = r#"{
            "com_port": "/dev/ttyUSB1", "baudrate": 38400, "timeout": 0.3,
            "velocities": {"W": 2000.0}, "accelerations": {},
            "position_limits": {}, "driver_types": {}
        }"#;
        assert!(matches!(
            StageConfiguration::from_json(json),
            Err(StageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = StageConfiguration::default();
        config.position_limits.insert(Axis::Y, (10.0, -10.0));
        assert!(matches!(config.validate(), Err(StageError::InvalidConfig(_))));

        let mut config = StageConfiguration::default();
        config.velocities.insert(Axis::X, 0.0);
        assert!(config.validate().is_err());

        let mut config = StageConfiguration::default();
        config.velocities.insert(Axis::X, DEFAULT_MAX_VELOCITY * 2.0);
        assert!(config.validate().is_err());

        let mut config = StageConfiguration::default();
        config.move_timeout = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_motor_config_checks() {
        let motor = StageConfiguration::default().motor_config(Axis::X).unwrap();
        assert!(motor.contains(-24_940.0));
        assert!(motor.contains(20_000.0));
        assert!(!motor.contains(20_000.1));
        assert!(motor.check_velocity(0.0).is_err());
        assert!(motor.check_velocity(-1.0).is_err());
        assert!(motor.check_velocity(DEFAULT_MAX_VELOCITY).is_ok());
        assert!(motor.check_acceleration(f64::NAN).is_err());
    }

    #[test]
    fn test_change_detection() {
        let old = StageConfiguration::default();
        let mut new = old.clone();
        new.velocities.insert(Axis::Y, 1500.0);
        assert!(!old.requires_reinit(&new));
        assert_eq!(old.changed_axes(&new), vec![Axis::Y]);

        new.com_port = "/dev/ttyUSB1".to_string();
        assert!(old.requires_reinit(&new));
    }
}
