//! Dead-reckoning analysis toolbox
//!
//! This crate replays recorded sensor logs through pluggable navigation estimators and reports the
//! resulting trajectory. It is an offline analysis tool: it does not talk to hardware, and it
//! assumes the log has already been captured and time-ordered. The typical use is to compare an
//! attitude-only filter (gyroscope, accelerometer and magnetometer fusion) against a Kalman state
//! estimator on the same recording.
//!
//! This crate is primarily built off of the following dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): vector and unit quaternion types used for all
//!   positions, velocities and orientations.
//! - [`csv`](https://crates.io/crates/csv) and [`serde`](https://crates.io/crates/serde): reading
//!   sensor logs and writing trajectories.
//! - [`clap`](https://crates.io/crates/clap): the command line front end.
//! - [`log`](https://crates.io/crates/log): diagnostics from the replay loop.
//!
//! ## Crate overview
//!
//! - [earth]: geodetic fixes ([earth::GeoPoint]), conversions to and from a local East-North-Up
//!   frame, fix-to-fix distances and the gravity model.
//! - [filter]: the [filter::Estimator] contract every navigation filter implements.
//! - [madgwick]: attitude estimator based on Madgwick's gradient descent fusion.
//! - [kalman]: Kalman position/velocity estimator with gyro-propagated attitude.
//! - [sim]: sensor log CSV schema, the replay driver and trajectory output.
//! - [config]: command line parsing and estimator tuning.
//! - [logging]: logger initialisation for the binary.
//!
//! ## Coordinate and state definitions
//!
//! Every estimator works in a local East-North-Up frame anchored at the first usable GNSS fix it
//! sees. Positions and velocities are `[east, north, up]` vectors in meters and meters per second.
//! Orientation is a unit quaternion rotating body-frame vectors into the local frame; reported
//! uncertainties are per-axis standard deviations (meters for position, radians for roll, pitch
//! and yaw).
//!
//! The IMU data is expected to be raw: the accelerometer senses specific force, so a sensor at
//! rest and level reads approximately `[0, 0, +g]`.
pub mod config;
pub mod earth;
pub mod filter;
pub mod kalman;
pub mod logging;
pub mod madgwick;
pub mod sim;

use nalgebra::Vector3;

use std::fmt::{self, Display};

use crate::earth::GeoPoint;

/// Basic structure for holding raw IMU data in the form of sensed acceleration and angular rate vectors.
///
/// The vectors are in the body frame of the vehicle and perceived by the IMU (i.e. not compensating for gravity).
/// This structure and library is not intended to be a hardware driver for an IMU, thus the data is assumed to be
/// raw.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct IMUData {
    /// Acceleration in m/s^2, body frame x, y, z axis
    pub accel: Vector3<f64>,
    /// Angular rate in rad/s, body frame x, y, z axis
    pub gyro: Vector3<f64>,
}
impl Display for IMUData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IMUData {{ accel: [{:.4}, {:.4}, {:.4}], gyro: [{:.4}, {:.4}, {:.4}] }}",
            self.accel[0], self.accel[1], self.accel[2], self.gyro[0], self.gyro[1], self.gyro[2]
        )
    }
}
impl From<(Vector3<f64>, Vector3<f64>)> for IMUData {
    fn from(data: (Vector3<f64>, Vector3<f64>)) -> Self {
        IMUData {
            accel: data.0,
            gyro: data.1,
        }
    }
}

/// One timestamped bundle of sensor readings from a log.
///
/// Each channel is optional; a sample with no channel at all carries no measurement and is
/// handled as a pure prediction step by the replay driver.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SensorSample {
    /// Time of the sample in seconds
    pub timestamp: f64,
    /// Accelerometer and gyroscope reading
    pub imu: Option<IMUData>,
    /// Magnetometer reading, body frame x, y, z axis (any consistent unit)
    pub magnetometer: Option<Vector3<f64>>,
    /// GNSS fix
    pub gnss: Option<GeoPoint>,
}
impl Display for SensorSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensorSample {{ t: {:.3} s", self.timestamp)?;
        if let Some(imu) = &self.imu {
            write!(f, ", {}", imu)?;
        }
        if let Some(mag) = &self.magnetometer {
            write!(f, ", mag: [{:.3}, {:.3}, {:.3}]", mag[0], mag[1], mag[2])?;
        }
        if let Some(fix) = &self.gnss {
            write!(f, ", {}", fix)?;
        }
        write!(f, " }}")
    }
}
impl SensorSample {
    pub fn new(timestamp: f64) -> SensorSample {
        SensorSample {
            timestamp,
            ..Default::default()
        }
    }
    pub fn with_imu(mut self, accel: Vector3<f64>, gyro: Vector3<f64>) -> SensorSample {
        self.imu = Some(IMUData { accel, gyro });
        self
    }
    pub fn with_magnetometer(mut self, field: Vector3<f64>) -> SensorSample {
        self.magnetometer = Some(field);
        self
    }
    pub fn with_gnss(mut self, fix: GeoPoint) -> SensorSample {
        self.gnss = Some(fix);
        self
    }
    /// True if any sensor channel is present
    pub fn has_measurement(&self) -> bool {
        self.imu.is_some() || self.magnetometer.is_some() || self.gnss.is_some()
    }
    /// The GNSS fix if it is present and passes [`GeoPoint::is_valid`]
    pub fn valid_fix(&self) -> Option<&GeoPoint> {
        self.gnss.as_ref().filter(|fix| fix.is_valid())
    }
}
