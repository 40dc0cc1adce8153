//! Navigation estimator contract
//!
//! Every navigation filter in this crate implements [`Estimator`]. Callers (the replay driver,
//! the command line tool, tests) program only against this trait and select the concrete filter
//! at construction time, usually as a `Box<dyn Estimator>`.
//!
//! # Lifecycle
//!
//! ```text
//!  Uninitialized --initialize--> Initialized --update/predict--> Initialized
//!        ^                                                           |
//!        +---------------------------- reset ------------------------+
//! ```
//!
//! `update` and `predict` are only valid in the Initialized state, as are the state and
//! uncertainty accessors. Misuse is reported through [`FilterError`]; an estimator never computes
//! on an uninitialized state.
//!
//! Samples must be presented in non-decreasing timestamp order. `update` measures elapsed time
//! from the previous step itself; `predict` takes the elapsed time explicitly because it receives
//! no sample.

use nalgebra::{UnitQuaternion, Vector3};
use thiserror::Error;

use crate::SensorSample;
use crate::earth::{GeoPoint, GeodeticError, LocalFrame};

/// Smallest accelerometer norm (m/s^2) that is trusted as a gravity direction
pub const MIN_GRAVITY_NORM: f64 = 1e-6;

/// Errors reported by estimators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("estimator used before initialize()")]
    NotInitialized,

    #[error("estimator already initialized; call reset() first")]
    AlreadyInitialized,

    #[error("sample at t = {current} s is earlier than the previous step at t = {previous} s")]
    TimeReversal { previous: f64, current: f64 },

    #[error("invalid prediction time step: {0} s")]
    InvalidTimeStep(f64),

    #[error("innovation covariance is singular")]
    SingularInnovation,

    #[error("GNSS fix accuracy {0} m is not finite")]
    InvalidAccuracy(f64),

    #[error("correction produced a non-finite state")]
    NonFiniteCorrection,

    #[error(transparent)]
    Geodetic(#[from] GeodeticError),
}

/// Capability set shared by all navigation estimators.
pub trait Estimator {
    /// Seed orientation, position, velocity and their uncertainties from the first sample.
    /// Must be called exactly once before any `update` or `predict`.
    fn initialize(&mut self, sample: &SensorSample) -> Result<(), FilterError>;
    /// Measurement step: propagate to the sample's timestamp and fold in its readings.
    fn update(&mut self, sample: &SensorSample) -> Result<(), FilterError>;
    /// Dead-reckoning step over `dt` seconds using only the motion model. No component of the
    /// position or orientation uncertainty decreases across a predict.
    fn predict(&mut self, dt: f64) -> Result<(), FilterError>;
    /// Orientation of the body frame relative to the local ENU frame
    fn get_orientation(&self) -> Result<UnitQuaternion<f64>, FilterError>;
    /// Position in the local ENU frame, meters
    fn get_position(&self) -> Result<Vector3<f64>, FilterError>;
    /// Velocity in the local ENU frame, meters per second
    fn get_velocity(&self) -> Result<Vector3<f64>, FilterError>;
    /// Per-axis position standard deviation (east, north, up), meters
    fn get_position_uncertainty(&self) -> Result<Vector3<f64>, FilterError>;
    /// Per-axis orientation standard deviation (roll, pitch, yaw), radians
    fn get_orientation_uncertainty(&self) -> Result<Vector3<f64>, FilterError>;
    /// Discard all state and return to the uninitialized condition
    fn reset(&mut self);
    /// Stable human readable identifier of the algorithm
    fn get_name(&self) -> &str;
    /// Frame the position is expressed in, once anchored at a valid GNSS fix
    fn local_frame(&self) -> Option<&LocalFrame>;

    fn is_initialized(&self) -> bool {
        self.get_position().is_ok()
    }
}

/// Elapsed time between two steps.
///
/// # Errors
/// [`FilterError::TimeReversal`] when `current` is earlier than `previous`.
pub fn elapsed(previous: f64, current: f64) -> Result<f64, FilterError> {
    if current < previous {
        return Err(FilterError::TimeReversal { previous, current });
    }
    Ok(current - previous)
}

/// Reject negative or non-finite prediction steps
pub fn check_time_step(dt: f64) -> Result<f64, FilterError> {
    if !dt.is_finite() || dt < 0.0 {
        return Err(FilterError::InvalidTimeStep(dt));
    }
    Ok(dt)
}

/// Standard deviation assigned to a fix: its accuracy floored at `min_sigma`.
///
/// # Errors
/// [`FilterError::InvalidAccuracy`] when the accuracy is NaN or infinite.
pub fn fix_sigma(fix: &GeoPoint, min_sigma: f64) -> Result<f64, FilterError> {
    if !fix.accuracy.is_finite() {
        return Err(FilterError::InvalidAccuracy(fix.accuracy));
    }
    Ok(fix.accuracy.max(min_sigma))
}

/// Initial orientation from a single sample.
///
/// Roll and pitch level the body so the sensed specific force points up; yaw is the
/// tilt-compensated magnetic heading when a magnetometer reading is present (zero yaw means the
/// body x axis points east). Without an accelerometer reading the identity is returned.
pub fn initial_attitude(sample: &SensorSample) -> UnitQuaternion<f64> {
    let Some(imu) = sample.imu else {
        return UnitQuaternion::identity();
    };
    let accel = imu.accel;
    if accel.norm() < MIN_GRAVITY_NORM {
        return UnitQuaternion::identity();
    }
    let roll = accel[1].atan2(accel[2]);
    let pitch = (-accel[0]).atan2((accel[1] * accel[1] + accel[2] * accel[2]).sqrt());
    let yaw = match sample.magnetometer {
        Some(field) if field.norm() > 0.0 => {
            let level = UnitQuaternion::from_euler_angles(roll, pitch, 0.0) * field;
            level[0].atan2(level[1])
        }
        _ => 0.0,
    };
    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}
