//! Attitude estimator based on Madgwick's gradient descent fusion
//!
//! The orientation is propagated with the gyroscope rate and pulled toward the attitude that
//! aligns the predicted gravity direction (and, when available, the predicted Earth field) with
//! the accelerometer (and magnetometer) reading. The correction is Madgwick's normalised gradient
//! step with gain $\beta$, written in rotation-vector form:
//!
//! $$
//! \omega_c = \omega - 2 \beta \frac{e}{\lVert e \rVert}, \quad
//! e = \hat{g}_b \times a + \hat{b}_b \times m
//! $$
//!
//! where $\hat{g}_b$ and $\hat{b}_b$ are the reference directions rotated into the body frame by
//! the current estimate and $a$, $m$ are the normalised readings. The quaternion then advances by
//! $q \otimes \exp(\omega_c \, dt / 2)$.
//!
//! This filter does not estimate translation from inertial data. Position follows valid GNSS
//! fixes in the local frame (velocity by finite difference between fixes) and is extrapolated at
//! constant velocity between them.
//!
//! # References
//! - Madgwick, S. O. H. "An efficient orientation filter for inertial and inertial/magnetic
//!   sensor arrays", 2010.

use log::debug;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::earth::{GeoPoint, LocalFrame};
use crate::filter::{
    Estimator, FilterError, MIN_GRAVITY_NORM, check_time_step, elapsed, fix_sigma,
    initial_attitude,
};
use crate::SensorSample;

/// Tuning for [`MadgwickFilter`]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MadgwickConfig {
    /// Gradient descent gain in rad/s
    pub beta: f64,
    /// Gyroscope angle random walk, rad/√s
    pub gyro_noise: f64,
    /// Roll/pitch noise of an accelerometer levelling, rad
    pub accel_tilt_noise: f64,
    /// Heading noise of a magnetometer reading, rad
    pub mag_heading_noise: f64,
    /// Position random walk between fixes, m/√s
    pub position_random_walk: f64,
    /// Floor on the standard deviation assigned to a fix, m
    pub min_fix_sigma: f64,
    /// Position standard deviation before the first fix, m
    pub initial_position_sigma: f64,
    /// Orientation standard deviation at initialization, rad
    pub initial_attitude_sigma: f64,
}
impl Default for MadgwickConfig {
    fn default() -> Self {
        MadgwickConfig {
            beta: 0.1,
            gyro_noise: 0.01,
            accel_tilt_noise: 0.02,
            mag_heading_noise: 0.05,
            position_random_walk: 1.0,
            min_fix_sigma: 0.5,
            initial_position_sigma: 100.0,
            initial_attitude_sigma: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
struct AttitudeState {
    timestamp: f64,
    orientation: UnitQuaternion<f64>,
    angular_rate: Vector3<f64>,
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    position_variance: Vector3<f64>,
    attitude_variance: Vector3<f64>,
    last_fix: Option<(f64, Vector3<f64>)>,
}

/// Madgwick attitude filter
#[derive(Clone, Debug, Default)]
pub struct MadgwickFilter {
    config: MadgwickConfig,
    state: Option<AttitudeState>,
    frame: Option<LocalFrame>,
}
impl MadgwickFilter {
    pub fn new(config: MadgwickConfig) -> MadgwickFilter {
        MadgwickFilter {
            config,
            state: None,
            frame: None,
        }
    }
    pub fn config(&self) -> &MadgwickConfig {
        &self.config
    }
    fn state(&self) -> Result<&AttitudeState, FilterError> {
        self.state.as_ref().ok_or(FilterError::NotInitialized)
    }
}

/// One gradient descent corrected gyro integration step.
///
/// # Arguments
/// * `orientation` - current body-to-local rotation.
/// * `gyro` - body angular rate, rad/s.
/// * `accel` - specific force reading; skipped when absent or too small to define a direction.
/// * `magnetometer` - field reading; only used together with a usable accelerometer reading.
/// * `beta` - gain in rad/s.
/// * `dt` - time step in seconds.
pub fn madgwick_step(
    orientation: &UnitQuaternion<f64>,
    gyro: &Vector3<f64>,
    accel: Option<&Vector3<f64>>,
    magnetometer: Option<&Vector3<f64>>,
    beta: f64,
    dt: f64,
) -> UnitQuaternion<f64> {
    let mut error = Vector3::zeros();
    if let Some(gravity) = accel.and_then(|a| a.try_normalize(MIN_GRAVITY_NORM)) {
        let predicted_gravity = orientation.inverse_transform_vector(&Vector3::z());
        error += predicted_gravity.cross(&gravity);
        if let Some(field) = magnetometer.and_then(|m| m.try_normalize(f64::EPSILON)) {
            // reference field: horizontal component toward north (+y), vertical kept
            let local = orientation * field;
            let reference = Vector3::new(0.0, local[0].hypot(local[1]), local[2]);
            let predicted_field = orientation.inverse_transform_vector(&reference);
            error += predicted_field.cross(&field);
        }
    }
    let rate = match error.try_normalize(f64::EPSILON) {
        Some(direction) => gyro - 2.0 * beta * direction,
        None => *gyro,
    };
    orientation * UnitQuaternion::from_scaled_axis(rate * dt)
}

fn fuse_variance(prior: f64, measurement: f64) -> f64 {
    prior * measurement / (prior + measurement)
}

fn propagate(state: &mut AttitudeState, config: &MadgwickConfig, dt: f64) {
    let gyro_growth = config.gyro_noise.powi(2) * dt;
    state.attitude_variance.add_scalar_mut(gyro_growth);
    state.position += state.velocity * dt;
    state
        .position_variance
        .add_scalar_mut(config.position_random_walk.powi(2) * dt);
}

fn fold_fix(
    state: &mut AttitudeState,
    frame: &mut Option<LocalFrame>,
    fix: &GeoPoint,
    sigma: f64,
) {
    let frame = frame.get_or_insert_with(|| LocalFrame::new(*fix));
    let position = frame.to_local(fix);
    if let Some((time, previous)) = state.last_fix
        && state.timestamp > time
    {
        state.velocity = (position - previous) / (state.timestamp - time);
    }
    state.position = position;
    state.position_variance = Vector3::repeat(sigma * sigma);
    state.last_fix = Some((state.timestamp, position));
}

impl Estimator for MadgwickFilter {
    fn initialize(&mut self, sample: &SensorSample) -> Result<(), FilterError> {
        if self.state.is_some() {
            return Err(FilterError::AlreadyInitialized);
        }
        let config = &self.config;
        let fix = sample
            .valid_fix()
            .map(|fix| fix_sigma(fix, config.min_fix_sigma).map(|sigma| (fix, sigma)))
            .transpose()?;
        let mut state = AttitudeState {
            timestamp: sample.timestamp,
            orientation: initial_attitude(sample),
            angular_rate: sample.imu.map(|imu| imu.gyro).unwrap_or_else(Vector3::zeros),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            position_variance: Vector3::repeat(config.initial_position_sigma.powi(2)),
            attitude_variance: Vector3::repeat(config.initial_attitude_sigma.powi(2)),
            last_fix: None,
        };
        self.frame = None;
        if let Some((fix, sigma)) = fix {
            fold_fix(&mut state, &mut self.frame, fix, sigma);
        }
        debug!("{} initialized at t = {:.3} s", self.get_name(), sample.timestamp);
        self.state = Some(state);
        Ok(())
    }
    fn update(&mut self, sample: &SensorSample) -> Result<(), FilterError> {
        let config = &self.config;
        let state = self.state.as_mut().ok_or(FilterError::NotInitialized)?;
        let dt = elapsed(state.timestamp, sample.timestamp)?;
        let fix = sample
            .valid_fix()
            .map(|fix| fix_sigma(fix, config.min_fix_sigma).map(|sigma| (fix, sigma)))
            .transpose()?;
        state.timestamp = sample.timestamp;
        propagate(state, config, dt);
        match sample.imu {
            Some(imu) => {
                state.orientation = madgwick_step(
                    &state.orientation,
                    &imu.gyro,
                    Some(&imu.accel),
                    sample.magnetometer.as_ref(),
                    config.beta,
                    dt,
                );
                state.angular_rate = imu.gyro;
                if imu.accel.norm() >= MIN_GRAVITY_NORM {
                    let tilt = config.accel_tilt_noise.powi(2);
                    state.attitude_variance[0] = fuse_variance(state.attitude_variance[0], tilt);
                    state.attitude_variance[1] = fuse_variance(state.attitude_variance[1], tilt);
                    if sample.magnetometer.is_some() {
                        state.attitude_variance[2] = fuse_variance(
                            state.attitude_variance[2],
                            config.mag_heading_noise.powi(2),
                        );
                    }
                }
            }
            None => {
                state.orientation *= UnitQuaternion::from_scaled_axis(state.angular_rate * dt);
            }
        }
        match (&sample.gnss, fix) {
            (_, Some((fix, sigma))) => fold_fix(state, &mut self.frame, fix, sigma),
            (Some(fix), None) => debug!("ignoring invalid fix at t = {:.3} s: {}", sample.timestamp, fix),
            (None, None) => {}
        }
        Ok(())
    }
    fn predict(&mut self, dt: f64) -> Result<(), FilterError> {
        let config = &self.config;
        let state = self.state.as_mut().ok_or(FilterError::NotInitialized)?;
        let dt = check_time_step(dt)?;
        state.timestamp += dt;
        state.orientation *= UnitQuaternion::from_scaled_axis(state.angular_rate * dt);
        propagate(state, config, dt);
        Ok(())
    }
    fn get_orientation(&self) -> Result<UnitQuaternion<f64>, FilterError> {
        Ok(self.state()?.orientation)
    }
    fn get_position(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.position)
    }
    fn get_velocity(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.velocity)
    }
    fn get_position_uncertainty(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.position_variance.map(f64::sqrt))
    }
    fn get_orientation_uncertainty(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.attitude_variance.map(f64::sqrt))
    }
    fn reset(&mut self) {
        self.state = None;
        self.frame = None;
    }
    fn get_name(&self) -> &str {
        "Madgwick"
    }
    fn local_frame(&self) -> Option<&LocalFrame> {
        self.frame.as_ref()
    }
}
