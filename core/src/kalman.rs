//! Kalman-style navigation estimator
//!
//! This module contains a linear Kalman filter over the local-frame position and velocity with a
//! gyro-propagated attitude. It is the closed-loop counterpart of the attitude-only
//! [crate::madgwick] filter: inertial readings drive the motion model and GNSS fixes, converted
//! into the local East-North-Up frame, correct it.

use crate::earth::{self, GeoPoint, LocalFrame};
use crate::filter::{
    Estimator, FilterError, check_time_step, elapsed, fix_sigma, initial_attitude,
};
use crate::SensorSample;

use std::fmt::{self, Debug, Display};

use log::debug;
use nalgebra::{Matrix3, Matrix3x6, Matrix6, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Tuning for [`KalmanFilter`]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// White acceleration noise driving the motion model, m/s^2
    pub acceleration_noise: f64,
    /// Gyroscope angle random walk, rad/√s
    pub gyro_noise: f64,
    /// Floor on the standard deviation assigned to a fix, m
    pub min_fix_sigma: f64,
    /// Position standard deviation before the first fix, m
    pub initial_position_sigma: f64,
    /// Velocity standard deviation at initialization, m/s
    pub initial_velocity_sigma: f64,
    /// Orientation standard deviation at initialization, rad
    pub initial_attitude_sigma: f64,
}
impl Default for KalmanConfig {
    fn default() -> Self {
        KalmanConfig {
            acceleration_noise: 0.5,
            gyro_noise: 0.01,
            min_fix_sigma: 0.5,
            initial_position_sigma: 100.0,
            initial_velocity_sigma: 1.0,
            initial_attitude_sigma: 0.1,
        }
    }
}

#[derive(Clone)]
struct KalmanState {
    timestamp: f64,
    /// `[p_e, p_n, p_u, v_e, v_n, v_u]`
    mean_state: Vector6<f64>,
    covariance: Matrix6<f64>,
    orientation: UnitQuaternion<f64>,
    angular_rate: Vector3<f64>,
    attitude_variance: Vector3<f64>,
    gravity: f64,
}

/// Kalman filter over local-frame position and velocity.
///
/// # Predict Step
///
/// The state $x = [p, v]$ is propagated with a constant-velocity model driven by the
/// navigation-frame acceleration $a$ when an IMU reading is available:
///
/// $$
/// \begin{aligned}
/// \bar{x}_{k+1} &= F x_k + G a_k, \quad F = \begin{bmatrix} I & dt\, I \\\\ 0 & I \end{bmatrix},
/// \quad G = \begin{bmatrix} \tfrac{1}{2} dt^2 I \\\\ dt\, I \end{bmatrix} \\\\
/// \bar{P}_{k+1} &= F P_k F^T + Q
/// \end{aligned}
/// $$
///
/// with $a = C_b^n f_b - g \hat{z}$ and $Q$ the discrete white-noise acceleration covariance
/// ($\tfrac{1}{4} dt^4$, $\tfrac{1}{2} dt^3$ and $dt^2$ blocks scaled by the acceleration noise
/// variance). A [`Estimator::predict`] without a sample uses $a = 0$. Because every block of $Q$
/// is non-negative and the position/velocity cross-covariance stays non-negative through both
/// steps, position uncertainty never decreases across a prediction.
///
/// # Update Step
///
/// A valid GNSS fix is converted into the local frame and corrects the position:
///
/// $$
/// \begin{aligned}
/// K &= \bar{P} H^T (H \bar{P} H^T + R)^{-1} \\\\
/// x &= \bar{x} + K (z - H \bar{x}) \\\\
/// P &= (I - K H) \bar{P} (I - K H)^T + K R K^T
/// \end{aligned}
/// $$
///
/// with $H = [I \; 0]$ and $R = \sigma^2 I$, $\sigma$ the fix accuracy (floored at
/// [`KalmanConfig::min_fix_sigma`]). The first valid fix anchors the local frame instead of
/// correcting: position is reset to the origin with the fix accuracy as its uncertainty.
///
/// Attitude is levelled from the first sample and then integrated from the gyroscope; its
/// uncertainty only grows.
#[derive(Clone, Default)]
pub struct KalmanFilter {
    config: KalmanConfig,
    state: Option<KalmanState>,
    frame: Option<LocalFrame>,
}
impl Debug for KalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("KalmanFilter");
        debug.field("config", &self.config).field("frame", &self.frame);
        if let Some(state) = &self.state {
            debug
                .field("timestamp", &state.timestamp)
                .field("mean_state", &state.mean_state)
                .field("covariance", &state.covariance)
                .field("orientation", &state.orientation);
        }
        debug.finish()
    }
}
impl Display for KalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => {
                let x = &state.mean_state;
                write!(
                    f,
                    "KalmanFilter {{ t: {:.3} s, p: [{:.2}, {:.2}, {:.2}] m, v: [{:.3}, {:.3}, {:.3}] m/s }}",
                    state.timestamp, x[0], x[1], x[2], x[3], x[4], x[5]
                )
            }
            None => write!(f, "KalmanFilter {{ uninitialized }}"),
        }
    }
}
impl KalmanFilter {
    pub fn new(config: KalmanConfig) -> KalmanFilter {
        KalmanFilter {
            config,
            state: None,
            frame: None,
        }
    }
    pub fn config(&self) -> &KalmanConfig {
        &self.config
    }
    /// Full 6x6 covariance of `[p_e, p_n, p_u, v_e, v_n, v_u]`
    pub fn get_covariance(&self) -> Result<Matrix6<f64>, FilterError> {
        Ok(self.state()?.covariance)
    }
    fn state(&self) -> Result<&KalmanState, FilterError> {
        self.state.as_ref().ok_or(FilterError::NotInitialized)
    }
}

fn symmetrize(matrix: &Matrix6<f64>) -> Matrix6<f64> {
    (matrix + matrix.transpose()) * 0.5
}

fn local_gravity(frame: Option<&LocalFrame>) -> f64 {
    match frame {
        Some(frame) => earth::gravity(&frame.origin().latitude, &frame.origin().altitude),
        None => earth::GE,
    }
}

fn propagate(
    state: &mut KalmanState,
    config: &KalmanConfig,
    acceleration: Option<Vector3<f64>>,
    dt: f64,
) {
    let mut transition = Matrix6::<f64>::identity();
    let mut process_noise = Matrix6::<f64>::zeros();
    let q = config.acceleration_noise.powi(2);
    for i in 0..3 {
        transition[(i, i + 3)] = dt;
        process_noise[(i, i)] = 0.25 * dt.powi(4) * q;
        process_noise[(i, i + 3)] = 0.5 * dt.powi(3) * q;
        process_noise[(i + 3, i)] = 0.5 * dt.powi(3) * q;
        process_noise[(i + 3, i + 3)] = dt.powi(2) * q;
    }
    state.mean_state = transition * state.mean_state;
    if let Some(a) = acceleration {
        for i in 0..3 {
            state.mean_state[i] += 0.5 * a[i] * dt * dt;
            state.mean_state[i + 3] += a[i] * dt;
        }
    }
    state.covariance = symmetrize(
        &(transition * state.covariance * transition.transpose() + process_noise),
    );
    state
        .attitude_variance
        .add_scalar_mut(config.gyro_noise.powi(2) * dt);
}

fn anchor(state: &mut KalmanState, frame: &mut Option<LocalFrame>, fix: &GeoPoint, sigma: f64) {
    let anchored = LocalFrame::new(*fix);
    state.gravity = local_gravity(Some(&anchored));
    *frame = Some(anchored);
    for i in 0..3 {
        state.mean_state[i] = 0.0;
        for j in 0..6 {
            state.covariance[(i, j)] = 0.0;
            state.covariance[(j, i)] = 0.0;
        }
        state.covariance[(i, i)] = sigma * sigma;
    }
    debug!("local frame anchored at {}", fix);
}

fn correct(
    state: &mut KalmanState,
    measured: &Vector3<f64>,
    sigma: f64,
) -> Result<(), FilterError> {
    let mut observation = Matrix3x6::<f64>::zeros();
    for i in 0..3 {
        observation[(i, i)] = 1.0;
    }
    let measurement_noise = Matrix3::<f64>::identity() * sigma * sigma;
    let innovation = measured - observation * state.mean_state;
    let innovation_covariance =
        observation * state.covariance * observation.transpose() + measurement_noise;
    let inverse = innovation_covariance
        .try_inverse()
        .ok_or(FilterError::SingularInnovation)?;
    let gain = state.covariance * observation.transpose() * inverse;
    let mean_state = state.mean_state + gain * innovation;
    let i_kh = Matrix6::<f64>::identity() - gain * observation;
    let covariance = symmetrize(
        &(i_kh * state.covariance * i_kh.transpose()
            + gain * measurement_noise * gain.transpose()),
    );
    if !mean_state.iter().chain(covariance.iter()).all(|v| v.is_finite()) {
        return Err(FilterError::NonFiniteCorrection);
    }
    state.mean_state = mean_state;
    state.covariance = covariance;
    Ok(())
}

impl Estimator for KalmanFilter {
    fn initialize(&mut self, sample: &SensorSample) -> Result<(), FilterError> {
        if self.state.is_some() {
            return Err(FilterError::AlreadyInitialized);
        }
        let config = &self.config;
        let fix = sample
            .valid_fix()
            .map(|fix| fix_sigma(fix, config.min_fix_sigma).map(|sigma| (fix, sigma)))
            .transpose()?;
        let mut covariance = Matrix6::<f64>::zeros();
        for i in 0..3 {
            covariance[(i, i)] = config.initial_position_sigma.powi(2);
            covariance[(i + 3, i + 3)] = config.initial_velocity_sigma.powi(2);
        }
        let mut state = KalmanState {
            timestamp: sample.timestamp,
            mean_state: Vector6::zeros(),
            covariance,
            orientation: initial_attitude(sample),
            angular_rate: sample.imu.map(|imu| imu.gyro).unwrap_or_else(Vector3::zeros),
            attitude_variance: Vector3::repeat(config.initial_attitude_sigma.powi(2)),
            gravity: local_gravity(None),
        };
        self.frame = None;
        if let Some((fix, sigma)) = fix {
            anchor(&mut state, &mut self.frame, fix, sigma);
        }
        debug!("{} initialized at t = {:.3} s", self.get_name(), sample.timestamp);
        self.state = Some(state);
        Ok(())
    }
    fn update(&mut self, sample: &SensorSample) -> Result<(), FilterError> {
        let config = &self.config;
        let current = self.state.as_mut().ok_or(FilterError::NotInitialized)?;
        let dt = elapsed(current.timestamp, sample.timestamp)?;
        let fix = sample
            .valid_fix()
            .map(|fix| fix_sigma(fix, config.min_fix_sigma).map(|sigma| (fix, sigma)))
            .transpose()?;

        // stepped on a copy so a rejected correction leaves the filter untouched
        let mut state = current.clone();
        state.timestamp = sample.timestamp;
        let acceleration = sample.imu.map(|imu| {
            let specific_force = state.orientation * imu.accel;
            state.angular_rate = imu.gyro;
            specific_force - Vector3::z() * state.gravity
        });
        propagate(&mut state, config, acceleration, dt);
        state.orientation *= UnitQuaternion::from_scaled_axis(state.angular_rate * dt);

        match (fix, self.frame) {
            (Some((fix, sigma)), Some(frame)) => {
                correct(&mut state, &frame.to_local(fix), sigma)?;
            }
            (Some((fix, sigma)), None) => anchor(&mut state, &mut self.frame, fix, sigma),
            (None, _) => {
                if let Some(fix) = &sample.gnss {
                    debug!("ignoring invalid fix at t = {:.3} s: {}", sample.timestamp, fix);
                }
            }
        }
        *current = state;
        Ok(())
    }
    fn predict(&mut self, dt: f64) -> Result<(), FilterError> {
        let config = &self.config;
        let state = self.state.as_mut().ok_or(FilterError::NotInitialized)?;
        let dt = check_time_step(dt)?;
        state.timestamp += dt;
        propagate(state, config, None, dt);
        state.orientation *= UnitQuaternion::from_scaled_axis(state.angular_rate * dt);
        Ok(())
    }
    fn get_orientation(&self) -> Result<UnitQuaternion<f64>, FilterError> {
        Ok(self.state()?.orientation)
    }
    fn get_position(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.mean_state.fixed_rows::<3>(0).into_owned())
    }
    fn get_velocity(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.mean_state.fixed_rows::<3>(3).into_owned())
    }
    fn get_position_uncertainty(&self) -> Result<Vector3<f64>, FilterError> {
        let covariance = &self.state()?.covariance;
        Ok(Vector3::new(
            covariance[(0, 0)].sqrt(),
            covariance[(1, 1)].sqrt(),
            covariance[(2, 2)].sqrt(),
        ))
    }
    fn get_orientation_uncertainty(&self) -> Result<Vector3<f64>, FilterError> {
        Ok(self.state()?.attitude_variance.map(f64::sqrt))
    }
    fn reset(&mut self) {
        self.state = None;
        self.frame = None;
    }
    fn get_name(&self) -> &str {
        "Kalman"
    }
    fn local_frame(&self) -> Option<&LocalFrame> {
        self.frame.as_ref()
    }
}
