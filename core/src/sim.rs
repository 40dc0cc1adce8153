//! Sensor log loading, replay and trajectory output.
//!
//! This module provides:
//! - A struct (`SensorRecord`) describing one row of a recorded sensor log CSV
//! - The replay driver (`replay`) that walks samples through any [`Estimator`]
//! - `NavigationResult` for storing, exporting and re-importing the estimated trajectory
//! - `ReplaySummary` with the bookkeeping of a run

use std::fmt::{self, Display};
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use log::{debug, info, warn};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::earth::{FixType, GeoPoint};
use crate::filter::{Estimator, FilterError};
use crate::{IMUData, SensorSample};

/// Date-time layouts accepted in the `time` column besides RFC 3339 and plain seconds
const TIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%:z"];

/// Errors raised while loading, replaying or writing a log
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("row {row}: cannot parse time '{value}'")]
    Timestamp { row: usize, value: String },

    #[error("sample {index} is earlier than the sample before it")]
    OutOfOrder { index: usize },

    #[error("sample {index} carries an invalid GNSS fix")]
    InvalidFix { index: usize },

    #[error("estimator failed at sample {index}: {source}")]
    Filter {
        index: usize,
        #[source]
        source: FilterError,
    },
}

/// What the replay does with a GNSS fix that fails [`GeoPoint::is_valid`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InvalidFixPolicy {
    /// Drop the fix and keep dead reckoning on the remaining channels
    #[default]
    Skip,
    /// Stop the replay with [`ReplayError::InvalidFix`]
    Abort,
}
impl Display for InvalidFixPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidFixPolicy::Skip => write!(f, "skip"),
            InvalidFixPolicy::Abort => write!(f, "abort"),
        }
    }
}

/// One row of a sensor log.
///
/// Every sensor column may be empty. Inertial, magnetic and GNSS channels are only formed when all
/// of their required columns are present; see [`SensorRecord::to_sample`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorRecord {
    /// Seconds as a float, or a date-time (RFC 3339 or `YYYY-MM-DD hh:mm:ss+hh:mm`)
    pub time: String,
    /// Specific force, m/s^2
    pub acc_x: Option<f64>,
    pub acc_y: Option<f64>,
    pub acc_z: Option<f64>,
    /// Angular rate, rad/s
    pub gyro_x: Option<f64>,
    pub gyro_y: Option<f64>,
    pub gyro_z: Option<f64>,
    /// Magnetic field, any consistent unit
    pub mag_x: Option<f64>,
    pub mag_y: Option<f64>,
    pub mag_z: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    /// Horizontal accuracy of the fix, m
    pub accuracy: Option<f64>,
    /// 0 = no fix, 1 = 2D, 2 = 3D, 3 = DGPS
    pub fix_type: Option<u8>,
    pub satellites: Option<u32>,
}

fn triple(x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Option<Vector3<f64>> {
    Some(Vector3::new(x?, y?, z?))
}

/// Parse a `time` cell into seconds.
pub fn parse_time(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        return seconds.is_finite().then_some(seconds);
    }
    let datetime = DateTime::parse_from_rfc3339(value).ok().or_else(|| {
        TIME_FORMATS
            .iter()
            .find_map(|format| DateTime::parse_from_str(value, format).ok())
    });
    let micros = match datetime {
        Some(datetime) => datetime.timestamp_micros(),
        // no offset: read as UTC
        None => NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
            .ok()?
            .and_utc()
            .timestamp_micros(),
    };
    Some(micros as f64 * 1e-6)
}

impl SensorRecord {
    /// Reads a sensor log CSV.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use reckon::sim::SensorRecord;
    ///
    /// let records = SensorRecord::from_csv("./data/drive.csv").expect("Failed to read log");
    /// println!("Loaded {} records", records.len());
    /// ```
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, ReplayError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    /// Writes records to a CSV file with the log header.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<(), ReplayError> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Convert into a [`SensorSample`]. `row` is only used to label a bad timestamp.
    pub fn to_sample(&self, row: usize) -> Result<SensorSample, ReplayError> {
        let timestamp = parse_time(&self.time).ok_or_else(|| ReplayError::Timestamp {
            row,
            value: self.time.clone(),
        })?;
        let accel = triple(self.acc_x, self.acc_y, self.acc_z);
        let gyro = triple(self.gyro_x, self.gyro_y, self.gyro_z);
        let gnss = match (self.latitude, self.longitude, self.altitude) {
            (Some(latitude), Some(longitude), Some(altitude)) => Some(GeoPoint::new(
                latitude,
                longitude,
                altitude,
                self.accuracy.unwrap_or(0.0),
                FixType::from_code(self.fix_type.unwrap_or(0)),
                self.satellites.unwrap_or(0),
            )),
            _ => None,
        };
        Ok(SensorSample {
            timestamp,
            imu: accel.zip(gyro).map(IMUData::from),
            magnetometer: triple(self.mag_x, self.mag_y, self.mag_z),
            gnss,
        })
    }
}

/// Read a sensor log and convert every row into a [`SensorSample`]
pub fn load_samples<P: AsRef<Path>>(path: P) -> Result<Vec<SensorSample>, ReplayError> {
    SensorRecord::from_csv(path)?
        .iter()
        .enumerate()
        .map(|(row, record)| record.to_sample(row))
        .collect()
}

/// Estimator output after one replay step, in the units of the trajectory CSV
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationRecord {
    pub time: f64,
    pub east_m: f64,
    pub north_m: f64,
    pub up_m: f64,
    /// Empty until the estimator's local frame is anchored
    pub lat_deg: Option<f64>,
    pub lon_deg: Option<f64>,
    pub alt_m: Option<f64>,
    pub vel_e_mps: f64,
    pub vel_n_mps: f64,
    pub vel_u_mps: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub sigma_e_m: f64,
    pub sigma_n_m: f64,
    pub sigma_u_m: f64,
    pub sigma_roll_deg: f64,
    pub sigma_pitch_deg: f64,
    pub sigma_yaw_deg: f64,
}
impl NavigationRecord {
    /// Snapshot an initialized estimator at `time`
    pub fn capture(time: f64, estimator: &dyn Estimator) -> Result<NavigationRecord, FilterError> {
        let position = estimator.get_position()?;
        let velocity = estimator.get_velocity()?;
        let (roll, pitch, yaw) = estimator.get_orientation()?.euler_angles();
        let sigma_position = estimator.get_position_uncertainty()?;
        let sigma_attitude = estimator.get_orientation_uncertainty()?;
        let geodetic = match estimator.local_frame() {
            Some(frame) => Some(frame.to_geodetic(&position)?),
            None => None,
        };
        Ok(NavigationRecord {
            time,
            east_m: position[0],
            north_m: position[1],
            up_m: position[2],
            lat_deg: geodetic.map(|p| p.latitude),
            lon_deg: geodetic.map(|p| p.longitude),
            alt_m: geodetic.map(|p| p.altitude),
            vel_e_mps: velocity[0],
            vel_n_mps: velocity[1],
            vel_u_mps: velocity[2],
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees(),
            sigma_e_m: sigma_position[0],
            sigma_n_m: sigma_position[1],
            sigma_u_m: sigma_position[2],
            sigma_roll_deg: sigma_attitude[0].to_degrees(),
            sigma_pitch_deg: sigma_attitude[1].to_degrees(),
            sigma_yaw_deg: sigma_attitude[2].to_degrees(),
        })
    }
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.east_m, self.north_m, self.up_m)
    }
    /// Geodetic position, when the frame was anchored
    pub fn geodetic(&self) -> Option<GeoPoint> {
        Some(GeoPoint {
            latitude: self.lat_deg?,
            longitude: self.lon_deg?,
            altitude: self.alt_m?,
            ..Default::default()
        })
    }
}

/// Trajectory produced by one estimator over a log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NavigationResult {
    /// Name of the estimator that produced the trajectory
    pub name: String,
    pub records: Vec<NavigationRecord>,
}
impl NavigationResult {
    pub fn new(name: &str) -> Self {
        NavigationResult {
            name: name.to_string(),
            records: Vec::new(),
        }
    }
    /// Writes the trajectory to a CSV file.
    ///
    /// ```no_run
    /// use reckon::kalman::KalmanFilter;
    /// use reckon::sim::{InvalidFixPolicy, load_samples, replay};
    ///
    /// let samples = load_samples("./data/drive.csv").unwrap();
    /// let mut filter = KalmanFilter::default();
    /// let (result, _) = replay(&samples, &mut filter, InvalidFixPolicy::Skip).unwrap();
    /// result.to_csv("trajectory.csv").expect("Failed to write results");
    /// ```
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), ReplayError> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Reads a trajectory previously written by [`NavigationResult::to_csv`].
    pub fn from_csv<P: AsRef<Path>>(path: P, name: &str) -> Result<Self, ReplayError> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut result = NavigationResult::new(name);
        for record in rdr.deserialize() {
            result.records.push(record?);
        }
        Ok(result)
    }
    /// Time between the first and last record, seconds
    pub fn duration(&self) -> f64 {
        match (self.records.first(), self.records.last()) {
            (Some(first), Some(last)) => last.time - first.time,
            _ => 0.0,
        }
    }
    /// Distance travelled along the trajectory, meters.
    ///
    /// Uses the geodetic columns where both ends of a leg have them and the local positions
    /// otherwise.
    pub fn path_length(&self) -> f64 {
        self.records
            .windows(2)
            .map(|pair| match (pair[0].geodetic(), pair[1].geodetic()) {
                (Some(from), Some(to)) => from.distance_to(&to),
                _ => (pair[1].position() - pair[0].position()).norm(),
            })
            .sum()
    }
}

/// Bookkeeping of a replay run
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReplaySummary {
    pub samples: usize,
    pub updates: usize,
    pub predictions: usize,
    pub skipped_fixes: usize,
    /// Seconds covered by the log
    pub duration: f64,
    /// Meters travelled along the estimated trajectory
    pub path_length: f64,
}
impl Display for ReplaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples ({} updates, {} predictions, {} invalid fixes skipped) over {:.1} s, path length {:.1} m",
            self.samples,
            self.updates,
            self.predictions,
            self.skipped_fixes,
            self.duration,
            self.path_length
        )
    }
}

/// Replay `samples` through `estimator`.
///
/// The first sample initializes the estimator. Every later sample carrying a measurement is an
/// `update`; an empty sample is a `predict` over the time elapsed since the previous sample. The
/// estimator state is recorded after every step.
///
/// # Errors
/// - [`ReplayError::OutOfOrder`] before anything runs if the timestamps decrease.
/// - [`ReplayError::InvalidFix`] for an invalid fix under [`InvalidFixPolicy::Abort`].
/// - [`ReplayError::Filter`] if the estimator rejects a step.
pub fn replay(
    samples: &[SensorSample],
    estimator: &mut dyn Estimator,
    policy: InvalidFixPolicy,
) -> Result<(NavigationResult, ReplaySummary), ReplayError> {
    if let Some(index) = samples
        .windows(2)
        .position(|pair| pair[1].timestamp < pair[0].timestamp)
    {
        return Err(ReplayError::OutOfOrder { index: index + 1 });
    }
    let mut result = NavigationResult::new(estimator.get_name());
    let mut summary = ReplaySummary {
        samples: samples.len(),
        ..Default::default()
    };
    info!(
        "Replaying {} samples through the {} estimator",
        samples.len(),
        estimator.get_name()
    );
    let mut previous: Option<f64> = None;
    for (index, sample) in samples.iter().enumerate() {
        let mut sample = *sample;
        if let Some(fix) = &sample.gnss
            && !fix.is_valid()
        {
            match policy {
                InvalidFixPolicy::Abort => return Err(ReplayError::InvalidFix { index }),
                InvalidFixPolicy::Skip => {
                    if summary.skipped_fixes == 0 {
                        warn!("Skipping invalid GNSS fixes, first at sample {}", index);
                    }
                    debug!("Skipping invalid fix at sample {}: {}", index, fix);
                    summary.skipped_fixes += 1;
                    sample.gnss = None;
                }
            }
        }
        debug!("Step {} at t = {:.3} s: {}", index, sample.timestamp, sample);
        let step = match previous {
            None => estimator.initialize(&sample),
            Some(_) if sample.has_measurement() => {
                summary.updates += 1;
                estimator.update(&sample)
            }
            Some(time) => {
                summary.predictions += 1;
                estimator.predict(sample.timestamp - time)
            }
        };
        step.and_then(|_| NavigationRecord::capture(sample.timestamp, &*estimator))
            .map(|record| result.records.push(record))
            .map_err(|source| ReplayError::Filter { index, source })?;
        previous = Some(sample.timestamp);
    }
    summary.duration = result.duration();
    summary.path_length = result.path_length();
    info!("{} finished: {}", result.name, summary);
    Ok((result, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::KalmanFilter;
    use crate::madgwick::MadgwickFilter;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;

    fn origin() -> GeoPoint {
        GeoPoint::new(52.2297, 21.0122, 110.0, 2.0, FixType::Fix3D, 9)
    }
    fn level(t: f64) -> SensorSample {
        SensorSample::new(t).with_imu(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
    }

    #[test]
    fn parses_times() {
        assert_eq!(parse_time("1.25"), Some(1.25));
        assert_eq!(parse_time(" 3 "), Some(3.0));
        assert_eq!(parse_time("1970-01-01T00:00:10Z"), Some(10.0));
        assert_eq!(parse_time("1970-01-01 00:00:10.5+00:00"), Some(10.5));
        assert_eq!(parse_time("1970-01-01 01:00:10+0100"), Some(10.0));
        assert_eq!(parse_time("1970-01-01 00:01:00"), Some(60.0));
        assert_eq!(parse_time("yesterday"), None);
        assert_eq!(parse_time("NaN"), None);
    }
    #[test]
    fn record_channels() {
        let record = SensorRecord {
            time: "0.5".to_string(),
            acc_x: Some(0.0),
            acc_y: Some(0.0),
            acc_z: Some(9.8),
            gyro_x: Some(0.0),
            gyro_y: Some(0.0),
            gyro_z: Some(0.1),
            mag_x: Some(20.0),
            mag_y: None,
            mag_z: Some(-40.0),
            latitude: Some(52.0),
            longitude: Some(21.0),
            altitude: Some(100.0),
            ..Default::default()
        };
        let sample = record.to_sample(0).unwrap();
        assert_eq!(sample.timestamp, 0.5);
        assert_eq!(sample.imu.unwrap().gyro[2], 0.1);
        assert!(sample.magnetometer.is_none());
        let fix = sample.gnss.unwrap();
        assert_eq!(fix.fix_type, FixType::NoFix);
        assert_eq!(fix.accuracy, 0.0);
        assert!(!fix.is_valid());

        let record = SensorRecord {
            time: "later".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            record.to_sample(7),
            Err(ReplayError::Timestamp { row: 7, .. })
        ));
    }
    #[test]
    fn loads_log_with_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "time,acc_x,acc_y,acc_z,gyro_x,gyro_y,gyro_z,latitude,longitude,altitude,accuracy,fix_type,satellites").unwrap();
        writeln!(file, "0.0,0,0,9.81,0,0,0,52.2297,21.0122,110,2.5,2,8").unwrap();
        writeln!(file, "0.1,0,0,9.81,0,0,0,,,,,,").unwrap();
        writeln!(file, "0.2,,,,,,,,,,,,").unwrap();
        drop(file);
        let samples = load_samples(&path).unwrap();
        assert_eq!(samples.len(), 3);
        let fix = samples[0].valid_fix().unwrap();
        assert_eq!(fix.fix_type, FixType::Fix3D);
        assert_eq!(fix.satellite_count, 8);
        assert_approx_eq!(fix.accuracy, 2.5);
        assert!(samples[1].imu.is_some() && samples[1].gnss.is_none());
        assert!(!samples[2].has_measurement());
        assert!(samples[0].magnetometer.is_none());
    }
    #[test]
    fn rejects_out_of_order() {
        let samples = [level(0.0), level(1.0), level(0.5)];
        let mut filter = MadgwickFilter::default();
        let error = replay(&samples, &mut filter, InvalidFixPolicy::Skip).unwrap_err();
        assert!(matches!(error, ReplayError::OutOfOrder { index: 2 }));
        assert!(!filter.is_initialized());
    }
    #[test]
    fn skips_invalid_fixes() {
        let mut bad = origin();
        bad.satellite_count = 1;
        let samples = [
            level(0.0).with_gnss(origin()),
            level(1.0).with_gnss(bad),
            SensorSample::new(2.0).with_gnss(bad),
            level(3.0),
        ];
        let mut filter = KalmanFilter::default();
        let (result, summary) = replay(&samples, &mut filter, InvalidFixPolicy::Skip).unwrap();
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.name, "Kalman");
        assert_eq!(summary.skipped_fixes, 2);
        // the gnss-only sample becomes empty and is predicted across
        assert_eq!(summary.updates, 2);
        assert_eq!(summary.predictions, 1);
        assert_approx_eq!(summary.duration, 3.0);
    }
    #[test]
    fn aborts_on_invalid_fix() {
        let mut bad = origin();
        bad.fix_type = FixType::NoFix;
        let samples = [level(0.0), level(1.0).with_gnss(bad)];
        let mut filter = KalmanFilter::default();
        let error = replay(&samples, &mut filter, InvalidFixPolicy::Abort).unwrap_err();
        assert!(matches!(error, ReplayError::InvalidFix { index: 1 }));
    }
    #[test]
    fn geodetic_columns_after_anchor() {
        let samples = [level(0.0), level(1.0).with_gnss(origin()), level(2.0)];
        let mut filter = MadgwickFilter::default();
        let (result, _) = replay(&samples, &mut filter, InvalidFixPolicy::Skip).unwrap();
        assert!(result.records[0].lat_deg.is_none());
        let anchored = &result.records[1];
        assert_approx_eq!(anchored.lat_deg.unwrap(), 52.2297, 1e-9);
        assert_approx_eq!(anchored.lon_deg.unwrap(), 21.0122, 1e-9);
        assert_approx_eq!(anchored.alt_m.unwrap(), 110.0, 1e-9);
        assert!(result.records[2].lat_deg.is_some());
    }
    #[test]
    fn unbounded_accuracy_stops_the_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "time,latitude,longitude,altitude,accuracy,fix_type,satellites").unwrap();
        writeln!(file, "0.0,52.2297,21.0122,110,2.0,2,8").unwrap();
        writeln!(file, "1.0,52.2297,21.0122,110,inf,2,8").unwrap();
        drop(file);
        let samples = load_samples(&path).unwrap();
        assert!(samples[1].valid_fix().unwrap().accuracy.is_infinite());
        let mut filter = KalmanFilter::default();
        let error = replay(&samples, &mut filter, InvalidFixPolicy::Skip).unwrap_err();
        assert!(matches!(
            error,
            ReplayError::Filter {
                index: 1,
                source: FilterError::InvalidAccuracy(_)
            }
        ));
    }
    #[test]
    fn empty_log() {
        let mut filter = MadgwickFilter::default();
        let (result, summary) = replay(&[], &mut filter, InvalidFixPolicy::Skip).unwrap();
        assert!(result.records.is_empty());
        assert_eq!(summary, ReplaySummary::default());
    }
    #[test]
    fn navigation_result_csv_round_trip() {
        let mut original = NavigationResult::new("Madgwick");
        for i in 0..3 {
            original.records.push(NavigationRecord {
                time: i as f64 * 0.5,
                east_m: i as f64,
                north_m: -2.0 * i as f64,
                lat_deg: if i > 0 { Some(52.0 + i as f64 * 1e-5) } else { None },
                lon_deg: if i > 0 { Some(21.0) } else { None },
                alt_m: if i > 0 { Some(100.0) } else { None },
                yaw_deg: 10.0 * i as f64,
                sigma_e_m: 3.0,
                ..Default::default()
            });
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.csv");
        original.to_csv(&path).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("time,east_m,north_m,up_m,lat_deg,lon_deg,alt_m,vel_e_mps"));

        let read = NavigationResult::from_csv(&path, "Imported").unwrap();
        assert_eq!(read.name, "Imported");
        assert_eq!(read.records.len(), 3);
        assert!(read.records[0].lat_deg.is_none());
        for (a, b) in original.records.iter().zip(&read.records) {
            assert_approx_eq!(a.east_m, b.east_m);
            assert_approx_eq!(a.north_m, b.north_m);
            assert_approx_eq!(a.yaw_deg, b.yaw_deg);
            assert_eq!(a.lat_deg, b.lat_deg);
        }
        assert!(read.path_length() > 0.0);
    }
    #[test]
    fn path_length_uses_local_positions_before_anchor() {
        let mut result = NavigationResult::new("test");
        result.records.push(NavigationRecord::default());
        result.records.push(NavigationRecord {
            time: 1.0,
            east_m: 3.0,
            north_m: 4.0,
            ..Default::default()
        });
        assert_approx_eq!(result.path_length(), 5.0);
        assert_approx_eq!(result.duration(), 1.0);
    }
}
