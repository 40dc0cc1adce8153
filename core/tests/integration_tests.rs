//! End-to-end tests: synthetic sensor logs written to disk, loaded back, and replayed through
//! every estimator.
//!
//! The synthetic vehicle drives due east at constant speed on level ground. The IMU reads pure
//! gravity at 10 Hz and a GNSS fix arrives once per second, so the truth is known exactly and both
//! estimators must track it.
use nalgebra::Vector3;
use rand::Rng;

use reckon::config::{FilterKind, Tuning};
use reckon::earth::{self, FixType, GeoPoint, LocalFrame};
use reckon::filter::{Estimator, FilterError};
use reckon::kalman::KalmanFilter;
use reckon::madgwick::MadgwickFilter;
use reckon::sim::{
    InvalidFixPolicy, NavigationResult, ReplayError, SensorRecord, load_samples, replay,
};
use reckon::SensorSample;

const SPEED: f64 = 5.0; // m/s, due east
const DURATION: usize = 30; // seconds

fn origin() -> GeoPoint {
    GeoPoint::new(45.5017, -73.5673, 30.0, 2.0, FixType::Fix3D, 11)
}

fn truth_fix(t: f64) -> GeoPoint {
    let mut fix = origin();
    fix.from_enu(&Vector3::new(SPEED * t, 0.0, 0.0), &origin())
        .unwrap();
    fix
}

/// Ten IMU rows per second, with a fix on every whole second
fn synthetic_log() -> Vec<SensorRecord> {
    let g = earth::gravity(&origin().latitude, &origin().altitude);
    (0..=DURATION * 10)
        .map(|i| {
            let t = i as f64 * 0.1;
            let mut record = SensorRecord {
                time: format!("{:.1}", t),
                acc_x: Some(0.0),
                acc_y: Some(0.0),
                acc_z: Some(g),
                gyro_x: Some(0.0),
                gyro_y: Some(0.0),
                gyro_z: Some(0.0),
                ..Default::default()
            };
            if i % 10 == 0 {
                let fix = truth_fix(t);
                record.latitude = Some(fix.latitude);
                record.longitude = Some(fix.longitude);
                record.altitude = Some(fix.altitude);
                record.accuracy = Some(fix.accuracy);
                record.fix_type = Some(fix.fix_type.code());
                record.satellites = Some(fix.satellite_count);
            }
            record
        })
        .collect()
}

fn replay_synthetic(kind: FilterKind) -> NavigationResult {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drive.csv");
    SensorRecord::to_csv(&synthetic_log(), &path).unwrap();
    let samples = load_samples(&path).unwrap();
    assert_eq!(samples.len(), DURATION * 10 + 1);

    let mut estimator = kind.build(&Tuning::default());
    let (result, summary) = replay(&samples, estimator.as_mut(), InvalidFixPolicy::Skip).unwrap();
    assert_eq!(summary.samples, samples.len());
    assert_eq!(summary.updates, samples.len() - 1);
    assert_eq!(summary.predictions, 0);
    assert_eq!(summary.skipped_fixes, 0);
    assert!((summary.duration - DURATION as f64).abs() < 1e-9);
    result
}

#[test]
fn madgwick_tracks_synthetic_drive() {
    let result = replay_synthetic(FilterKind::Madgwick);
    assert_eq!(result.name, "Madgwick");
    let last = result.records.last().unwrap();
    assert!((last.east_m - SPEED * DURATION as f64).abs() < 1e-6);
    assert!(last.north_m.abs() < 1e-6);
    assert!((last.vel_e_mps - SPEED).abs() < 1e-6);
    // level and unrotated the whole way
    for record in &result.records {
        assert!(record.roll_deg.abs() < 1e-6);
        assert!(record.pitch_deg.abs() < 1e-6);
    }
    let end = last.geodetic().unwrap();
    assert!(end.distance_to(&truth_fix(DURATION as f64)) < 1e-3);
    assert!((result.path_length() - SPEED * DURATION as f64).abs() < 0.5);
}

#[test]
fn kalman_tracks_synthetic_drive() {
    let result = replay_synthetic(FilterKind::Kalman);
    assert_eq!(result.name, "Kalman");
    let last = result.records.last().unwrap();
    assert!((last.east_m - SPEED * DURATION as f64).abs() < 2.0);
    assert!(last.north_m.abs() < 1e-6);
    assert!((last.vel_e_mps - SPEED).abs() < 0.5);
    assert!(last.sigma_e_m < origin().accuracy);
    let end = last.geodetic().unwrap();
    assert!(end.distance_to(&truth_fix(DURATION as f64)) < 2.0);
}

#[test]
fn trajectory_file_round_trip() {
    let result = replay_synthetic(FilterKind::Kalman);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("trajectory.csv");
    assert!(matches!(result.to_csv(&path), Err(ReplayError::Csv(_)) | Err(ReplayError::Io(_))));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    result.to_csv(&path).unwrap();
    let read = NavigationResult::from_csv(&path, "Kalman").unwrap();
    assert_eq!(read.records.len(), result.records.len());
    for (a, b) in result.records.iter().zip(&read.records) {
        assert!((a.time - b.time).abs() < 1e-9);
        assert!((a.east_m - b.east_m).abs() < 1e-9);
        assert_eq!(a.lat_deg.is_some(), b.lat_deg.is_some());
    }
}

#[test]
fn fix_outage_is_dead_reckoned() {
    // drop every fix between 10 s and 20 s by marking it invalid
    let mut log = synthetic_log();
    for record in log.iter_mut().skip(101).take(99) {
        if record.latitude.is_some() {
            record.fix_type = Some(0);
        }
    }
    let samples: Vec<SensorSample> = log
        .iter()
        .enumerate()
        .map(|(row, record)| record.to_sample(row).unwrap())
        .collect();

    let mut estimator = KalmanFilter::default();
    let (result, summary) = replay(&samples, &mut estimator, InvalidFixPolicy::Skip).unwrap();
    assert_eq!(summary.skipped_fixes, 9);
    // uncertainty grows through the outage and collapses at the first fix after it
    let before = &result.records[100];
    let during = &result.records[195];
    let after = &result.records[200];
    assert!(during.sigma_e_m > before.sigma_e_m);
    assert!(after.sigma_e_m < during.sigma_e_m);

    let mut estimator = KalmanFilter::default();
    assert!(matches!(
        replay(&samples, &mut estimator, InvalidFixPolicy::Abort),
        Err(ReplayError::InvalidFix { index: 110 })
    ));
}

#[test]
fn estimator_lifecycle_through_trait_objects() {
    let mut estimators: Vec<Box<dyn Estimator>> = vec![
        Box::new(MadgwickFilter::default()),
        Box::new(KalmanFilter::default()),
    ];
    let start = SensorSample::new(0.0)
        .with_imu(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
        .with_gnss(origin());
    for estimator in estimators.iter_mut() {
        assert!(!estimator.is_initialized());
        assert_eq!(estimator.get_velocity(), Err(FilterError::NotInitialized));
        assert_eq!(estimator.get_orientation(), Err(FilterError::NotInitialized));
        assert_eq!(estimator.predict(1.0), Err(FilterError::NotInitialized));

        estimator.initialize(&start).unwrap();
        assert!(estimator.is_initialized());
        assert_eq!(estimator.local_frame(), Some(&LocalFrame::new(origin())));
        assert_eq!(estimator.initialize(&start), Err(FilterError::AlreadyInitialized));

        let mut previous = estimator.get_position_uncertainty().unwrap();
        for _ in 0..20 {
            estimator.predict(0.5).unwrap();
            let current = estimator.get_position_uncertainty().unwrap();
            assert!((0..3).all(|axis| current[axis] >= previous[axis]));
            previous = current;
        }

        estimator.reset();
        assert!(!estimator.is_initialized());
        assert!(estimator.local_frame().is_none());
        assert_eq!(
            estimator.update(&start),
            Err(FilterError::NotInitialized)
        );
        assert!(!estimator.get_name().is_empty());
    }
}

#[test]
fn random_enu_round_trips() {
    let mut rng = rand::rng();
    for _ in 0..200 {
        let reference = GeoPoint::new(
            rng.random_range(-80.0..80.0),
            rng.random_range(-179.0..179.0),
            rng.random_range(0.0..2000.0),
            1.0,
            FixType::Fix3D,
            8,
        );
        let offset = Vector3::new(
            rng.random_range(-5000.0..5000.0),
            rng.random_range(-5000.0..5000.0),
            rng.random_range(-100.0..100.0),
        );
        let mut point = reference;
        point.from_enu(&offset, &reference).unwrap();
        let back = point.to_enu(&reference);
        assert!((back - offset).norm() < 1e-6);
        assert_eq!(point.fix_type, reference.fix_type);
        // short offsets: the distance metric agrees with the local frame
        let distance = reference.distance_to(&point);
        assert!((distance - offset.norm()).abs() < 0.01 * offset.norm() + 1e-6);
    }
}
