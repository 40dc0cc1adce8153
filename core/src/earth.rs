//! Earth-related constants, geodetic fixes and local tangent-plane conversions
//!
//! This module contains the geodetic layer of the toolbox: the [`GeoPoint`] fix type as it is
//! recorded by a GNSS receiver, the conversions between geodetic coordinates (degrees latitude,
//! degrees longitude, meters altitude) and a local East-North-Up (ENU) Cartesian frame, and a
//! distance metric between two fixes. The Earth is treated as a sphere of mean radius
//! [`MEAN_RADIUS`] for these conversions. A small number of WGS84 constants are also kept for
//! the gravity model used to remove gravitational acceleration from specific force.
//!
//! # Coordinate Systems
//! The local frame is a right-handed ENU frame anchored at a reference fix. Positions in the
//! local frame are plain `nalgebra::Vector3<f64>` values ordered `[east, north, up]` in meters.
//! The vector never carries its reference with it; [`LocalFrame`] pairs the two so callers do not
//! have to track frame identity by hand.
//!
//! The forward and reverse conversions use an equirectangular (planar) approximation:
//!
//! $$
//! e = \Delta\lambda \, R \cos\phi_0, \quad n = \Delta\phi \, R, \quad u = \Delta h
//! $$
//!
//! This is only valid for displacements that are small relative to the Earth's radius. Errors
//! grow with distance from the reference and as the reference latitude approaches the poles,
//! where $\cos\phi_0 \to 0$. Do not use it for continental-scale spans or near-polar references.

// ----------
// Working notes:
// The reverse conversion divides by cos(reference latitude). Rather than returning an unbounded
// or NaN longitude near the poles, it refuses the conversion with a GeodeticError.
// ----------
use ::nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use thiserror::Error;

// Earth constants (WGS84)
/// Earth's equitorial radius in meters
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
/// Earth's polar radius in meters
pub const POLAR_RADIUS: f64 = 6356752.31425; // meters
/// Earth's mean radius in meters
pub const MEAN_RADIUS: f64 = 6371000.0; // meters
/// Earth's eccentricity ($e$)
pub const ECCENTRICITY: f64 = 0.0818191908425; // unit-less
/// Earth's eccentricity squared ($e^2$)
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
/// Earth's gravitational acceleration at the equator ($g_e$) in $m/s^2$
pub const GE: f64 = 9.7803253359; // m/s^2, equatorial radius
/// Earth's gravitational acceleration at the poles ($g_p$) in $m/s^2$
pub const GP: f64 = 9.8321849378; // $m/s^2$, polar radius
/// Somigliana's constant ($K$)
pub const K: f64 = (POLAR_RADIUS * GP - EQUATORIAL_RADIUS * GE) / (EQUATORIAL_RADIUS * GE); // Somigliana's constant

// Plausibility limits for a usable fix
/// Lowest plausible fix altitude in meters (Dead Sea shore is ~-430 m)
pub const MIN_ALTITUDE: f64 = -500.0;
/// Highest plausible fix altitude in meters (Mt. Everest is ~8,848 m)
pub const MAX_ALTITUDE: f64 = 9000.0;
/// Minimum number of satellites for a usable fix
pub const MIN_SATELLITES: u32 = 3;
/// Smallest |cos(reference latitude)| the reverse conversion accepts (|latitude| <= ~89.94 deg)
pub const POLAR_COS_LIMIT: f64 = 1e-3;

/// Errors raised by the geodetic conversions
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum GeodeticError {
    #[error("reference latitude {latitude} deg is too close to a pole for a local ENU frame")]
    DegenerateReference { latitude: f64 },

    #[error("non-finite coordinate in geodetic conversion")]
    NonFinite,
}

/// Qualitative GNSS receiver lock indicator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FixType {
    /// No usable position solution
    #[default]
    NoFix,
    /// Horizontal-only solution
    Fix2D,
    /// Full three dimensional solution
    Fix3D,
    /// Differentially corrected solution
    Dgps,
}
impl FixType {
    /// Map the integer fix code used in sensor logs (0 = none, 1 = 2D, 2 = 3D, 3 = DGPS).
    /// Unknown codes are treated as no fix.
    pub fn from_code(code: u8) -> FixType {
        match code {
            1 => FixType::Fix2D,
            2 => FixType::Fix3D,
            3 => FixType::Dgps,
            _ => FixType::NoFix,
        }
    }
    /// Integer code of this fix type, the inverse of [`FixType::from_code`]
    pub fn code(&self) -> u8 {
        match self {
            FixType::NoFix => 0,
            FixType::Fix2D => 1,
            FixType::Fix3D => 2,
            FixType::Dgps => 3,
        }
    }
    pub fn has_fix(&self) -> bool {
        *self != FixType::NoFix
    }
}

/// A geodetic GNSS fix with receiver quality metadata.
///
/// A `GeoPoint` can hold any values; whether it is usable for navigation is answered by
/// [`GeoPoint::is_valid`] rather than enforced at construction. The only designed mutator is
/// [`GeoPoint::from_enu`], which overwrites the coordinates from a local-frame position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, positive north
    pub latitude: f64,
    /// Longitude in degrees, positive east
    pub longitude: f64,
    /// Altitude in meters above sea level
    pub altitude: f64,
    /// Estimated horizontal error in meters
    pub accuracy: f64,
    /// Receiver fix quality
    pub fix_type: FixType,
    /// Number of satellites used in the solution
    pub satellite_count: u32,
}
impl Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GeoPoint {{ lat: {:.7} deg, lon: {:.7} deg, alt: {:.2} m, acc: {:.1} m, fix: {:?}, sats: {} }}",
            self.latitude,
            self.longitude,
            self.altitude,
            self.accuracy,
            self.fix_type,
            self.satellite_count
        )
    }
}
impl GeoPoint {
    /// Create a new fix from its raw fields. No validation is performed.
    ///
    /// # Example
    /// ```rust
    /// use reckon::earth::{FixType, GeoPoint};
    /// let warsaw = GeoPoint::new(52.2297, 21.0122, 100.0, 2.5, FixType::Fix3D, 8);
    /// assert!(warsaw.is_valid());
    /// ```
    pub fn new(
        latitude: f64,
        longitude: f64,
        altitude: f64,
        accuracy: f64,
        fix_type: FixType,
        satellite_count: u32,
    ) -> GeoPoint {
        GeoPoint {
            latitude,
            longitude,
            altitude,
            accuracy,
            fix_type,
            satellite_count,
        }
    }
    /// True when the fix is plausible and usable for navigation: latitude in [-90, 90],
    /// longitude in [-180, 180], altitude in [-500, 9000] m, a fix is present and at least
    /// three satellites were used. Boundary values are accepted. NaN coordinates are rejected.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && (MIN_ALTITUDE..=MAX_ALTITUDE).contains(&self.altitude)
            && self.fix_type.has_fix()
            && self.satellite_count >= MIN_SATELLITES
    }
    /// Convert this fix to a local East-North-Up position relative to `reference`.
    ///
    /// # Arguments
    /// * `reference` - fix the local frame is anchored at; only its coordinates are used.
    ///
    /// # Returns
    /// `[east, north, up]` in meters.
    ///
    /// # Example
    /// ```rust
    /// use reckon::earth::{FixType, GeoPoint};
    /// let a = GeoPoint::new(52.2297, 21.0122, 100.0, 2.5, FixType::Fix3D, 8);
    /// let b = GeoPoint::new(52.2297, 21.0222, 100.0, 2.5, FixType::Fix3D, 8);
    /// let enu = b.to_enu(&a);
    /// assert!((enu[0] - 681.1).abs() < 0.1);
    /// ```
    pub fn to_enu(&self, reference: &GeoPoint) -> Vector3<f64> {
        let reference_latitude = reference.latitude.to_radians();
        let delta_latitude = (self.latitude - reference.latitude).to_radians();
        let delta_longitude = (self.longitude - reference.longitude).to_radians();
        let east = delta_longitude * MEAN_RADIUS * reference_latitude.cos();
        let north = delta_latitude * MEAN_RADIUS;
        let up = self.altitude - reference.altitude;
        Vector3::new(east, north, up)
    }
    /// Overwrite latitude, longitude and altitude from a local ENU position relative to
    /// `reference`. This is the exact algebraic inverse of [`GeoPoint::to_enu`].
    ///
    /// Accuracy, fix type and satellite count are left untouched. The point is not modified
    /// when an error is returned.
    ///
    /// # Errors
    /// * [`GeodeticError::DegenerateReference`] if the reference is within
    ///   [`POLAR_COS_LIMIT`] of a pole, or the east offset would span more than half a turn of
    ///   longitude.
    /// * [`GeodeticError::NonFinite`] if the position or reference contains NaN or infinity.
    pub fn from_enu(
        &mut self,
        enu: &Vector3<f64>,
        reference: &GeoPoint,
    ) -> Result<(), GeodeticError> {
        if !enu.iter().all(|v| v.is_finite())
            || !reference.latitude.is_finite()
            || !reference.longitude.is_finite()
            || !reference.altitude.is_finite()
        {
            return Err(GeodeticError::NonFinite);
        }
        let reference_latitude = reference.latitude.to_radians();
        let cos_latitude = reference_latitude.cos();
        if cos_latitude.abs() < POLAR_COS_LIMIT {
            return Err(GeodeticError::DegenerateReference {
                latitude: reference.latitude,
            });
        }
        let delta_latitude = enu[1] / MEAN_RADIUS;
        let delta_longitude = enu[0] / (MEAN_RADIUS * cos_latitude);
        if delta_longitude.abs() > std::f64::consts::PI {
            return Err(GeodeticError::DegenerateReference {
                latitude: reference.latitude,
            });
        }
        self.latitude = (reference_latitude + delta_latitude).to_degrees();
        self.longitude = (reference.longitude.to_radians() + delta_longitude).to_degrees();
        self.altitude = reference.altitude + enu[2];
        Ok(())
    }
    /// Distance in meters to another fix.
    ///
    /// The surface distance is the haversine great-circle distance on a sphere of radius
    /// [`MEAN_RADIUS`]; the altitude difference is combined with it as the second leg of a
    /// right triangle. Reasonable for short ranges only.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let surface = haversine_distance(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        );
        let altitude_difference = other.altitude - self.altitude;
        (surface * surface + altitude_difference * altitude_difference).sqrt()
    }
}

/// A local East-North-Up frame anchored at a reference fix.
///
/// Positions handed out by [`LocalFrame::to_local`] are only meaningful together with the frame
/// that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalFrame {
    origin: GeoPoint,
}
impl LocalFrame {
    pub fn new(origin: GeoPoint) -> LocalFrame {
        LocalFrame { origin }
    }
    pub fn origin(&self) -> &GeoPoint {
        &self.origin
    }
    /// Express a fix in this frame
    pub fn to_local(&self, point: &GeoPoint) -> Vector3<f64> {
        point.to_enu(&self.origin)
    }
    /// Convert a position in this frame back to a geodetic fix. The returned point carries the
    /// origin's accuracy, fix type and satellite count.
    pub fn to_geodetic(&self, position: &Vector3<f64>) -> Result<GeoPoint, GeodeticError> {
        let mut point = self.origin;
        point.from_enu(position, &self.origin)?;
        Ok(point)
    }
}

/// Haversine great-circle distance in meters between two latitude/longitude pairs in degrees
/// on a sphere of radius [`MEAN_RADIUS`].
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    MEAN_RADIUS * c
}
/// Calculate the WGS84 gravity scalar
///
/// The [gravity model](https://en.wikipedia.org/wiki/Gravity_of_Earth) is based on the [Somigliana
/// method](https://en.wikipedia.org/wiki/Theoretical_gravity#Somigliana_equation), which models
/// the Earth's gravity as a function of the latitude and altitude. Free-air correction is applied.
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
/// - `altitude` - The WGS84 altitude in meters
///
/// # Returns
/// The gravitational force scalar in m/s^2
///
/// # Example
/// ```rust
/// use reckon::earth;
/// let latitude: f64 = 45.0;
/// let altitude: f64 = 1000.0;
/// let grav = earth::gravity(&latitude, &altitude);
/// ```
pub fn gravity(latitude: &f64, altitude: &f64) -> f64 {
    let sin_lat: f64 = (latitude).to_radians().sin();
    let g0: f64 = (GE * (1.0 + K * sin_lat * sin_lat))
        / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
    g0 - 3.08e-6 * altitude
}
