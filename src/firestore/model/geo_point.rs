use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A latitude/longitude pair. Both coordinates are finite and in range, so
/// points have a total order: by latitude, then longitude.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !latitude.is_finite() || latitude.abs() > 90.0 {
            return Err(invalid_argument(format!(
                "latitude {latitude} is outside [-90, 90]"
            )));
        }
        if !longitude.is_finite() || longitude.abs() > 180.0 {
            return Err(invalid_argument(format!(
                "longitude {longitude} is outside [-180, 180]"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn compare(&self, other: &GeoPoint) -> Ordering {
        self.latitude
            .total_cmp(&other.latitude)
            .then_with(|| self.longitude.total_cmp(&other.longitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn rejects_out_of_range_and_nan() {
        for (lat, lng) in [(90.5, 0.0), (0.0, -180.5), (f64::NAN, 0.0)] {
            let err = GeoPoint::new(lat, lng).unwrap_err();
            assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        }
    }

    #[test]
    fn orders_by_latitude_first() {
        let south = GeoPoint::new(-10.0, 170.0).unwrap();
        let north = GeoPoint::new(10.0, -170.0).unwrap();
        let north_east = GeoPoint::new(10.0, 20.0).unwrap();
        assert_eq!(south.compare(&north), Ordering::Less);
        assert_eq!(north.compare(&north_east), Ordering::Less);
        assert_eq!(north_east.compare(&north_east), Ordering::Equal);
    }
}
