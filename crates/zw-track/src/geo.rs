use zw_proto::{Coordinate, Zone};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres between two lat/lon pairs in degrees.
/// Inputs are not range checked.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat/2.0).sin().powi(2) + lat1.to_radians().cos()*lat2.to_radians().cos()*(dlon/2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0-a).sqrt());
    EARTH_RADIUS_M * c
}

pub trait DistanceTo {
    fn distance_to(&self, other: &Coordinate) -> f64;
}

impl DistanceTo for Coordinate {
    fn distance_to(&self, other: &Coordinate) -> f64 {
        haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Inclusive: a point exactly `radius_m` from the center is inside.
pub fn is_within(zone: &Zone, position: &Coordinate) -> bool {
    position.distance_to(&zone.center) <= zone.radius_m
}
