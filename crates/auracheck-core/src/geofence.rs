//! Geofenced location verification.

use crate::types::{AuthorizedLocation, GeoPoint, LocationDecision};

/// Mean Earth radius in meters (IUGG).
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two points, in meters (haversine).
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().asin()
}

/// Check the current position against an ordered list of authorized zones.
///
/// The first zone whose own radius contains the point wins — this routine
/// short-circuits on a match rather than searching for the nearest zone.
/// Zones without an explicit radius use `default_radius` meters.
pub fn verify_location(
    point: Option<GeoPoint>,
    authorized: &[AuthorizedLocation],
    default_radius: f64,
) -> LocationDecision {
    let Some(point) = point else {
        return LocationDecision {
            verified: false,
            message: "Missing location data".to_string(),
        };
    };

    if authorized.is_empty() {
        return LocationDecision {
            verified: false,
            message: "No authorized locations provided".to_string(),
        };
    }

    for location in authorized {
        let radius = location.radius.unwrap_or(default_radius);
        let distance = haversine_meters(point, location.point());

        if distance <= radius {
            let name = location.name.as_deref().unwrap_or("Unnamed location");
            tracing::debug!(name, distance, radius, "geofence matched");
            return LocationDecision {
                verified: true,
                message: format!("Within authorized radius of {name} ({distance:.1}m)"),
            };
        }
    }

    LocationDecision {
        verified: false,
        message: "Not near any authorized location".to_string(),
    }
}
