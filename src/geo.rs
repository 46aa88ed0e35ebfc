//! Small geodesy helpers: distances to the receiver and dead-reckoning
//! projection for estimated positions.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance (km) and initial bearing (degrees) between two
/// points, via the haversine formula.
pub fn distance_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    let distance = EARTH_RADIUS_KM * c;

    let y = dlon.sin() * lat2_rad.cos();
    let x = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * dlon.cos();
    let bearing = (y.atan2(x).to_degrees() + 360.0) % 360.0;

    (distance, bearing)
}

/// Great-circle distance only (km).
pub fn great_circle_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    distance_bearing(lat1, lon1, lat2, lon2).0
}

/// Flat-earth (equirectangular) distance in km. Cheaper than haversine and
/// accurate enough at receiver ranges; the registry keeps the lesser of the
/// two for estimated positions.
pub fn equirectangular_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dx = (lon2 - lon1).to_radians() * mean_lat.cos();
    let dy = (lat2 - lat1).to_radians();
    EARTH_RADIUS_KM * (dx * dx + dy * dy).sqrt()
}

/// Project a point forward along `heading_deg` by `distance_km`.
///
/// Offsets east/north in kilometres are converted back to degrees around
/// the starting latitude. Used only for short dead-reckoning hops.
pub fn project(lat: f64, lon: f64, heading_deg: f64, distance_km: f64) -> (f64, f64) {
    let heading = heading_deg.to_radians();
    let east_km = distance_km * heading.sin();
    let north_km = distance_km * heading.cos();

    let km_per_deg_lat = EARTH_RADIUS_KM.to_radians();
    let new_lat = lat + north_km / km_per_deg_lat;
    let cos_lat = lat.to_radians().cos().max(1e-6);
    let mut new_lon = lon + east_km / (km_per_deg_lat * cos_lat);

    if new_lon > 180.0 {
        new_lon -= 360.0;
    } else if new_lon <= -180.0 {
        new_lon += 360.0;
    }
    (new_lat, new_lon)
}

/// Knots to kilometres covered over a millisecond interval.
pub fn knots_to_km(speed_kt: f64, elapsed_ms: u64) -> f64 {
    // 1 knot = 1.852 km/h
    speed_kt * 1.852 * (elapsed_ms as f64 / 3_600_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_to_self() {
        let (d, _) = distance_bearing(51.47, -0.45, 51.47, -0.45);
        assert!(d.abs() < 1e-9);
    }

    #[test]
    fn heathrow_to_gatwick() {
        // Roughly 40 km apart, bearing south-south-east.
        let (d, brg) = distance_bearing(51.4706, -0.4619, 51.1537, -0.1821);
        assert!((d - 40.0).abs() < 3.0, "distance {d}");
        assert!(brg > 140.0 && brg < 160.0, "bearing {brg}");
    }

    #[test]
    fn equirectangular_tracks_haversine_at_short_range() {
        let h = great_circle_km(51.47, -0.45, 51.60, -0.30);
        let e = equirectangular_km(51.47, -0.45, 51.60, -0.30);
        assert!((h - e).abs() < 0.1);
    }

    #[test]
    fn projection_moves_north() {
        let (lat, lon) = project(50.0, 10.0, 0.0, 111.0);
        assert!((lat - 51.0).abs() < 0.02);
        assert!((lon - 10.0).abs() < 1e-9);
    }

    #[test]
    fn projection_moves_east_scaled_by_latitude() {
        let (lat, lon) = project(60.0, 10.0, 90.0, 55.6);
        assert!((lat - 60.0).abs() < 1e-9);
        // At 60°N a degree of longitude is ~55.6 km.
        assert!((lon - 11.0).abs() < 0.02);
    }

    #[test]
    fn knots_conversion() {
        // 450 kt over one hour is 833.4 km.
        let km = knots_to_km(450.0, 3_600_000);
        assert!((km - 833.4).abs() < 0.1);
    }
}
