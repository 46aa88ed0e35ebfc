//! Compact Position Reporting — globally unambiguous airborne decode.
//!
//! Airborne positions arrive as 17-bit latitude/longitude fractions in two
//! interleaved formats (even: 60 latitude zones, odd: 59). One frame of
//! each, received close together in time, pins the position without any
//! reference location.

/// Latitude zone widths in degrees for the even (60) and odd (59) formats.
const AIR_DLAT_EVEN: f64 = 360.0 / 60.0;
const AIR_DLAT_ODD: f64 = 360.0 / 59.0;

/// 2^17, the CPR fraction denominator.
const CPR_MAX: f64 = 131072.0;

/// Decode an even/odd airborne pair into latitude and longitude.
///
/// `latest_is_odd` selects which frame's zone the final position is
/// computed in (the newer one). Returns `None` when the two frames fall in
/// different longitude-zone bands, which means they straddle a zone
/// boundary and cannot be combined.
pub fn decode_airborne(
    even_lat: u32,
    even_lon: u32,
    odd_lat: u32,
    odd_lon: u32,
    latest_is_odd: bool,
) -> Option<(f64, f64)> {
    let lat0 = even_lat as f64;
    let lat1 = odd_lat as f64;
    let lon0 = even_lon as f64;
    let lon1 = odd_lon as f64;

    // Latitude zone index.
    let j = ((59.0 * lat0 - 60.0 * lat1) / CPR_MAX + 0.5).floor() as i32;

    let mut rlat0 = AIR_DLAT_EVEN * (modulo(j, 60) as f64 + lat0 / CPR_MAX);
    let mut rlat1 = AIR_DLAT_ODD * (modulo(j, 59) as f64 + lat1 / CPR_MAX);
    if rlat0 >= 270.0 {
        rlat0 -= 360.0;
    }
    if rlat1 >= 270.0 {
        rlat1 -= 360.0;
    }

    // Both halves must agree on the longitude zone count.
    if nl(rlat0) != nl(rlat1) {
        return None;
    }

    let (lat, mut lon) = if latest_is_odd {
        let ni = n(rlat1, true);
        let m = ((lon0 * (nl(rlat1) - 1) as f64 - lon1 * nl(rlat1) as f64) / CPR_MAX + 0.5)
            .floor() as i32;
        (rlat1, dlon(rlat1, true) * (modulo(m, ni) as f64 + lon1 / CPR_MAX))
    } else {
        let ni = n(rlat0, false);
        let m = ((lon0 * (nl(rlat0) - 1) as f64 - lon1 * nl(rlat0) as f64) / CPR_MAX + 0.5)
            .floor() as i32;
        (rlat0, dlon(rlat0, false) * (modulo(m, ni) as f64 + lon0 / CPR_MAX))
    };

    if lon > 180.0 {
        lon -= 360.0;
    }
    if !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    Some((lat, lon))
}

/// Always-positive modulo.
fn modulo(a: i32, b: i32) -> i32 {
    let r = a % b;
    if r < 0 { r + b } else { r }
}

fn n(lat: f64, odd: bool) -> i32 {
    let nl = nl(lat) - if odd { 1 } else { 0 };
    nl.max(1)
}

fn dlon(lat: f64, odd: bool) -> f64 {
    360.0 / n(lat, odd) as f64
}

/// NL — number of longitude zones at a given latitude, from the fixed
/// transition-latitude table in the CPR definition.
fn nl(lat: f64) -> i32 {
    const TRANSITIONS: [(f64, i32); 58] = [
        (10.47047130, 59),
        (14.82817437, 58),
        (18.18626357, 57),
        (21.02939493, 56),
        (23.54504487, 55),
        (25.82924707, 54),
        (27.93898710, 53),
        (29.91135686, 52),
        (31.77209708, 51),
        (33.53993436, 50),
        (35.22899598, 49),
        (36.85025108, 48),
        (38.41241892, 47),
        (39.92256684, 46),
        (41.38651832, 45),
        (42.80914012, 44),
        (44.19454951, 43),
        (45.54626723, 42),
        (46.86733252, 41),
        (48.16039128, 40),
        (49.42776439, 39),
        (50.67150166, 38),
        (51.89342469, 37),
        (53.09516153, 36),
        (54.27817472, 35),
        (55.44378444, 34),
        (56.59318756, 33),
        (57.72747354, 32),
        (58.84763776, 31),
        (59.95459277, 30),
        (61.04917774, 29),
        (62.13216659, 28),
        (63.20427479, 27),
        (64.26616523, 26),
        (65.31845310, 25),
        (66.36171008, 24),
        (67.39646774, 23),
        (68.42322022, 22),
        (69.44242631, 21),
        (70.45451075, 20),
        (71.45986473, 19),
        (72.45884545, 18),
        (73.45177442, 17),
        (74.43893416, 16),
        (75.42056257, 15),
        (76.39684391, 14),
        (77.36789461, 13),
        (78.33374083, 12),
        (79.29428225, 11),
        (80.24923213, 10),
        (81.19801349, 9),
        (82.13956981, 8),
        (83.07199445, 7),
        (83.99173563, 6),
        (84.89166191, 5),
        (85.75541621, 4),
        (86.53536998, 3),
        (87.00000000, 2),
    ];

    let lat = lat.abs();
    for &(limit, zones) in &TRANSITIONS {
        if lat < limit {
            return zones;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nl_table_spot_checks() {
        assert_eq!(nl(0.0), 59);
        assert_eq!(nl(45.0), 42);
        assert_eq!(nl(-45.0), 42);
        assert_eq!(nl(87.5), 1);
    }

    #[test]
    fn modulo_is_always_positive() {
        assert_eq!(modulo(5, 3), 2);
        assert_eq!(modulo(-1, 3), 2);
        assert_eq!(modulo(-5, 3), 1);
    }

    #[test]
    fn known_even_odd_pair_decodes() {
        // Raw 17-bit fields from a documented airborne pair; even is newer.
        let pos = decode_airborne(93000, 51372, 74158, 50194, false);
        let (lat, lon) = pos.expect("pair should decode");
        assert!((lat - 52.25720).abs() < 0.0001, "lat {lat}");
        assert!((lon - 3.91937).abs() < 0.0001, "lon {lon}");
    }

    #[test]
    fn decoded_position_is_in_range() {
        if let Some((lat, lon)) = decode_airborne(93000, 51372, 74158, 50194, true) {
            assert!(lat.abs() <= 90.0);
            assert!(lon > -180.0 && lon <= 180.0);
        }
    }

    #[test]
    fn zone_mismatch_is_rejected() {
        // Crafted so the even latitude lands just below the 10.47° NL
        // transition and the odd one just above it.
        assert_eq!(decode_airborne(97212, 0, 94268, 0, false), None);
    }
}
