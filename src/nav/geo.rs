//! Great-circle geometry on the WGS-84 sphere approximation.

/// Mean Earth radius in metres.
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// Haversine distance between two coordinates, in metres.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS * c
}

/// Initial bearing from point 1 to point 2, degrees in [0, 360).
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let x = delta_lon.sin() * lat2_rad.cos();
    let y = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * delta_lon.cos();

    (x.atan2(y).to_degrees() + 360.0) % 360.0
}

/// Normalise an angle to (-180, 180].
pub fn normalize_angle(mut angle: f64) -> f64 {
    while angle > 180.0 {
        angle -= 360.0;
    }
    while angle <= -180.0 {
        angle += 360.0;
    }
    angle
}

/// Shortest signed turn from `current` to `target` heading.
/// Negative means turn left, positive turn right.
pub fn angle_difference(current: f64, target: f64) -> f64 {
    normalize_angle(target - current)
}

/// Destination point from a start, an initial bearing (degrees) and a
/// distance (metres).  Used by the drive simulations in the test suites.
#[cfg_attr(not(test), allow(dead_code))]
pub fn destination_point(lat: f64, lon: f64, bearing_deg: f64, distance: f64) -> (f64, f64) {
    let lat_rad = lat.to_radians();
    let lon_rad = lon.to_radians();
    let bearing_rad = bearing_deg.to_radians();
    let angular = distance / EARTH_RADIUS;

    let dest_lat = (lat_rad.sin() * angular.cos()
        + lat_rad.cos() * angular.sin() * bearing_rad.cos())
    .asin();
    let dest_lon = lon_rad
        + (bearing_rad.sin() * angular.sin() * lat_rad.cos())
            .atan2(angular.cos() - lat_rad.sin() * dest_lat.sin());

    (dest_lat.to_degrees(), dest_lon.to_degrees())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn haversine_known_distance() {
        // Roughly 111 m per 0.001° of latitude.
        let d = haversine_distance(52.2297, 21.0122, 52.2307, 21.0122);
        assert_relative_eq!(d, 111.2, epsilon = 1.0);
    }

    #[test]
    fn bearing_cardinal_directions() {
        assert_relative_eq!(bearing(52.0, 21.0, 53.0, 21.0), 0.0, epsilon = 0.01);
        assert_relative_eq!(bearing(52.0, 21.0, 51.0, 21.0), 180.0, epsilon = 0.01);
        let east = bearing(52.0, 21.0, 52.0, 22.0);
        assert!((85.0..=90.0).contains(&east), "east bearing {east}");
        let west = bearing(52.0, 21.0, 52.0, 20.0);
        assert!((270.0..=275.0).contains(&west), "west bearing {west}");
    }

    #[test]
    fn angle_difference_in_range_and_consistent() {
        for current in (0..360).step_by(15) {
            for target in (0..360).step_by(15) {
                let d = angle_difference(current as f64, target as f64);
                assert!(d > -180.0 && d <= 180.0, "({current}, {target}) → {d}");
                let recomposed = (current as f64 + d).rem_euclid(360.0);
                assert_relative_eq!(recomposed, (target as f64) % 360.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn angle_difference_shortest_path() {
        assert_relative_eq!(angle_difference(350.0, 10.0), 20.0);
        assert_relative_eq!(angle_difference(10.0, 350.0), -20.0);
        assert_relative_eq!(angle_difference(0.0, 180.0), 180.0);
    }

    #[test]
    fn destination_round_trip() {
        let (lat, lon) = destination_point(52.2297, 21.0122, 45.0, 500.0);
        let d = haversine_distance(52.2297, 21.0122, lat, lon);
        assert_relative_eq!(d, 500.0, epsilon = 0.5);
        let b = bearing(52.2297, 21.0122, lat, lon);
        assert_relative_eq!(b, 45.0, epsilon = 0.1);
    }
}
