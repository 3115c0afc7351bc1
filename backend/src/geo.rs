use crate::models::Coordinate;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// `hav(theta) = sin^2(theta / 2)`, kept in sine form so meter-scale
/// separations do not cancel out.
fn hav(theta: f64) -> f64 {
    (theta * 0.5).sin().powi(2)
}

/// Great-circle distance in meters between two coordinates (Haversine).
///
/// NaN inputs are not sanitized and propagate to the result.
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let (phi_a, phi_b) = (a.lat.to_radians(), b.lat.to_radians());
    let h = hav(phi_b - phi_a) + phi_a.cos() * phi_b.cos() * hav((b.lng - a.lng).to_radians());
    // Rounding can push h a hair above 1 for antipodal points.
    let central_angle = 2.0 * h.sqrt().min(1.0).asin();
    central_angle * EARTH_RADIUS_M
}

pub fn path_length_meters(path: &[Coordinate]) -> f64 {
    path.iter()
        .zip(path.iter().skip(1))
        .fold(0.0, |total, (from, to)| total + distance_meters(*from, *to))
}
