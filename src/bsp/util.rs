//! Small math helpers shared by the node builder.

/// Smallest distance between two points before being considered equal.
/// Also used as the smallest angle (in degrees) between two directions.
pub const EPSILON: f64 = 1.0 / 1024.0;

/// Angle of the line from (0,0) to (dx,dy), in degrees.
/// East is 0, north is 90; result lies in [0,360).
pub fn compute_angle(dx: f64, dy: f64) -> f64 {
    if dx == 0.0 {
        return if dy > 0.0 { 90.0 } else { 270.0 };
    }

    let angle = dy.atan2(dx).to_degrees();

    if angle < 0.0 { angle + 360.0 } else { angle }
}

/// Round to the nearest integer, ties to even.
///
/// Repeated builds must produce byte-identical output, so every
/// float→int conversion in the writer goes through here.
pub fn round_to_integer(v: f64) -> i32 {
    v.round_ties_even() as i32
}

/// Convert a map coordinate to 16.16 signed fixed point, saturating.
pub fn to_fixed_16_16(v: f64) -> i32 {
    let scaled = (v * 65536.0).round_ties_even();
    scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cardinal_angles() {
        assert_eq!(compute_angle(1.0, 0.0), 0.0);
        assert_eq!(compute_angle(0.0, 1.0), 90.0);
        assert_eq!(compute_angle(-1.0, 0.0), 180.0);
        assert_eq!(compute_angle(0.0, -1.0), 270.0);
    }

    #[test]
    fn diagonal_angles_wrap_into_range() {
        assert_eq!(compute_angle(1.0, 1.0), 45.0);
        let a = compute_angle(1.0, -1.0);
        assert!((a - 315.0).abs() < 1e-9);
        let b = compute_angle(-3.0, -3.0);
        assert!((b - 225.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_point_rounds_ties_to_even() {
        // 0.5 in 1/65536 units: 32768.5 → 32768 (even)
        assert_eq!(to_fixed_16_16(32768.5 / 65536.0), 32768);
        assert_eq!(to_fixed_16_16(1.0), 65536);
        assert_eq!(to_fixed_16_16(-0.5), -32768);
    }

    #[test]
    fn fixed_point_saturates() {
        assert_eq!(to_fixed_16_16(1.0e9), i32::MAX);
        assert_eq!(to_fixed_16_16(-1.0e9), i32::MIN);
    }
}
