use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use float_cmp::approx_eq;

/// Share amounts within this distance of an integer snap to it.
pub const ROUND_EPS: f64 = 0.0001;

/// Rounds to the nearest integer when within [`ROUND_EPS`], otherwise truncates toward zero.
pub fn round_if_near_integer(a: f64) -> f64 {
    let nearest = a.round();
    if approx_eq!(f64, a, nearest, epsilon = ROUND_EPS) {
        nearest
    } else {
        a.trunc()
    }
}

pub fn tolerant_equals(a: f64, b: f64) -> bool {
    approx_eq!(f64, a, b, epsilon = 1e-6)
}

pub fn floor_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(TimeDelta::minutes(1)).unwrap_or(dt)
}

/// Forward fill then back fill NaN holes.
pub fn fill_nan(values: &mut [f64]) {
    let mut last = f64::NAN;
    for v in values.iter_mut() {
        if v.is_nan() {
            *v = last;
        } else {
            last = *v;
        }
    }
    let mut next = f64::NAN;
    for v in values.iter_mut().rev() {
        if v.is_nan() {
            *v = next;
        } else {
            next = *v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_if_near_integer() {
        assert_eq!(round_if_near_integer(3.9999), 4.);
        assert_eq!(round_if_near_integer(4.00009), 4.);
        assert_eq!(round_if_near_integer(5.5), 5.);
        assert_eq!(round_if_near_integer(-5.5), -5.);
        assert_eq!(round_if_near_integer(-2.99995), -3.);
        assert_eq!(round_if_near_integer(0.3), 0.);
        assert_eq!(round_if_near_integer(7.), 7.);
    }

    #[test]
    fn test_floor_minute() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 5, 14, 31, 59).unwrap();
        assert_eq!(floor_minute(dt), Utc.with_ymd_and_hms(2024, 3, 5, 14, 31, 0).unwrap());
    }

    #[test]
    fn test_fill_nan() {
        let mut values = [f64::NAN, 1., f64::NAN, f64::NAN, 3., f64::NAN];
        fill_nan(&mut values);
        assert_eq!(values, [1., 1., 1., 1., 3., 3.]);

        let mut all_nan = [f64::NAN, f64::NAN];
        fill_nan(&mut all_nan);
        assert!(all_nan.iter().all(|v| v.is_nan()));
    }
}
