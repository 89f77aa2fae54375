// src/utils/money.rs

/// Round to two decimal places, half away from zero.
///
/// The value is nudged by a relative epsilon before rounding so that inputs
/// like `1.005` (stored as `1.00499999...`) round up the way a person would.
pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let scaled = value * 100.0;
    let nudged = scaled + scaled.signum() * scaled.abs().max(1.0) * 1e-12;
    nudged.round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_up_not_truncate() {
        assert_eq!(round2(1.005), 1.01);
        assert_eq!(round2(2.675), 2.68);
        assert_eq!(round2(10.994), 10.99);
        assert_eq!(round2(10.995), 11.0);
    }

    #[test]
    fn keeps_exact_cents() {
        assert_eq!(round2(12.5), 12.5);
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(-1.005), -1.01);
    }
}
