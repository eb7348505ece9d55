//! Decimal discipline for amounts.
//!
//! Every amount in the engine is a [`rust_decimal::Decimal`] and every
//! scaling operation rounds towards zero. Asset decimals bound the scale;
//! nothing downstream of these helpers may reintroduce rounding.

use rust_decimal::{Decimal, RoundingStrategy};

/// Truncate `value` to `scale` fractional digits, rounding towards zero.
#[must_use]
pub fn floor_dp(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

/// A human-stable rendering: no trailing zeros, no exponent.
#[must_use]
pub fn canonical(value: Decimal) -> String {
    value.normalize().to_string()
}

/// Amounts at or below the threshold are not worth a transaction.
#[must_use]
pub fn is_dust(value: Decimal, threshold: Decimal) -> bool {
    value <= threshold
}

/// `max(0, value)` — negative intermediate results clamp to zero.
#[must_use]
pub fn clamp_non_negative(value: Decimal) -> Decimal {
    if value.is_sign_negative() {
        Decimal::ZERO
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rust_decimal::Decimal;
    use test_case::test_case;

    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test_case("1.23456789", 4, "1.2345" ; "truncates excess digits")]
    #[test_case("1.9999", 0, "1" ; "rounds down not half up")]
    #[test_case("0.000001", 6, "0.000001" ; "exact scale unchanged")]
    #[test_case("3000", 6, "3000" ; "integers unchanged")]
    fn floor_dp_rounds_down(input: &str, scale: u32, expected: &str) {
        assert_eq!(floor_dp(d(input), scale), d(expected));
    }

    #[test]
    fn floor_dp_is_idempotent() {
        for s in ["1.23456789", "0.1", "999999.999999", "0"] {
            let once = floor_dp(d(s), 6);
            assert_eq!(floor_dp(once, 6), once);
        }
    }

    #[test]
    fn partition_sums_back() {
        // Any finite partition representable at the asset scale sums exactly.
        let whole = d("1.5");
        let parts = [d("0.7"), d("0.45"), d("0.35")];
        let sum: Decimal = parts.iter().copied().sum();
        assert_eq!(sum, whole);
        assert_eq!(floor_dp(sum, 6), whole);
    }

    #[test]
    fn dust_boundary_is_inclusive() {
        let threshold = d("0.000001");
        assert!(is_dust(d("0.000001"), threshold));
        assert!(is_dust(Decimal::ZERO, threshold));
        assert!(!is_dust(d("0.0000011"), threshold));
    }

    #[test]
    fn canonical_strips_trailing_zeros() {
        assert_eq!(canonical(d("1.500000")), "1.5");
        assert_eq!(canonical(d("0.000")), "0");
    }

    #[test]
    fn clamp_handles_negatives() {
        assert_eq!(clamp_non_negative(d("-3")), Decimal::ZERO);
        assert_eq!(clamp_non_negative(d("3")), d("3"));
    }
}
