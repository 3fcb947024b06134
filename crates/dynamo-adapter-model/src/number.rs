//! Exact decimal numbers for the `N` / `NS` attribute types.
//!
//! DynamoDB numbers carry up to 38 significant digits with a magnitude
//! between `1e-130` and `1e125`. They are transported as strings and must be
//! compared by value (`1`, `1.0` and `10E-1` are the same number), so this
//! module keeps them as a normalized [`BigDecimal`] rather than converting
//! through `f64`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Signed, Zero};

/// Maximum number of significant digits allowed for a number.
pub const MAX_SIGNIFICANT_DIGITS: usize = 38;

/// Largest allowed base-10 exponent of the most significant digit.
const MAX_MAGNITUDE: i64 = 125;

/// Smallest allowed base-10 exponent of the most significant digit.
const MIN_MAGNITUDE: i64 = -130;

/// Errors raised while parsing or computing a [`Number`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NumberError {
    /// The text is not a decimal number.
    #[error("The parameter cannot be converted to a numeric value: {0}")]
    Invalid(String),
    /// More than [`MAX_SIGNIFICANT_DIGITS`] significant digits.
    #[error("Attempting to store more than 38 significant digits in a Number")]
    Precision,
    /// Magnitude larger than `1e125`.
    #[error("Number overflow. Attempting to store a number with magnitude larger than supported range")]
    Overflow,
    /// Magnitude smaller than `1e-130`.
    #[error("Number underflow. Attempting to store a number with magnitude smaller than supported range")]
    Underflow,
}

/// An exact decimal number, always held in normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Number(BigDecimal);

impl Number {
    /// The number zero.
    #[must_use]
    pub fn zero() -> Self {
        Self(BigDecimal::zero())
    }

    /// Returns `true` if this number is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns `true` if this number is strictly negative.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0.is_negative()
    }

    /// Parse and validate a wire-format number string.
    pub fn parse(s: &str) -> Result<Self, NumberError> {
        let invalid = || NumberError::Invalid("numeric value is not valid".to_owned());

        let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
        let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
            Some(pos) => {
                let exp: i64 = unsigned[pos + 1..].parse().map_err(|_| invalid())?;
                (&unsigned[..pos], exp)
            }
            None => (unsigned, 0),
        };
        let digit_count = mantissa.bytes().filter(u8::is_ascii_digit).count();
        let dots = mantissa.bytes().filter(|b| *b == b'.').count();
        if digit_count == 0 || dots > 1 || digit_count + dots != mantissa.len() {
            return Err(invalid());
        }

        // The leading digit sits within `digit_count` places of `exponent`, so
        // anything further out is outside the range before we ever build it.
        let slack = i64::try_from(digit_count).map_err(|_| invalid())?;
        let all_zero = mantissa.bytes().all(|b| b == b'0' || b == b'.');
        if exponent > MAX_MAGNITUDE.saturating_add(slack) {
            return if all_zero { Ok(Self::zero()) } else { Err(NumberError::Overflow) };
        }
        if exponent < MIN_MAGNITUDE.saturating_sub(slack) {
            return if all_zero { Ok(Self::zero()) } else { Err(NumberError::Underflow) };
        }

        let value = BigDecimal::from_str(s).map_err(|_| invalid())?;
        Self::checked(value)
    }

    /// Exact sum of two numbers.
    pub fn checked_add(&self, other: &Self) -> Result<Self, NumberError> {
        Self::checked(&self.0 + &other.0)
    }

    /// Exact difference `self - other`.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, NumberError> {
        Self::checked(&self.0 - &other.0)
    }

    /// Returns the additive inverse.
    #[must_use]
    pub fn negated(&self) -> Self {
        Self(-self.0.clone())
    }

    /// Canonical text form: no exponent, no trailing fractional zeros, no `-0`.
    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        self.to_string()
    }

    fn checked(value: BigDecimal) -> Result<Self, NumberError> {
        let number = Self(value.normalized());
        let Some((digits, magnitude)) = number.shape() else {
            return Ok(Self::zero());
        };
        if digits.len() > MAX_SIGNIFICANT_DIGITS {
            return Err(NumberError::Precision);
        }
        if magnitude > MAX_MAGNITUDE {
            return Err(NumberError::Overflow);
        }
        if magnitude < MIN_MAGNITUDE {
            return Err(NumberError::Underflow);
        }
        Ok(number)
    }

    /// Significant digits and the exponent of the leading one, `None` for zero.
    fn shape(&self) -> Option<(String, i64)> {
        if self.is_zero() {
            return None;
        }
        let (int, scale) = self.0.as_bigint_and_exponent();
        let digits = int.to_string().trim_start_matches('-').to_owned();
        let len = i64::try_from(digits.len()).ok()?;
        let magnitude = len.checked_sub(1)?.checked_sub(scale)?;
        Some((digits, magnitude))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Number {
    type Err = NumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((digits, _)) = self.shape() else {
            return f.write_str("0");
        };
        if self.is_negative() {
            f.write_str("-")?;
        }
        let (_, scale) = self.0.as_bigint_and_exponent();
        if scale <= 0 {
            f.write_str(&digits)?;
            for _ in 0..scale.unsigned_abs() {
                f.write_str("0")?;
            }
            return Ok(());
        }
        let frac = usize::try_from(scale).map_err(|_| fmt::Error)?;
        if frac < digits.len() {
            let (int_part, frac_part) = digits.split_at(digits.len() - frac);
            write!(f, "{int_part}.{frac_part}")
        } else {
            f.write_str("0.")?;
            for _ in 0..frac - digits.len() {
                f.write_str("0")?;
            }
            f.write_str(&digits)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Number {
        Number::parse(s).expect("valid number")
    }

    #[test]
    fn test_should_treat_equivalent_spellings_as_equal() {
        assert_eq!(n("1"), n("1.0"));
        assert_eq!(n("1"), n("10E-1"));
        assert_eq!(n("-0"), n("0.000"));
        assert_eq!(n("1.50"), n("+1.5"));
    }

    #[test]
    fn test_should_order_by_exact_value() {
        assert!(n("9") < n("10"));
        assert!(n("-10") < n("-9"));
        assert!(n("0.1") < n("0.11"));
        assert!(n("-0.5") < n("0"));
        assert!(n("1e2") > n("99.999"));
        // Differ only in the 38th digit, beyond f64 precision.
        assert!(
            n("1234567890123456789012345678901234567.8")
                < n("1234567890123456789012345678901234567.9")
        );
    }

    #[test]
    fn test_should_add_and_subtract_exactly() {
        assert_eq!(n("0.1").checked_add(&n("0.2")).expect("add"), n("0.3"));
        assert_eq!(n("5").checked_sub(&n("7.5")).expect("sub"), n("-2.5"));
        assert_eq!(n("-3").checked_add(&n("3")).expect("add"), Number::zero());
        assert_eq!(n("999").checked_add(&n("1")).expect("add"), n("1000"));
        assert_eq!(
            n("1e125").checked_add(&n("9e125")),
            Err(NumberError::Overflow)
        );
    }

    #[test]
    fn test_should_render_canonical_form() {
        assert_eq!(n("1.500").to_string(), "1.5");
        assert_eq!(n("12e3").to_string(), "12000");
        assert_eq!(n("-0.0042").to_string(), "-0.0042");
        assert_eq!(n("-0").to_string(), "0");
        assert_eq!(n("123.45").to_string(), "123.45");
        assert_eq!(n("0.5").to_string(), "0.5");
    }

    #[test]
    fn test_should_reject_malformed_numbers() {
        for bad in [
            "", " 1", "abc", "1.2.3", "--1", "1e", "NaN", "Infinity", ".", "1_000",
        ] {
            assert!(
                matches!(Number::parse(bad), Err(NumberError::Invalid(_))),
                "{bad:?} should be invalid"
            );
        }
    }

    #[test]
    fn test_should_enforce_precision_and_magnitude_limits() {
        assert_eq!(
            Number::parse("123456789012345678901234567890123456789"),
            Err(NumberError::Precision)
        );
        assert_eq!(Number::parse("1e126"), Err(NumberError::Overflow));
        assert_eq!(Number::parse("1e-131"), Err(NumberError::Underflow));
        assert!(Number::parse("1e125").is_ok());
        assert!(Number::parse("1e-130").is_ok());
    }

    #[test]
    fn test_should_reject_extreme_exponents_without_panicking() {
        assert_eq!(
            Number::parse("100e9223372036854775807"),
            Err(NumberError::Overflow)
        );
        assert_eq!(
            Number::parse("-1e-9223372036854775808"),
            Err(NumberError::Underflow)
        );
        assert_eq!(n("0e9223372036854775807"), Number::zero());
    }
}
