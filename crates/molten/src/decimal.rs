//! Fixed-point decimal arithmetic for numeric filters.
//!
//! Numeric filters route float operands through [`Decimal`] rather than `f64`
//! so that `0.1 | plus: 0.2` renders `0.3` and not the double-rounded binary
//! result. A value is a base-10 mantissa plus a scale (count of fractional
//! digits); floats enter via their shortest round-trip representation.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Fractional digits produced by division before trailing zeros are trimmed.
const DIV_SCALE: u32 = 16;

/// Largest scale accepted when parsing; guards mantissa overflow.
const MAX_SCALE: u32 = 28;

/// A base-10 fixed-point number: `mantissa * 10^-scale`.
///
/// Stored normalized (no trailing fractional zeros). Displays with at least
/// one fractional digit so a decimal result is always visibly non-integer,
/// matching the reference engine's output for decimal arithmetic.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    /// Creates a decimal from raw parts, normalizing trailing zeros.
    #[must_use]
    pub fn from_parts(mantissa: i128, scale: u32) -> Self {
        let mut d = Self { mantissa, scale };
        d.normalize();
        d
    }

    /// Converts an integer losslessly.
    #[must_use]
    pub fn from_int(value: i64) -> Self {
        Self {
            mantissa: i128::from(value),
            scale: 0,
        }
    }

    /// Converts a float via its shortest round-trip decimal representation.
    ///
    /// Non-finite floats map to zero; they cannot arise from template
    /// literals and filters treat them as invalid input upstream.
    #[must_use]
    pub fn from_float(value: f64) -> Self {
        if !value.is_finite() {
            return Self::from_int(0);
        }
        let mut buffer = ryu::Buffer::new();
        buffer.format(value).parse().unwrap_or_else(|_| Self::from_int(0))
    }

    /// The number of fractional digits.
    #[must_use]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// True when the value is exactly zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Lossy conversion to `f64`, used by cross-kind comparisons.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale.cast_signed())
    }

    /// Truncating conversion to `i64` (drops the fractional part).
    #[must_use]
    pub fn to_i64(&self) -> i64 {
        let truncated = self.mantissa / pow10(self.scale);
        i64::try_from(truncated).unwrap_or(if truncated < 0 { i64::MIN } else { i64::MAX })
    }

    /// Addition; `None` on mantissa overflow.
    #[must_use]
    pub fn checked_add(self, other: Self) -> Option<Self> {
        let (a, b, scale) = align(self, other)?;
        Some(Self::from_parts(a.checked_add(b)?, scale))
    }

    /// Subtraction; `None` on mantissa overflow.
    #[must_use]
    pub fn checked_sub(self, other: Self) -> Option<Self> {
        let (a, b, scale) = align(self, other)?;
        Some(Self::from_parts(a.checked_sub(b)?, scale))
    }

    /// Multiplication; `None` on mantissa overflow.
    #[must_use]
    pub fn checked_mul(self, other: Self) -> Option<Self> {
        Some(Self::from_parts(
            self.mantissa.checked_mul(other.mantissa)?,
            self.scale.checked_add(other.scale)?,
        ))
    }

    /// Division carried to [`DIV_SCALE`] fractional digits; `None` on
    /// division by zero or overflow.
    #[must_use]
    pub fn checked_div(self, other: Self) -> Option<Self> {
        if other.mantissa == 0 {
            return None;
        }
        // Scale the dividend so the quotient carries DIV_SCALE fractional
        // digits relative to the operands' scale difference.
        let extra = DIV_SCALE + other.scale;
        let scaled = self.mantissa.checked_mul(pow10_checked(extra)?)?;
        let quotient = scaled / other.mantissa;
        Some(Self::from_parts(quotient, self.scale + DIV_SCALE))
    }

    /// Remainder with the sign of the divisor, matching Ruby's `%`.
    #[must_use]
    pub fn checked_rem(self, other: Self) -> Option<Self> {
        if other.mantissa == 0 {
            return None;
        }
        let (a, b, scale) = align(self, other)?;
        let mut rem = a % b;
        if rem != 0 && (rem < 0) != (b < 0) {
            rem += b;
        }
        Some(Self::from_parts(rem, scale))
    }

    /// Negation.
    #[must_use]
    pub fn neg(self) -> Self {
        Self {
            mantissa: -self.mantissa,
            scale: self.scale,
        }
    }

    /// Absolute value.
    #[must_use]
    pub fn abs(self) -> Self {
        Self {
            mantissa: self.mantissa.abs(),
            scale: self.scale,
        }
    }

    /// Rounds half-away-from-zero to `digits` fractional digits.
    #[must_use]
    pub fn round_dp(self, digits: u32) -> Self {
        if self.scale <= digits {
            return self;
        }
        let drop = pow10(self.scale - digits);
        let mut quotient = self.mantissa / drop;
        let rem = self.mantissa % drop;
        if rem.abs() * 2 >= drop {
            quotient += self.mantissa.signum();
        }
        Self::from_parts(quotient, digits)
    }

    /// Smallest integer not less than the value.
    #[must_use]
    pub fn ceil(self) -> i64 {
        if self.scale == 0 {
            return self.to_i64();
        }
        let div = pow10(self.scale);
        let mut quotient = self.mantissa / div;
        if self.mantissa % div > 0 {
            quotient += 1;
        }
        i64::try_from(quotient).unwrap_or(if quotient < 0 { i64::MIN } else { i64::MAX })
    }

    /// Largest integer not greater than the value.
    #[must_use]
    pub fn floor(self) -> i64 {
        if self.scale == 0 {
            return self.to_i64();
        }
        let div = pow10(self.scale);
        let mut quotient = self.mantissa / div;
        if self.mantissa % div < 0 {
            quotient -= 1;
        }
        i64::try_from(quotient).unwrap_or(if quotient < 0 { i64::MIN } else { i64::MAX })
    }

    /// Drops trailing fractional zeros.
    fn normalize(&mut self) {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
    }
}

/// Brings two decimals to a common scale.
fn align(a: Decimal, b: Decimal) -> Option<(i128, i128, u32)> {
    let scale = a.scale.max(b.scale);
    let am = a.mantissa.checked_mul(pow10_checked(scale - a.scale)?)?;
    let bm = b.mantissa.checked_mul(pow10_checked(scale - b.scale)?)?;
    Some((am, bm, scale))
}

fn pow10(exp: u32) -> i128 {
    10i128.pow(exp)
}

fn pow10_checked(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        match align(*self, *other) {
            Some((a, b, _)) => a.cmp(&b),
            // Alignment can only overflow for magnitudes far beyond template
            // arithmetic; fall back to float ordering there.
            None => self.to_f64().partial_cmp(&other.to_f64()).unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}.0", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let abs = self.mantissa.unsigned_abs();
        let div = pow10(self.scale).unsigned_abs();
        let int_part = abs / div;
        let frac_part = abs % div;
        write!(f, "{sign}{int_part}.{frac_part:0width$}", width = self.scale as usize)
    }
}

impl FromStr for Decimal {
    type Err = ();

    /// Parses `[-+]?digits[.digits]` with optional exponent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, exp) = match s.find(['e', 'E']) {
            Some(pos) => {
                let exp: i32 = s[pos + 1..].parse().map_err(|_| ())?;
                (&s[..pos], exp)
            }
            None => (s, 0),
        };
        let (digits, scale) = match body.find('.') {
            Some(pos) => {
                let frac = &body[pos + 1..];
                if frac.len() as u32 > MAX_SCALE || frac.chars().any(|c| !c.is_ascii_digit()) {
                    return Err(());
                }
                (format!("{}{frac}", &body[..pos]), frac.len() as u32)
            }
            None => (body.to_owned(), 0),
        };
        if digits.is_empty() || digits == "-" || digits == "+" {
            return Err(());
        }
        let mantissa: i128 = digits.parse().map_err(|_| ())?;
        // Fold the exponent into mantissa or scale.
        let net = i64::from(exp) - i64::from(scale);
        if net >= 0 {
            let shift = u32::try_from(net).map_err(|_| ())?;
            Ok(Self::from_parts(mantissa.checked_mul(pow10_checked(shift).ok_or(())?).ok_or(())?, 0))
        } else {
            let shift = u32::try_from(-net).map_err(|_| ())?;
            if shift > MAX_SCALE {
                return Err(());
            }
            Ok(Self::from_parts(mantissa, shift))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_add_avoids_binary_rounding() {
        let sum = dec("0.1").checked_add(dec("0.2")).unwrap();
        assert_eq!(sum.to_string(), "0.3");
    }

    #[test]
    fn test_integral_results_keep_one_fraction_digit() {
        let product = dec("2.0").checked_mul(Decimal::from_int(3)).unwrap();
        assert_eq!(product.to_string(), "6.0");
    }

    #[test]
    fn test_division_trims_trailing_zeros() {
        let q = dec("1.0").checked_div(Decimal::from_int(4)).unwrap();
        assert_eq!(q.to_string(), "0.25");
    }

    #[test]
    fn test_rem_takes_divisor_sign() {
        let r = Decimal::from_int(-7).checked_rem(Decimal::from_int(3)).unwrap();
        assert_eq!(r.to_i64(), 2);
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(dec("4.65").round_dp(1).to_string(), "4.7");
        assert_eq!(dec("-4.65").round_dp(1).to_string(), "-4.7");
        assert_eq!(dec("4.64").round_dp(1).to_string(), "4.6");
    }

    #[test]
    fn test_ceil_floor() {
        assert_eq!(dec("1.2").ceil(), 2);
        assert_eq!(dec("-1.2").ceil(), -1);
        assert_eq!(dec("1.8").floor(), 1);
        assert_eq!(dec("-1.2").floor(), -2);
    }

    #[test]
    fn test_ordering_across_scales() {
        assert!(dec("0.5") < dec("0.75"));
        assert_eq!(dec("1.50"), dec("1.5"));
        assert!(dec("-2") < dec("0.1"));
    }

    #[test]
    fn test_from_float_uses_shortest_repr() {
        assert_eq!(Decimal::from_float(0.1).to_string(), "0.1");
        assert_eq!(Decimal::from_float(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_parse_exponent() {
        assert_eq!(dec("1.5e2").to_i64(), 150);
        assert_eq!(dec("25e-3").to_string(), "0.025");
    }
}
