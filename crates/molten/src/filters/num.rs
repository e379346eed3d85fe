//! Numeric filters.
//!
//! Operands coerce through [`to_number`]: integers stay integers, floats and
//! numeric strings become exact decimals, everything else counts as zero
//! (matching the reference engine's `to_number`). Two integer operands
//! produce an integer; any decimal operand produces a decimal.

use crate::decimal::Decimal;
use crate::error::RunError;
use crate::filters::filter_error;
use crate::value::Value;

/// A coerced numeric operand.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Int(i64),
    Dec(Decimal),
}

impl Number {
    fn into_value(self) -> Value {
        match self {
            Self::Int(i) => Value::Int(i),
            Self::Dec(d) => Value::Decimal(d),
        }
    }
}

/// Coerces a value for arithmetic. Non-numeric input counts as zero.
pub(crate) fn to_number(value: &Value) -> Number {
    match value {
        Value::Int(i) => Number::Int(*i),
        Value::Float(f) => Number::Dec(Decimal::from_float(*f)),
        Value::Decimal(d) => Number::Dec(*d),
        Value::Str(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Number::Int(i)
            } else if let Ok(d) = trimmed.parse::<Decimal>() {
                Number::Dec(d)
            } else {
                Number::Int(0)
            }
        }
        _ => Number::Int(0),
    }
}

/// Applies an integer op and a decimal op after promotion.
fn binary(
    a: &Value,
    b: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    dec_op: impl Fn(Decimal, Decimal) -> Option<Decimal>,
) -> Result<Value, RunError> {
    let result = match (to_number(a), to_number(b)) {
        (Number::Int(x), Number::Int(y)) => int_op(x, y).map(Number::Int),
        (x, y) => dec_op(promote(x), promote(y)).map(Number::Dec),
    };
    result
        .map(Number::into_value)
        .ok_or_else(|| filter_error("numeric overflow"))
}

fn promote(n: Number) -> Decimal {
    match n {
        Number::Int(i) => Decimal::from_int(i),
        Number::Dec(d) => d,
    }
}

pub(crate) fn plus(a: &Value, b: &Value) -> Result<Value, RunError> {
    binary(a, b, i64::checked_add, Decimal::checked_add)
}

pub(crate) fn minus(a: &Value, b: &Value) -> Result<Value, RunError> {
    binary(a, b, i64::checked_sub, Decimal::checked_sub)
}

pub(crate) fn times(a: &Value, b: &Value) -> Result<Value, RunError> {
    binary(a, b, i64::checked_mul, Decimal::checked_mul)
}

/// Floored integer division, as Ruby's `Integer#/`.
fn floor_div(x: i64, y: i64) -> Option<i64> {
    let quotient = x.checked_div(y)?;
    if x % y != 0 && (x < 0) != (y < 0) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

/// Remainder matching Ruby's `%`: takes the divisor's sign.
fn floor_rem(x: i64, y: i64) -> Option<i64> {
    let remainder = x.checked_rem(y)?;
    if remainder != 0 && (remainder < 0) != (y < 0) {
        Some(remainder + y)
    } else {
        Some(remainder)
    }
}

/// Integer division floors toward negative infinity, as Ruby's does.
pub(crate) fn divided_by(a: &Value, b: &Value) -> Result<Value, RunError> {
    match (to_number(a), to_number(b)) {
        (_, Number::Int(0)) => Err(filter_error("divided by 0")),
        (Number::Int(x), Number::Int(y)) => floor_div(x, y)
            .map(Value::Int)
            .ok_or_else(|| filter_error("numeric overflow")),
        (x, y) => {
            let y = promote(y);
            if y.is_zero() {
                return Err(filter_error("divided by 0"));
            }
            promote(x)
                .checked_div(y)
                .map(Value::Decimal)
                .ok_or_else(|| filter_error("numeric overflow"))
        }
    }
}

/// Remainder with the sign of the divisor, as Ruby's `%`.
pub(crate) fn modulo(a: &Value, b: &Value) -> Result<Value, RunError> {
    match (to_number(a), to_number(b)) {
        (_, Number::Int(0)) => Err(filter_error("divided by 0")),
        (Number::Int(x), Number::Int(y)) => floor_rem(x, y)
            .map(Value::Int)
            .ok_or_else(|| filter_error("numeric overflow")),
        (x, y) => {
            let y = promote(y);
            if y.is_zero() {
                return Err(filter_error("divided by 0"));
            }
            promote(x)
                .checked_rem(y)
                .map(Value::Decimal)
                .ok_or_else(|| filter_error("numeric overflow"))
        }
    }
}

pub(crate) fn abs(input: &Value) -> Result<Value, RunError> {
    Ok(match to_number(input) {
        Number::Int(i) => Value::Int(i.saturating_abs()),
        Number::Dec(d) => Value::Decimal(d.abs()),
    })
}

pub(crate) fn ceil(input: &Value) -> Result<Value, RunError> {
    Ok(match to_number(input) {
        Number::Int(i) => Value::Int(i),
        Number::Dec(d) => Value::Int(d.ceil()),
    })
}

pub(crate) fn floor(input: &Value) -> Result<Value, RunError> {
    Ok(match to_number(input) {
        Number::Int(i) => Value::Int(i),
        Number::Dec(d) => Value::Int(d.floor()),
    })
}

/// `round` with no argument (or zero digits) returns an integer.
pub(crate) fn round(input: &Value, digits: Option<&Value>) -> Result<Value, RunError> {
    let digits_n = match digits {
        None | Some(Value::Nil) => 0,
        Some(value) => crate::filters::int_arg(value)?.max(0),
    };
    match to_number(input) {
        Number::Int(i) => Ok(Value::Int(i)),
        Number::Dec(d) => {
            let rounded = d.round_dp(u32::try_from(digits_n).unwrap_or(0));
            if digits_n == 0 {
                Ok(Value::Int(rounded.to_i64()))
            } else {
                Ok(Value::Decimal(rounded))
            }
        }
    }
}

pub(crate) fn at_least(a: &Value, b: &Value) -> Result<Value, RunError> {
    pick(a, b, true)
}

pub(crate) fn at_most(a: &Value, b: &Value) -> Result<Value, RunError> {
    pick(a, b, false)
}

fn pick(a: &Value, b: &Value, larger: bool) -> Result<Value, RunError> {
    let left = promote(to_number(a));
    let right = promote(to_number(b));
    let use_right = if larger { right > left } else { right < left };
    let chosen = if use_right { to_number(b) } else { to_number(a) };
    Ok(chosen.into_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(v: Result<Value, RunError>) -> String {
        v.unwrap().to_output_string()
    }

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        assert_eq!(out(plus(&Value::Int(1), &Value::Int(2))), "3");
        assert_eq!(out(times(&Value::Int(4), &Value::Int(5))), "20");
    }

    #[test]
    fn test_decimal_addition_avoids_float_noise() {
        assert_eq!(out(plus(&Value::Float(0.1), &Value::Float(0.2))), "0.3");
    }

    #[test]
    fn test_numeric_strings_coerce() {
        assert_eq!(out(plus(&Value::from("1.5"), &Value::Int(1))), "2.5");
        assert_eq!(out(plus(&Value::from("junk"), &Value::Int(1))), "1");
    }

    #[test]
    fn test_integer_division_floors() {
        assert_eq!(out(divided_by(&Value::Int(20), &Value::Int(7))), "2");
        assert_eq!(out(divided_by(&Value::Int(-20), &Value::Int(7))), "-3");
    }

    #[test]
    fn test_division_by_zero() {
        let err = divided_by(&Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.message(), "divided by 0");
    }

    #[test]
    fn test_modulo_takes_divisor_sign() {
        assert_eq!(out(modulo(&Value::Int(-7), &Value::Int(3))), "2");
    }

    #[test]
    fn test_round_and_friends() {
        assert_eq!(out(round(&Value::Float(4.6), None)), "5");
        assert_eq!(out(round(&Value::Float(4.5612), Some(&Value::Int(2)))), "4.56");
        assert_eq!(out(ceil(&Value::Float(1.2))), "2");
        assert_eq!(out(floor(&Value::Float(-1.2))), "-2");
    }

    #[test]
    fn test_round_rejects_float_digits() {
        let err = round(&Value::Float(1.5), Some(&Value::Float(1.5))).unwrap_err();
        assert_eq!(err.message(), "invalid integer");
    }

    #[test]
    fn test_at_least_at_most() {
        assert_eq!(out(at_least(&Value::Int(4), &Value::Int(5))), "5");
        assert_eq!(out(at_most(&Value::Int(4), &Value::Int(5))), "4");
    }
}
