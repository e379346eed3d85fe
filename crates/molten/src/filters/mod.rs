//! The standard filter set.
//!
//! Filters are pure functions from an input value plus arguments to a value;
//! they never touch the scope. Dispatch goes through the [`StandardFilter`]
//! enum (strum-parsed from the source name) so the VM and the optimizer's
//! constant folder share one implementation. Numeric filters coerce through
//! [`Decimal`](crate::decimal::Decimal) rather than `f64`; see
//! [`num::to_number`].

pub(crate) mod array;
pub(crate) mod date;
pub(crate) mod num;
pub(crate) mod string;

use std::str::FromStr;
use std::sync::Arc;

use strum::EnumString;

use crate::error::RunError;
use crate::ir::CmpOp;
use crate::value::Value;

/// Signature for application-registered filters.
///
/// Errors are plain messages; the engine wraps them as filter errors with
/// position attribution.
pub type CustomFilter = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync>;

/// All built-in filters, parsed from their template-source names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum StandardFilter {
    Abs,
    Append,
    AtLeast,
    AtMost,
    Capitalize,
    Ceil,
    Compact,
    Concat,
    Date,
    Default,
    DividedBy,
    Downcase,
    Escape,
    EscapeOnce,
    First,
    Floor,
    Join,
    Json,
    Last,
    Lstrip,
    Map,
    Minus,
    Modulo,
    NewlineToBr,
    Plus,
    Prepend,
    Remove,
    RemoveFirst,
    Replace,
    ReplaceFirst,
    Reverse,
    Round,
    Rstrip,
    Size,
    Slice,
    Sort,
    SortNatural,
    Split,
    Strip,
    StripHtml,
    StripNewlines,
    Sum,
    Times,
    Truncate,
    Truncatewords,
    Uniq,
    Upcase,
    UrlDecode,
    UrlEncode,
    Where,
}

/// Builds a filter error.
pub(crate) fn filter_error(message: impl Into<String>) -> RunError {
    RunError::Filter(message.into())
}

/// Whether `name` names a built-in filter.
pub(crate) fn is_builtin(name: &str) -> bool {
    StandardFilter::from_str(name).is_ok()
}

/// Whether `name` is safe to evaluate at compile time.
///
/// Everything except `date` (which reads the clock for `"now"`) is a pure
/// function of its inputs.
pub(crate) fn is_pure(name: &str) -> bool {
    !matches!(StandardFilter::from_str(name), Ok(StandardFilter::Date) | Err(_))
}

/// Applies a built-in filter.
///
/// Unknown names are a runtime error here; the VM checks custom filters and
/// the strict-filter policy before calling this.
pub(crate) fn apply(name: &str, input: &Value, args: &[Value]) -> Result<Value, RunError> {
    let filter =
        StandardFilter::from_str(name).map_err(|_| RunError::runtime(format!("unknown filter `{name}`")))?;
    match filter {
        StandardFilter::Abs => num::abs(input),
        StandardFilter::AtLeast => num::at_least(input, arg(args, 0)),
        StandardFilter::AtMost => num::at_most(input, arg(args, 0)),
        StandardFilter::Ceil => num::ceil(input),
        StandardFilter::DividedBy => num::divided_by(input, arg(args, 0)),
        StandardFilter::Floor => num::floor(input),
        StandardFilter::Minus => num::minus(input, arg(args, 0)),
        StandardFilter::Modulo => num::modulo(input, arg(args, 0)),
        StandardFilter::Plus => num::plus(input, arg(args, 0)),
        StandardFilter::Round => num::round(input, args.first()),
        StandardFilter::Times => num::times(input, arg(args, 0)),

        StandardFilter::Append => Ok(string::append(input, arg(args, 0))),
        StandardFilter::Capitalize => Ok(string::capitalize(input)),
        StandardFilter::Downcase => Ok(string::downcase(input)),
        StandardFilter::Escape => Ok(string::escape(input)),
        StandardFilter::EscapeOnce => Ok(string::escape_once(input)),
        StandardFilter::Lstrip => Ok(string::lstrip(input)),
        StandardFilter::NewlineToBr => Ok(string::newline_to_br(input)),
        StandardFilter::Prepend => Ok(string::prepend(input, arg(args, 0))),
        StandardFilter::Remove => Ok(string::replace(input, arg(args, 0), &Value::from(""))),
        StandardFilter::RemoveFirst => Ok(string::replace_first(input, arg(args, 0), &Value::from(""))),
        StandardFilter::Replace => Ok(string::replace(input, arg(args, 0), arg(args, 1))),
        StandardFilter::ReplaceFirst => Ok(string::replace_first(input, arg(args, 0), arg(args, 1))),
        StandardFilter::Rstrip => Ok(string::rstrip(input)),
        StandardFilter::Split => Ok(string::split(input, arg(args, 0))),
        StandardFilter::Strip => Ok(string::strip(input)),
        StandardFilter::StripHtml => Ok(string::strip_html(input)),
        StandardFilter::StripNewlines => Ok(string::strip_newlines(input)),
        StandardFilter::Truncate => string::truncate(input, args),
        StandardFilter::Truncatewords => string::truncatewords(input, args),
        StandardFilter::Upcase => Ok(string::upcase(input)),
        StandardFilter::UrlDecode => string::url_decode(input),
        StandardFilter::UrlEncode => Ok(string::url_encode(input)),

        StandardFilter::Compact => Ok(array::compact(input)),
        StandardFilter::Concat => array::concat(input, arg(args, 0)),
        StandardFilter::First => Ok(array::first(input)),
        StandardFilter::Join => Ok(array::join(input, args.first())),
        StandardFilter::Last => Ok(array::last(input)),
        StandardFilter::Map => Ok(array::map(input, arg(args, 0))),
        StandardFilter::Reverse => Ok(array::reverse(input)),
        StandardFilter::Size => Ok(array::size(input)),
        StandardFilter::Slice => array::slice(input, args),
        StandardFilter::Sort => array::sort(input, args.first(), false),
        StandardFilter::SortNatural => array::sort(input, args.first(), true),
        StandardFilter::Sum => array::sum(input, args.first()),
        StandardFilter::Uniq => Ok(array::uniq(input)),
        StandardFilter::Where => Ok(array::where_filter(input, arg(args, 0), args.get(1))),

        StandardFilter::Date => date::date(input, arg(args, 0)),
        StandardFilter::Default => Ok(default_filter(input, args)),
        StandardFilter::Json => Ok(Value::from(input.to_json().to_string())),
    }
}

/// `default`: replaces nil, false and empty values, honoring the
/// `allow_false` named argument.
fn default_filter(input: &Value, args: &[Value]) -> Value {
    let fallback = arg(args, 0);
    let allow_false = args
        .iter()
        .find_map(|argument| match argument {
            Value::Map(map) => map.get("allow_false").map(Value::is_truthy),
            _ => None,
        })
        .unwrap_or(false);
    let keep = if allow_false && matches!(input, Value::Bool(false)) {
        true
    } else {
        input.is_truthy() && !input.matches_empty()
    };
    if keep { input.clone() } else { fallback.clone() }
}

/// The `i`th positional argument, nil when absent.
pub(crate) fn arg<'a>(args: &'a [Value], index: usize) -> &'a Value {
    args.get(index).unwrap_or(&Value::Nil)
}

/// Strict integer coercion for filter arguments: the message is the standard
/// `invalid integer` surfaced by truncate/slice/limit-style positions.
pub(crate) fn int_arg(value: &Value) -> Result<i64, RunError> {
    value.as_int().ok_or_else(|| filter_error("invalid integer"))
}

/// Shared comparison semantics for `Compare` (VM dispatch and constant
/// folding). Equality never fails; ordering incomparable kinds does.
pub(crate) fn compare_values(a: &Value, b: &Value, op: CmpOp) -> Result<bool, RunError> {
    use std::cmp::Ordering;
    match op {
        CmpOp::Eq => Ok(a.loose_eq(b)),
        CmpOp::Ne => Ok(!a.loose_eq(b)),
        _ => {
            let ordering = a.loose_cmp(b).ok_or_else(|| {
                RunError::runtime(format!("cannot compare {} with {}", a.type_name(), b.type_name()))
            })?;
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Ge => ordering != Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_source_name() {
        assert!(is_builtin("divided_by"));
        assert!(is_builtin("url_encode"));
        assert!(!is_builtin("no_such_filter"));
    }

    #[test]
    fn test_date_is_impure_everything_else_pure() {
        assert!(!is_pure("date"));
        assert!(is_pure("upcase"));
        assert!(is_pure("json"));
        assert!(!is_pure("custom_thing"));
    }

    #[test]
    fn test_default_filter() {
        let fallback = [Value::from("fb")];
        assert_eq!(apply("default", &Value::Nil, &fallback).unwrap(), Value::from("fb"));
        assert_eq!(apply("default", &Value::from(""), &fallback).unwrap(), Value::from("fb"));
        assert_eq!(apply("default", &Value::from("x"), &fallback).unwrap(), Value::from("x"));
        assert_eq!(
            apply("default", &Value::Bool(false), &fallback).unwrap(),
            Value::from("fb")
        );

        let mut opts = crate::value::ValueMap::new();
        opts.insert("allow_false".to_owned(), Value::Bool(true));
        let with_opts = [Value::from("fb"), Value::map(opts)];
        assert_eq!(
            apply("default", &Value::Bool(false), &with_opts).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_compare_values() {
        use crate::ir::CmpOp;
        assert!(compare_values(&Value::Int(1), &Value::Float(1.0), CmpOp::Eq).unwrap());
        assert!(compare_values(&Value::Int(1), &Value::Int(2), CmpOp::Lt).unwrap());
        assert!(compare_values(&Value::Int(1), &Value::from("x"), CmpOp::Ne).unwrap());
        assert!(compare_values(&Value::Int(1), &Value::from("x"), CmpOp::Lt).is_err());
    }
}
