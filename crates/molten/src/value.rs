//! The tagged runtime value type and its conversion rules.
//!
//! Values are immutable trees; `Arc` makes cloning cheap so the VM can move
//! them freely between the stack, scope frames and filter calls without a
//! tracing heap. The single polymorphic escape hatch is
//! [`Value::Drop`], documented in [`crate::drop_object`].

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::decimal::Decimal;
use crate::drop_object::DropObject;

/// Insertion-ordered string-keyed map used by [`Value::Map`].
pub type ValueMap = IndexMap<String, Value>;

/// A lazy inclusive integer range, `start..end`.
///
/// Materialized only when iterated; `(1..1000000)` costs nothing to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeValue {
    pub start: i64,
    pub end: i64,
}

impl RangeValue {
    /// Number of integers in the range; zero when `end < start`.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::try_from(self.end - self.start + 1).unwrap_or(usize::MAX)
        }
    }

    /// True when the range contains no integers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Iterates the contained integers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i64> + use<> {
        self.start..=self.end
    }
}

impl fmt::Display for RangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Primary runtime value.
///
/// `Empty` and `Blank` are comparison sentinels produced only by the `empty`
/// and `blank` keywords; they never appear inside containers built by the
/// engine itself.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact base-10 number produced by numeric filters; see
    /// [`crate::decimal`].
    Decimal(Decimal),
    Str(Arc<str>),
    Array(Arc<Vec<Value>>),
    Map(Arc<ValueMap>),
    Range(RangeValue),
    /// The `empty` keyword: equal to empty strings and empty containers.
    Empty,
    /// The `blank` keyword: equal to nil, false, whitespace-only strings and
    /// empty containers.
    Blank,
    /// Opaque host object; see [`DropObject`].
    Drop(Arc<dyn DropObject>),
}

impl Value {
    /// Wraps a string slice.
    #[must_use]
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    /// Wraps an array.
    #[must_use]
    pub fn array(items: Vec<Self>) -> Self {
        Self::Array(Arc::new(items))
    }

    /// Wraps a map.
    #[must_use]
    pub fn map(map: ValueMap) -> Self {
        Self::Map(Arc::new(map))
    }

    /// Short name of the value's kind, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) | Self::Decimal(_) => "number",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "hash",
            Self::Range(_) => "range",
            Self::Empty => "empty",
            Self::Blank => "blank",
            Self::Drop(_) => "drop",
        }
    }

    /// Borrows the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer coercion for positions, limits and range bounds.
    ///
    /// Floats are rejected rather than truncated: the engine raises
    /// `invalid integer` where a float reaches an integer position.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Decimal(d) if d.scale() == 0 => Some(d.to_i64()),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Truthiness: only nil and false are falsy. Empty strings and empty
    /// containers are truthy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil | Self::Bool(false) => false,
            Self::Drop(d) => match d.to_liquid_value() {
                Some(v) => v.is_truthy(),
                None => true,
            },
            _ => true,
        }
    }

    /// Whether `self == empty` holds: empty strings and empty containers.
    #[must_use]
    pub fn matches_empty(&self) -> bool {
        match self {
            Self::Str(s) => s.is_empty(),
            Self::Array(a) => a.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Empty | Self::Blank => true,
            _ => false,
        }
    }

    /// Whether `self == blank` holds: nil, false, whitespace-only strings
    /// and empty containers.
    #[must_use]
    pub fn matches_blank(&self) -> bool {
        match self {
            Self::Nil | Self::Bool(false) => true,
            Self::Str(s) => s.chars().all(char::is_whitespace),
            Self::Array(a) => a.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Empty | Self::Blank => true,
            _ => false,
        }
    }

    /// Appends the output form of the value to `out`.
    ///
    /// Conversion rules: nil and the sentinels render as nothing, booleans as
    /// `true`/`false`, numbers in canonical decimal form, arrays as the
    /// concatenation of their items, hashes as JSON, drops through their
    /// `to_liquid` view.
    pub fn write_output(&self, out: &mut String) {
        use fmt::Write;
        match self {
            Self::Nil | Self::Empty | Self::Blank => {}
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => {
                let mut buffer = ryu::Buffer::new();
                out.push_str(buffer.format(*f));
            }
            Self::Decimal(d) => {
                let _ = write!(out, "{d}");
            }
            Self::Str(s) => out.push_str(s),
            Self::Array(items) => {
                for item in items.iter() {
                    item.write_output(out);
                }
            }
            Self::Map(_) => {
                let _ = write!(out, "{}", self.to_json());
            }
            Self::Range(r) => {
                let _ = write!(out, "{r}");
            }
            Self::Drop(d) => {
                if let Some(view) = d.to_liquid() {
                    view.write_output(out);
                }
            }
        }
    }

    /// The output form as an owned string.
    #[must_use]
    pub fn to_output_string(&self) -> String {
        let mut out = String::new();
        self.write_output(&mut out);
        out
    }

    /// Numeric view for comparisons; strings are deliberately not coerced
    /// (`"1" == 1` is false).
    fn as_number(&self) -> Option<Num> {
        match self {
            Self::Int(i) => Some(Num::Int(*i)),
            Self::Float(f) => Some(Num::Float(*f)),
            Self::Decimal(d) => Some(Num::Dec(*d)),
            _ => None,
        }
    }

    /// Equality per template semantics.
    ///
    /// The `empty`/`blank` sentinels compare structurally; drops compare
    /// through `to_liquid_value` and fall back to identity; values of
    /// incomparable kinds are simply unequal.
    #[must_use]
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Empty, _) => other.matches_empty(),
            (_, Self::Empty) => self.matches_empty(),
            (Self::Blank, _) => other.matches_blank(),
            (_, Self::Blank) => self.matches_blank(),
            (Self::Drop(a), Self::Drop(b)) => match (a.to_liquid_value(), b.to_liquid_value()) {
                (Some(va), Some(vb)) => va.loose_eq(&vb),
                _ => Arc::ptr_eq(a, b),
            },
            (Self::Drop(d), _) => d.to_liquid_value().is_some_and(|v| v.loose_eq(other)),
            (_, Self::Drop(d)) => d.to_liquid_value().is_some_and(|v| self.loose_eq(&v)),
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y)),
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|other_v| v.loose_eq(other_v)))
            }
            (Self::Range(a), Self::Range(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a.cmp_num(b) == Ordering::Equal,
                _ => false,
            },
        }
    }

    /// Equality as used by `case`/`when` clauses.
    ///
    /// Stricter sentinel handling than [`loose_eq`](Self::loose_eq): `when
    /// empty` matches only empty strings and containers, and `when blank`
    /// matches only whitespace-only strings and empty containers; neither
    /// matches nil or false the way a direct `== blank` comparison does.
    #[must_use]
    pub fn case_eq(&self, other: &Self) -> bool {
        let sentinel = |sentinel: &Self, subject: &Self| match sentinel {
            Self::Empty => subject.matches_empty(),
            Self::Blank => match subject {
                Self::Str(s) => s.chars().all(char::is_whitespace),
                Self::Array(a) => a.is_empty(),
                Self::Map(m) => m.is_empty(),
                Self::Empty | Self::Blank => true,
                _ => false,
            },
            _ => unreachable!("sentinel helper called on non-sentinel"),
        };
        match (self, other) {
            (Self::Empty | Self::Blank, _) => sentinel(self, other),
            (_, Self::Empty | Self::Blank) => sentinel(other, self),
            _ => self.loose_eq(other),
        }
    }

    /// Whether a `for` loop over this value would run zero iterations.
    ///
    /// Mirrors the VM's materialization rules: nil, false and scalars do not
    /// iterate; a string iterates as a single element unless empty.
    #[must_use]
    pub fn iterates_empty(&self) -> bool {
        match self {
            Self::Nil | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Decimal(_) | Self::Empty | Self::Blank => {
                true
            }
            Self::Str(s) => s.is_empty(),
            Self::Array(a) => a.is_empty(),
            Self::Map(m) => m.is_empty(),
            Self::Range(r) => r.is_empty(),
            Self::Drop(d) => d.iterate().is_none_or(|items| items.is_empty()),
        }
    }

    /// Ordering for `<`, `<=`, `>`, `>=`.
    ///
    /// Numbers order numerically with promotion, strings lexicographically;
    /// anything else is incomparable and yields `None` (the VM raises).
    #[must_use]
    pub fn loose_cmp(&self, other: &Self) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return Some(a.cmp_num(b));
        }
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.as_ref().cmp(b.as_ref())),
            _ => None,
        }
    }

    /// The `contains` operator: substring for strings, membership for arrays,
    /// key presence for hashes.
    #[must_use]
    pub fn contains(&self, needle: &Self) -> bool {
        match self {
            Self::Str(s) => s.contains(needle.to_output_string().as_str()),
            Self::Array(items) => items.iter().any(|item| item.loose_eq(needle)),
            Self::Map(map) => map.contains_key(needle.to_output_string().as_str()),
            Self::Range(r) => needle.as_int().is_some_and(|i| i >= r.start && i <= r.end),
            _ => false,
        }
    }

    /// The `size`/`first`/`last` property commands supported by strings,
    /// arrays, hashes and ranges.
    #[must_use]
    pub fn property_command(&self, name: &str) -> Option<Self> {
        match name {
            "size" => match self {
                Self::Str(s) => Some(Self::Int(s.chars().count() as i64)),
                Self::Array(a) => Some(Self::Int(a.len() as i64)),
                Self::Map(m) => Some(Self::Int(m.len() as i64)),
                Self::Range(r) => Some(Self::Int(r.len() as i64)),
                _ => None,
            },
            "first" => match self {
                Self::Str(s) => s.chars().next().map(|c| Self::string(c.to_string())),
                Self::Array(a) => a.first().cloned(),
                Self::Range(r) => (!r.is_empty()).then_some(Self::Int(r.start)),
                _ => None,
            },
            "last" => match self {
                Self::Str(s) => s.chars().next_back().map(|c| Self::string(c.to_string())),
                Self::Array(a) => a.last().cloned(),
                Self::Range(r) => (!r.is_empty()).then_some(Self::Int(r.end)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Converts to a JSON value, used by the `json` filter and hash output.
    ///
    /// Drops convert through `to_liquid`; an opaque drop becomes `null`.
    /// Ranges expand to arrays, matching their iteration behavior.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Self::Nil | Self::Empty | Self::Blank => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::Decimal(d) => serde_json::Number::from_f64(d.to_f64()).map_or(Json::Null, Json::Number),
            Self::Str(s) => Json::String(s.to_string()),
            Self::Array(items) => Json::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Json::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Self::Range(r) => Json::Array(r.iter().map(Json::from).collect()),
            Self::Drop(d) => d.to_liquid().map_or(Json::Null, |v| v.to_json()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.loose_eq(other)
    }
}

/// Promoted number for mixed-kind comparison.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
    Dec(Decimal),
}

impl Num {
    fn cmp_num(self, other: Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(&b),
            (Self::Dec(a), Self::Dec(b)) => a.cmp(&b),
            (Self::Dec(a), Self::Int(b)) => a.cmp(&Decimal::from_int(b)),
            (Self::Int(a), Self::Dec(b)) => Decimal::from_int(a).cmp(&b),
            // A float operand forces float comparison; NaN sorts equal to
            // everything, which template sources cannot produce anyway.
            (a, b) => a.to_f64().partial_cmp(&b.to_f64()).unwrap_or(Ordering::Equal),
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
            Self::Dec(d) => d.to_f64(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::array(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match v {
            Json::Null => Self::Nil,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Self::from(s),
            Json::Array(items) => Self::array(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => {
                let map: ValueMap = map.into_iter().map(|(k, v)| (k, Self::from(v))).collect();
                Self::map(map)
            }
        }
    }
}
