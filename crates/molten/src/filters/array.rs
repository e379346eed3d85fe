//! Collection filters.
//!
//! Most accept strings and ranges too, materializing them the way a `for`
//! loop would; scalar inputs pass through untouched where the reference
//! engine does the same.

use std::cmp::Ordering;

use crate::error::RunError;
use crate::filters::{filter_error, int_arg, num};
use crate::value::Value;

/// Materializes array-like inputs for the collection filters. Scalars come
/// back as a single-element array; nil as empty.
fn elements(input: &Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items.to_vec(),
        Value::Range(r) => r.iter().map(Value::Int).collect(),
        Value::Nil => Vec::new(),
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| Value::array(vec![Value::from(k.as_str()), v.clone()]))
            .collect(),
        other => vec![other.clone()],
    }
}

pub(crate) fn join(input: &Value, glue: Option<&Value>) -> Value {
    let glue = glue.map_or_else(|| " ".to_owned(), Value::to_output_string);
    let joined = elements(input)
        .iter()
        .map(Value::to_output_string)
        .collect::<Vec<_>>()
        .join(&glue);
    Value::from(joined)
}

pub(crate) fn first(input: &Value) -> Value {
    input
        .property_command("first")
        .or_else(|| elements(input).first().cloned())
        .unwrap_or(Value::Nil)
}

pub(crate) fn last(input: &Value) -> Value {
    input
        .property_command("last")
        .or_else(|| elements(input).last().cloned())
        .unwrap_or(Value::Nil)
}

pub(crate) fn size(input: &Value) -> Value {
    input.property_command("size").unwrap_or(Value::Int(0))
}

/// Arrays and ranges reverse; strings and scalars pass through unchanged.
pub(crate) fn reverse(input: &Value) -> Value {
    match input {
        Value::Array(_) | Value::Range(_) => {
            let mut items = elements(input);
            items.reverse();
            Value::array(items)
        }
        other => other.clone(),
    }
}

pub(crate) fn compact(input: &Value) -> Value {
    let items = elements(input)
        .into_iter()
        .filter(|item| !matches!(item, Value::Nil))
        .collect();
    Value::array(items)
}

pub(crate) fn uniq(input: &Value) -> Value {
    let mut unique: Vec<Value> = Vec::new();
    for item in elements(input) {
        if !unique.iter().any(|seen| seen.loose_eq(&item)) {
            unique.push(item);
        }
    }
    Value::array(unique)
}

pub(crate) fn concat(input: &Value, other: &Value) -> Result<Value, RunError> {
    let Value::Array(tail) = other else {
        return Err(filter_error("concat filter requires an array argument"));
    };
    let mut items = elements(input);
    items.extend(tail.iter().cloned());
    Ok(Value::array(items))
}

/// Projects a property out of each element (`map: 'title'`).
pub(crate) fn map(input: &Value, property: &Value) -> Value {
    let key = property.to_output_string();
    let items = elements(input)
        .into_iter()
        .map(|item| lookup(&item, &key))
        .collect();
    Value::array(items)
}

/// Keeps elements whose property equals `target`, or is truthy when no
/// target is given.
pub(crate) fn where_filter(input: &Value, property: &Value, target: Option<&Value>) -> Value {
    let key = property.to_output_string();
    let items = elements(input)
        .into_iter()
        .filter(|item| {
            let candidate = lookup(item, &key);
            match target {
                Some(target) => candidate.loose_eq(target),
                None => candidate.is_truthy(),
            }
        })
        .collect();
    Value::array(items)
}

fn lookup(item: &Value, key: &str) -> Value {
    match item {
        Value::Map(map) => map.get(key).cloned().unwrap_or(Value::Nil),
        Value::Drop(drop) => drop.index(&Value::from(key)).unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

/// Sorts, optionally by property; `natural` compares case-insensitively.
pub(crate) fn sort(input: &Value, property: Option<&Value>, natural: bool) -> Result<Value, RunError> {
    let key = property.map(Value::to_output_string);
    let mut items = elements(input);
    let mut failed = false;
    items.sort_by(|a, b| {
        let (left, right) = match &key {
            Some(key) => (lookup(a, key), lookup(b, key)),
            None => (a.clone(), b.clone()),
        };
        let ordering = if natural {
            natural_cmp(&left, &right)
        } else {
            left.loose_cmp(&right)
        };
        ordering.unwrap_or_else(|| {
            failed = true;
            Ordering::Equal
        })
    });
    if failed {
        return Err(filter_error("cannot sort values of incompatible types"));
    }
    Ok(Value::array(items))
}

fn natural_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
        _ => a.loose_cmp(b),
    }
}

/// Numeric sum, optionally of a property.
pub(crate) fn sum(input: &Value, property: Option<&Value>) -> Result<Value, RunError> {
    let key = property.map(Value::to_output_string);
    let mut total = Value::Int(0);
    for item in elements(input) {
        let operand = match &key {
            Some(key) => lookup(&item, key),
            None => item,
        };
        total = num::plus(&total, &operand)?;
    }
    Ok(total)
}

/// Character/element slice with negative offsets counting from the end.
pub(crate) fn slice(input: &Value, args: &[Value]) -> Result<Value, RunError> {
    let offset = int_arg(crate::filters::arg(args, 0))?;
    let length = match args.get(1) {
        None | Some(Value::Nil) => 1,
        Some(value) => int_arg(value)?.max(0),
    };
    let length = usize::try_from(length).unwrap_or(0);

    if let Value::Array(items) = input {
        let start = resolve_offset(offset, items.len());
        let picked: Vec<Value> = items.iter().skip(start).take(length).cloned().collect();
        return Ok(Value::array(picked));
    }
    let s = input.to_output_string();
    let count = s.chars().count();
    let start = resolve_offset(offset, count);
    let picked: String = s.chars().skip(start).take(length).collect();
    Ok(Value::from(picked))
}

fn resolve_offset(offset: i64, len: usize) -> usize {
    if offset < 0 {
        let back = usize::try_from(-offset).unwrap_or(usize::MAX);
        len.saturating_sub(back)
    } else {
        usize::try_from(offset).unwrap_or(usize::MAX)
    }
}
