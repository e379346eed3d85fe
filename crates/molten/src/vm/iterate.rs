//! Collection materialization for `for` and `tablerow`.

use std::sync::Arc;

use crate::error::{RunError, RunResult};
use crate::value::Value;

/// One active loop: the materialized sequence plus the cursor.
#[derive(Debug)]
pub(crate) struct LoopIter {
    pub items: Vec<Value>,
    pub index: usize,
    pub loop_name: Arc<str>,
}

impl LoopIter {
    pub(crate) fn empty(loop_name: Arc<str>) -> Self {
        Self {
            items: Vec::new(),
            index: 0,
            loop_name,
        }
    }

    /// Advances the cursor, returning the next item.
    pub(crate) fn next(&mut self) -> Option<Value> {
        let item = self.items.get(self.index).cloned()?;
        self.index += 1;
        Some(item)
    }
}

/// Materializes a collection: nil, false and other scalars iterate empty, a
/// non-empty string iterates once with itself, hashes yield `[key, value]`
/// pairs, ranges expand, arrays and drop sequences pass through.
pub(crate) fn materialize(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.to_vec(),
        Value::Range(r) => r.iter().map(Value::Int).collect(),
        Value::Str(s) if !s.is_empty() => vec![Value::Str(s.clone())],
        Value::Map(map) => map
            .iter()
            .map(|(k, v)| Value::array(vec![Value::from(k.as_str()), v.clone()]))
            .collect(),
        Value::Drop(drop) => drop.iterate().unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Applies the loop modifiers in order: offset, then limit, then reversal.
///
/// `offset` and `limit` must coerce to integers; a float or non-numeric
/// string is the standard `invalid integer` runtime error.
pub(crate) fn apply_modifiers(
    mut items: Vec<Value>,
    offset: Option<&Value>,
    limit: Option<&Value>,
    reversed: bool,
) -> RunResult<(Vec<Value>, usize)> {
    let from = match offset {
        Some(value) => clamp(coerce_int(value)?),
        None => 0,
    };
    items = if from >= items.len() { Vec::new() } else { items.split_off(from) };
    if let Some(value) = limit {
        let limit = clamp(coerce_int(value)?);
        items.truncate(limit);
    }
    if reversed {
        items.reverse();
    }
    Ok((items, from))
}

fn coerce_int(value: &Value) -> RunResult<i64> {
    value
        .as_int()
        .ok_or_else(|| RunError::runtime("invalid integer"))
}

fn clamp(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(0)
}
