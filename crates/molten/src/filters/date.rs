//! The `date` filter.
//!
//! Accepts `"now"`/`"today"`, Unix timestamps and a handful of common string
//! formats; formats with strftime directives via chrono. Unparseable input
//! passes through unchanged, matching the reference engine.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};

use crate::error::RunError;
use crate::filters::filter_error;
use crate::value::Value;

pub(crate) fn date(input: &Value, format: &Value) -> Result<Value, RunError> {
    let format = format.to_output_string();
    if format.is_empty() {
        return Ok(input.clone());
    }
    let Some(moment) = parse_input(input) else {
        return Ok(input.clone());
    };

    let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(filter_error("invalid date format"));
    }
    Ok(Value::from(moment.format_with_items(items.into_iter()).to_string()))
}

fn parse_input(input: &Value) -> Option<DateTime<Local>> {
    match input {
        Value::Int(timestamp) => Local.timestamp_opt(*timestamp, 0).single(),
        Value::Str(s) => {
            let s = s.trim();
            if s.eq_ignore_ascii_case("now") || s.eq_ignore_ascii_case("today") {
                return Some(Local::now());
            }
            if let Ok(timestamp) = s.parse::<i64>() {
                return Local.timestamp_opt(timestamp, 0).single();
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Local));
            }
            if let Ok(parsed) = DateTime::parse_from_rfc2822(s) {
                return Some(parsed.with_timezone(&Local));
            }
            for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, pattern) {
                    return Local.from_local_datetime(&naive).single();
                }
            }
            if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Local.from_local_datetime(&day.and_hms_opt(0, 0, 0)?).single();
            }
            None
        }
        _ => None,
    }
}
