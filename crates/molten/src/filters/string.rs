//! String filters.
//!
//! Inputs are coerced through their output conversion, so numbers and nil
//! behave the way they would when written directly.

use std::sync::Arc;

use crate::error::RunError;
use crate::filters::{filter_error, int_arg};
use crate::value::Value;

fn text(value: &Value) -> String {
    value.to_output_string()
}

pub(crate) fn append(input: &Value, suffix: &Value) -> Value {
    Value::from(format!("{}{}", text(input), text(suffix)))
}

pub(crate) fn prepend(input: &Value, prefix: &Value) -> Value {
    Value::from(format!("{}{}", text(prefix), text(input)))
}

pub(crate) fn upcase(input: &Value) -> Value {
    Value::from(text(input).to_uppercase())
}

pub(crate) fn downcase(input: &Value) -> Value {
    Value::from(text(input).to_lowercase())
}

/// First character up, the rest down, like Ruby's `String#capitalize`.
pub(crate) fn capitalize(input: &Value) -> Value {
    let s = text(input);
    let mut chars = s.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    };
    Value::from(capitalized)
}

pub(crate) fn strip(input: &Value) -> Value {
    Value::from(text(input).trim().to_owned())
}

pub(crate) fn lstrip(input: &Value) -> Value {
    Value::from(text(input).trim_start().to_owned())
}

pub(crate) fn rstrip(input: &Value) -> Value {
    Value::from(text(input).trim_end().to_owned())
}

pub(crate) fn strip_newlines(input: &Value) -> Value {
    let s = text(input);
    Value::from(s.chars().filter(|&c| c != '\n' && c != '\r').collect::<String>())
}

pub(crate) fn newline_to_br(input: &Value) -> Value {
    let s = text(input);
    let mut out = String::with_capacity(s.len());
    let mut rest = s.as_str();
    while let Some(at) = rest.find('\n') {
        let line = &rest[..at];
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push_str("<br />\n");
        rest = &rest[at + 1..];
    }
    out.push_str(rest);
    Value::from(out)
}

pub(crate) fn replace(input: &Value, from: &Value, to: &Value) -> Value {
    Value::from(text(input).replace(&text(from), &text(to)))
}

pub(crate) fn replace_first(input: &Value, from: &Value, to: &Value) -> Value {
    Value::from(text(input).replacen(&text(from), &text(to), 1))
}

/// Splits into an array of strings. An empty separator yields one element
/// per character; trailing empty fields are dropped, as Ruby's split does.
pub(crate) fn split(input: &Value, separator: &Value) -> Value {
    let s = text(input);
    let sep = text(separator);
    let mut parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::from(c.to_string())).collect()
    } else {
        s.split(sep.as_str()).map(Value::from).collect()
    };
    while matches!(parts.last(), Some(Value::Str(last)) if last.is_empty()) {
        parts.pop();
    }
    Value::array(parts)
}

pub(crate) fn escape(input: &Value) -> Value {
    let s = text(input);
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    Value::from(out)
}

/// Escapes while leaving existing entities untouched.
pub(crate) fn escape_once(input: &Value) -> Value {
    let s = text(input);
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = s[i..].chars().next().expect("i is on a char boundary");
        if c == '&'
            && let Some(end) = s[i + 1..].find(';')
            && end > 0
            && end <= 8
            && s[i + 1..i + 1 + end]
                .chars()
                .all(|e| e.is_ascii_alphanumeric() || e == '#')
        {
            out.push_str(&s[i..=i + 1 + end]);
            i += end + 2;
            continue;
        }
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
        i += c.len_utf8();
    }
    Value::from(out)
}

/// Removes tags plus the contents of script and style elements, without a
/// regex engine: a small scanner walking the text once.
pub(crate) fn strip_html(input: &Value) -> Value {
    let s = text(input);
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s.as_bytes()[i] == b'<' {
            // Swallow script/style bodies entirely.
            if let Some(next) = swallow_element(&s, i, "script").or_else(|| swallow_element(&s, i, "style")) {
                i = next;
                continue;
            }
            match s[i..].find('>') {
                Some(end) => {
                    i += end + 1;
                    continue;
                }
                None => break,
            }
        }
        let c = s[i..].chars().next().expect("i is on a char boundary");
        out.push(c);
        i += c.len_utf8();
    }
    Value::from(out)
}

/// If `<name …>` opens at `at`, returns the byte offset just past its
/// matching `</name …>` close tag. Byte-wise and ASCII-case-insensitive so
/// multibyte text cannot desynchronize the scan.
fn swallow_element(s: &str, at: usize, name: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let open = format!("<{name}");
    if bytes.len() < at + open.len() || !bytes[at..at + open.len()].eq_ignore_ascii_case(open.as_bytes()) {
        return None;
    }
    let close = format!("</{name}");
    let mut j = at + open.len();
    while j + close.len() <= bytes.len() {
        if bytes[j] == b'<' && bytes[j..j + close.len()].eq_ignore_ascii_case(close.as_bytes()) {
            let tail = s[j..].find('>')?;
            return Some(j + tail + 1);
        }
        j += 1;
    }
    None
}

/// Truncates to `length` characters, ellipsis included in the budget.
pub(crate) fn truncate(input: &Value, args: &[Value]) -> Result<Value, RunError> {
    let s = text(input);
    let length = match args.first() {
        None | Some(Value::Nil) => 50,
        Some(value) => usize::try_from(int_arg(value)?.max(0)).unwrap_or(0),
    };
    let ellipsis = match args.get(1) {
        None | Some(Value::Nil) => "...".to_owned(),
        Some(value) => text(value),
    };
    if s.chars().count() <= length {
        return Ok(Value::from(s));
    }
    let keep = length.saturating_sub(ellipsis.chars().count());
    let truncated: String = s.chars().take(keep).collect();
    Ok(Value::from(format!("{truncated}{ellipsis}")))
}

/// Truncates to `count` whitespace-separated words.
pub(crate) fn truncatewords(input: &Value, args: &[Value]) -> Result<Value, RunError> {
    let s = text(input);
    let count = match args.first() {
        None | Some(Value::Nil) => 15,
        Some(value) => usize::try_from(int_arg(value)?.max(1)).unwrap_or(1),
    };
    let ellipsis = match args.get(1) {
        None | Some(Value::Nil) => "...".to_owned(),
        Some(value) => text(value),
    };
    let words: Vec<&str> = s.split_whitespace().collect();
    if words.len() <= count {
        return Ok(Value::from(s));
    }
    Ok(Value::from(format!("{}{ellipsis}", words[..count].join(" "))))
}

/// Percent-encoding with `+` for spaces, like CGI escaping.
pub(crate) fn url_encode(input: &Value) -> Value {
    let s = text(input);
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => out.push(byte as char),
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    Value::from(out)
}

pub(crate) fn url_decode(input: &Value) -> Result<Value, RunError> {
    let s = text(input);
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| filter_error("invalid byte sequence"))?;
                out.push(hex);
                i += 2;
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    let decoded = String::from_utf8(out).map_err(|_| filter_error("invalid byte sequence"))?;
    Ok(Value::Str(Arc::from(decoded.as_str())))
}
