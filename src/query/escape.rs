//! Identifier and literal escaping, MySQL rules.
//!
//! Identifiers are wrapped in backticks with embedded backticks doubled.
//! Dotted names are quoted per part (`t.id` → `` `t`.`id` ``) unless the
//! caller forbids qualification (insert/update column names). A bare `*`
//! part is never quoted.
//!
//! Literals use the same escape table as the MySQL client libraries: NUL,
//! backspace, tab, newline, carriage return, Ctrl-Z, both quote characters
//! and the backslash are backslash-escaped inside single quotes.

use crate::query::value::Value;
use std::fmt::Write;

/// Quote an identifier, splitting on `.` into qualified parts.
pub fn escape_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, part) in name.split('.').enumerate() {
        if i > 0 {
            out.push('.');
        }
        push_id_part(&mut out, part);
    }
    out
}

/// Quote an identifier as a single part; dots are kept inside the quotes.
pub fn escape_id_unqualified(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    push_id_part(&mut out, name);
    out
}

fn push_id_part(out: &mut String, part: &str) {
    if part == "*" {
        out.push('*');
        return;
    }
    out.push('`');
    for c in part.chars() {
        if c == '`' {
            out.push('`');
        }
        out.push(c);
    }
    out.push('`');
}

/// Escape a string into a single-quoted literal.
pub fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{1a}' => out.push_str("\\Z"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render a value as a SQL literal.
///
/// Non-finite floats have no SQL literal and render as `NULL`.
pub fn escape_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "true" } else { "false" }).to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::String(s) => escape_string(s),
        Value::Bytes(bytes) => {
            let mut out = String::with_capacity(bytes.len() * 2 + 3);
            out.push_str("X'");
            for b in bytes {
                let _ = write!(out, "{:02x}", b);
            }
            out.push('\'');
            out
        }
        Value::Date(d) => escape_string(&d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => escape_string(&dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::Json(json) => escape_string(&json.to_string()),
    }
}

/// Escape a list of values joined by `sep`.
pub fn escape_values<'a>(values: impl IntoIterator<Item = &'a Value>, sep: &str) -> String {
    values
        .into_iter()
        .map(escape_value)
        .collect::<Vec<_>>()
        .join(sep)
}
