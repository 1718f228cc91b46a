//! Tolerant coercion of oracle responses into JSON values.
//!
//! The extraction oracle returns free-form text that is *expected* to
//! contain exactly one JSON value, but in practice arrives in several
//! dialects despite explicit instructions:
//!
//! - raw JSON, exactly as asked
//! - JSON wrapped in a ` ```json … ``` ` fence (models love disobeying
//!   "no backticks")
//! - a Python-literal-style structure with single quotes, `True`/`False`/
//!   `None`
//! - prose around any of the above
//!
//! This module is the single shared parsing contract consumed by every
//! stage, so the tolerance rules live in exactly one place. Anything that
//! cannot be coerced normalises to "no usable result" for that call —
//! never a crash.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").unwrap());

/// Extract the one JSON value a response is expected to contain.
///
/// Tries, in order: the contents of a fenced block, the raw trimmed text,
/// and a Python-literal reinterpretation of either. Returns `None` when no
/// reading yields valid JSON.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let candidate = match RE_FENCED.captures(trimmed) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or(trimmed),
        None => trimmed,
    };

    if let Ok(v) = serde_json::from_str::<Value>(candidate) {
        return Some(v);
    }
    if let Some(jsonish) = python_literal_to_json(candidate) {
        if let Ok(v) = serde_json::from_str::<Value>(&jsonish) {
            return Some(v);
        }
    }
    None
}

/// Coerce a value to the rows of a table-shaped response: an array keeps
/// its object elements (non-objects are dropped), a bare object becomes a
/// one-element table. Scalars yield no rows.
pub fn object_rows(value: Value) -> Vec<serde_json::Map<String, Value>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(map) => vec![map],
        _ => Vec::new(),
    }
}

/// Require an array-shaped response. Objects (and scalars) are rejected —
/// used by stages whose contract demands a list.
pub fn expect_array(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

/// Read a monetary amount that may arrive as a JSON number or a string.
///
/// String amounts tolerate surrounding whitespace, embedded group spaces
/// and a comma decimal separator (when no dot is present).
pub fn amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let mut cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
            if cleaned.contains(',') && !cleaned.contains('.') {
                cleaned = cleaned.replace(',', ".");
            }
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// Read a field as a string: strings pass through, numbers are formatted,
/// null and anything else become empty.
pub fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Best-effort translation of a Python-literal structure to JSON text:
/// single-quoted strings become double-quoted, `True`/`False`/`None`
/// become their JSON spellings. Contents of strings are preserved.
fn python_literal_to_json(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut changed = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                // Re-emit the single-quoted string as a JSON string.
                changed = true;
                out.push('"');
                while let Some(sc) = chars.next() {
                    match sc {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(esc) => {
                                out.push('\\');
                                out.push(esc);
                            }
                            None => return None,
                        },
                        '\'' => break,
                        '"' => out.push_str("\\\""),
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            '"' => {
                // A double-quoted string: copy verbatim, honouring escapes.
                out.push('"');
                while let Some(sc) = chars.next() {
                    out.push(sc);
                    match sc {
                        '\\' => {
                            if let Some(esc) = chars.next() {
                                out.push(esc);
                            }
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::new();
                word.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "True" => {
                        out.push_str("true");
                        changed = true;
                    }
                    "False" => {
                        out.push_str("false");
                        changed = true;
                    }
                    "None" => {
                        out.push_str("null");
                        changed = true;
                    }
                    other => out.push_str(other),
                }
            }
            other => out.push(other),
        }
    }

    if changed {
        Some(out)
    } else {
        None
    }
}
