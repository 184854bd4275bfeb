//! Input sanitizing shared by every write path.
//!
//! Payloads arrive as loose JSON from the browser client. These helpers
//! normalise them the same way for products, entities, invoices and cash
//! entries: tags stripped and HTML escaped, numbers coerced, ids checked.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::{Uuid, Variant};

use crate::error::{AppError, AppResult};

/// True for a hyphenated, RFC 4122 variant, version 4 UUID.
pub fn is_valid_uuid(candidate: &str) -> bool {
    if candidate.len() != 36 {
        return false;
    }
    match Uuid::parse_str(candidate) {
        Ok(id) => id.get_version_num() == 4 && id.get_variant() == Variant::RFC4122,
        Err(_) => false,
    }
}

/// Trim, strip HTML tags, and escape the remaining markup characters.
///
/// A `<` only opens a tag when a letter, `/`, `!` or `?` follows it, so text
/// such as `27G < 30mm` survives. Entities that are already escaped are not
/// escaped again, which makes the result stable when a sanitized value is
/// sanitized a second time (a replayed outbox payload, for example).
pub fn sanitize_string(raw: &str) -> String {
    let stripped = strip_tags(raw.trim());

    let mut escaped = String::with_capacity(stripped.len());
    let text = stripped.trim();
    for (i, c) in text.char_indices() {
        match c {
            '&' if starts_with_entity(&text[i..]) => escaped.push('&'),
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn opens_tag(next: Option<char>) -> bool {
    matches!(next, Some(c) if c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'))
}

fn strip_tags(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_tag = false;
    while let Some(c) = chars.next() {
        if in_tag {
            if c == '>' {
                in_tag = false;
            }
        } else if c == '<' && opens_tag(chars.peek().copied()) {
            in_tag = true;
        } else {
            stripped.push(c);
        }
    }
    stripped
}

const ESCAPED_ENTITIES: [&str; 5] = ["&amp;", "&lt;", "&gt;", "&quot;", "&#039;"];

fn starts_with_entity(text: &str) -> bool {
    ESCAPED_ENTITIES.iter().any(|entity| text.starts_with(entity))
}

/// Coerce a JSON value to a float. Null, empty and unparsable input give 0.
pub fn sanitize_float(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        _ => 0.0,
    }
}

/// Coerce a JSON value to an integer, truncating fractional input.
pub fn sanitize_int(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i64))
                .unwrap_or(0)
        }
        Some(Value::Bool(b)) => i64::from(*b),
        _ => 0,
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

/// Fail with every field that is absent, null, or an empty string.
pub fn require_fields(payload: &Value, fields: &[&str]) -> AppResult<()> {
    let missing: Vec<String> = fields
        .iter()
        .filter(|field| is_blank(payload.get(**field)))
        .map(|field| field.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::MissingFields(missing))
    }
}

/// Sanitized string field, or `None` when blank.
pub fn optional_string(payload: &Value, key: &str) -> Option<String> {
    let raw = payload.get(key)?;
    let text = match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let clean = sanitize_string(&text);
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Sanitized string field that has already passed `require_fields`.
pub fn required_string(payload: &Value, key: &str) -> AppResult<String> {
    optional_string(payload, key).ok_or_else(|| AppError::MissingFields(vec![key.to_string()]))
}

/// Use the payload's `id` when present (it must be a v4 UUID), otherwise
/// mint a new one.
pub fn resolve_id(payload: &Value) -> AppResult<String> {
    match payload.get("id") {
        None | Some(Value::Null) => Ok(Uuid::new_v4().to_string()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Uuid::new_v4().to_string()),
        Some(Value::String(s)) => {
            let id = s.trim();
            if is_valid_uuid(id) {
                Ok(id.to_lowercase())
            } else {
                Err(AppError::Validation("Invalid ID format".into()))
            }
        }
        Some(_) => Err(AppError::Validation("Invalid ID format".into())),
    }
}

/// An existing record's id, which must be present and well formed.
pub fn existing_id(raw: Option<&str>) -> AppResult<String> {
    let id = raw.map(str::trim).unwrap_or_default();
    if is_valid_uuid(id) {
        Ok(id.to_lowercase())
    } else {
        Err(AppError::Validation("Invalid ID format".into()))
    }
}

/// Normalise a client timestamp to UTC `YYYY-MM-DDTHH:MM:SSZ`. Accepts RFC
/// 3339 or a bare `YYYY-MM-DD` (midnight UTC); `None` means now.
pub fn normalize_timestamp(raw: Option<String>) -> AppResult<String> {
    let Some(raw) = raw else {
        return Ok(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%SZ").to_string());
    }
    if let Ok(day) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        return Ok(format!("{}T00:00:00Z", day.format("%Y-%m-%d")));
    }
    Err(AppError::Validation(format!("Invalid date: {raw}")))
}

/// Round a money amount to cents.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
