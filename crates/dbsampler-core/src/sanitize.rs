//! Conversion of raw driver values into bounded, JSON-safe values.
//!
//! Every cell of every layer and query passes through [`Sanitizer`]. The
//! conversion is total: a value that cannot be read degrades to
//! [`SanitizeLimits::placeholder`] instead of failing the row, text is cut at
//! a fixed number of characters, binary content at a fixed number of bytes,
//! and nested values stop at a fixed depth.

use std::io::{ErrorKind, Read};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, trace};

use crate::error::DbError;
use crate::result::Row;
use crate::value::{CharLob, DbValue};

/// Maximum characters kept from strings and textual wrappers.
pub const MAX_STRING_CHARS: usize = 100_000;

/// Maximum characters read from a character large object.
pub const MAX_CLOB_CHARS: usize = 100_000;

/// Maximum bytes read from binary content before base64 encoding.
pub const MAX_BLOB_BYTES: usize = 65_536;

/// Maximum nesting of structs and arrays that is expanded.
pub const MAX_DEPTH: usize = 3;

/// Replacement for values that cannot be read.
pub const PLACEHOLDER: &str = "[unreadable]";

/// Read size used when a character large object is streamed.
const CLOB_CHUNK_BYTES: usize = 8 * 1024;

/// Size and depth bounds applied by the sanitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeLimits {
    pub max_string_chars: usize,
    pub max_clob_chars: usize,
    pub max_blob_bytes: usize,
    pub max_depth: usize,
    pub placeholder: String,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_string_chars: MAX_STRING_CHARS,
            max_clob_chars: MAX_CLOB_CHARS,
            max_blob_bytes: MAX_BLOB_BYTES,
            max_depth: MAX_DEPTH,
            placeholder: PLACEHOLDER.to_string(),
        }
    }
}

/// Converts driver values into JSON values.
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    limits: SanitizeLimits,
}

impl Sanitizer {
    pub fn new(limits: SanitizeLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SanitizeLimits {
        &self.limits
    }

    /// Sanitizes a single value.
    pub fn sanitize(&self, value: &DbValue) -> Value {
        self.sanitize_at(value, 0)
    }

    /// Sanitizes one result row into a column-name keyed map.
    ///
    /// Columns keep their result-set order. Missing trailing values become null.
    pub fn sanitize_row(&self, columns: &[String], values: &[DbValue]) -> Row {
        let mut row = Map::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            let value = values
                .get(idx)
                .map_or(Value::Null, |v| self.sanitize(v));
            row.insert(column.clone(), value);
        }
        row
    }

    fn sanitize_at(&self, value: &DbValue, depth: usize) -> Value {
        match value {
            DbValue::Null => Value::Null,
            DbValue::Bool(b) => Value::Bool(*b),
            DbValue::Int(i) => Value::Number((*i).into()),
            DbValue::Float(f) => float_value(*f),
            DbValue::Decimal(d) => self.decimal_value(d),
            DbValue::Text(s) | DbValue::Json(s) => self.text_value(s),
            DbValue::Clob(lob) => match self.read_clob(lob.as_ref()) {
                Ok(text) => Value::String(text),
                Err(e) => self.unreadable("clob", &e),
            },
            DbValue::Blob(lob) => match lob.read_prefix(self.limits.max_blob_bytes) {
                Ok(bytes) => self.bytes_value(&bytes),
                Err(e) => self.unreadable("blob", &e),
            },
            DbValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            DbValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            DbValue::Timestamp(ts) => {
                Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            DbValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
            DbValue::VendorTimestamp(v) | DbValue::Other(v) => match v.render() {
                Ok(text) => self.text_value(&text),
                Err(e) => self.unreadable(v.type_name(), &e),
            },
            DbValue::Bytes(bytes) => self.bytes_value(bytes),
            DbValue::Uuid(u) => Value::String(u.to_string()),
            DbValue::Struct(fields) => {
                if depth >= self.limits.max_depth {
                    return self.placeholder();
                }
                let mut object = Map::with_capacity(fields.len());
                for (name, field) in fields {
                    object.insert(name.clone(), self.sanitize_at(field, depth + 1));
                }
                Value::Object(object)
            }
            DbValue::Array(items) => {
                if depth >= self.limits.max_depth {
                    return self.placeholder();
                }
                Value::Array(
                    items
                        .iter()
                        .map(|item| self.sanitize_at(item, depth + 1))
                        .collect(),
                )
            }
        }
    }

    fn text_value(&self, s: &str) -> Value {
        Value::String(truncate_chars(s, self.limits.max_string_chars))
    }

    fn bytes_value(&self, bytes: &[u8]) -> Value {
        let end = bytes.len().min(self.limits.max_blob_bytes);
        Value::String(BASE64.encode(&bytes[..end]))
    }

    fn decimal_value(&self, text: &str) -> Value {
        if let Ok(i) = text.parse::<i64>() {
            return Value::Number(i.into());
        }
        if let Ok(u) = text.parse::<u64>() {
            return Value::Number(u.into());
        }
        // Only numbers that survive the f64 round trip unchanged; the rest keep their digits.
        match text.parse::<f64>() {
            Ok(f) if trim_fraction(&f.to_string()) == trim_fraction(text) => {
                match Number::from_f64(f) {
                    Some(n) => Value::Number(n),
                    None => self.text_value(text),
                }
            }
            _ => self.text_value(text),
        }
    }

    fn read_clob(&self, lob: &dyn CharLob) -> Result<String, DbError> {
        let max_chars = self.limits.max_clob_chars;
        match lob.read_prefix(max_chars) {
            Ok(text) => Ok(truncate_chars(&text, max_chars)),
            Err(e) => {
                debug!(error = %e, "clob bulk read failed, streaming instead");
                self.stream_clob(lob)
            }
        }
    }

    /// Streams a character object in chunks until the character budget is covered.
    fn stream_clob(&self, lob: &dyn CharLob) -> Result<String, DbError> {
        let max_chars = self.limits.max_clob_chars;
        let byte_budget = max_chars.saturating_mul(4);
        let mut stream = lob.open_stream()?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; CLOB_CHUNK_BYTES];
        let mut chars = 0usize;

        while buf.len() < byte_budget && chars < max_chars {
            let want = CLOB_CHUNK_BYTES.min(byte_budget - buf.len());
            let n = match stream.read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(DbError::Decode(e.to_string())),
            };
            // Continuation bytes do not start a character.
            chars += chunk[..n].iter().filter(|b| (**b & 0xC0) != 0x80).count();
            buf.extend_from_slice(&chunk[..n]);
        }

        Ok(truncate_chars(&String::from_utf8_lossy(&buf), max_chars))
    }

    fn unreadable(&self, what: &str, error: &DbError) -> Value {
        trace!(value_type = what, error = %error, "value replaced by placeholder");
        self.placeholder()
    }

    fn placeholder(&self) -> Value {
        Value::String(self.limits.placeholder.clone())
    }
}

fn float_value(f: f64) -> Value {
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        // NaN and infinities have no JSON number form.
        None => Value::String(f.to_string()),
    }
}

/// Drops insignificant trailing zeros of a decimal fraction ("1.50" -> "1.5", "2.0" -> "2").
fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Cuts `s` to at most `max_chars` characters.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.len() <= max_chars {
        return s.to_string();
    }
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBlob, MockClob, MockDriverValue};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn small_limits() -> Sanitizer {
        Sanitizer::new(SanitizeLimits {
            max_string_chars: 10,
            max_clob_chars: 12,
            max_blob_bytes: 6,
            max_depth: 3,
            placeholder: PLACEHOLDER.to_string(),
        })
    }

    fn nested(levels: usize) -> DbValue {
        let mut value = DbValue::Int(1);
        for _ in 0..levels {
            value = DbValue::Array(vec![value]);
        }
        value
    }

    #[test]
    fn test_primitives_pass_through() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize(&DbValue::Null), Value::Null);
        assert_eq!(s.sanitize(&DbValue::Bool(true)), Value::Bool(true));
        assert_eq!(s.sanitize(&DbValue::Int(-42)), serde_json::json!(-42));
        assert_eq!(s.sanitize(&DbValue::Float(1.5)), serde_json::json!(1.5));
    }

    #[test]
    fn test_non_finite_float_becomes_string() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize(&DbValue::Float(f64::NAN)), serde_json::json!("NaN"));
    }

    #[test]
    fn test_decimal_keeps_numeric_form() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize(&DbValue::Decimal("12".into())), serde_json::json!(12));
        assert_eq!(
            s.sanitize(&DbValue::Decimal("0.25".into())),
            serde_json::json!(0.25)
        );
        assert_eq!(
            s.sanitize(&DbValue::Decimal("NaN".into())),
            serde_json::json!("NaN")
        );
    }

    #[test]
    fn test_decimal_beyond_f64_keeps_digits() {
        let s = Sanitizer::default();
        for text in [
            "12345678901234567890.123",
            "0.1000000000000000000001",
            "99999999999999999999",
        ] {
            assert_eq!(s.sanitize(&DbValue::Decimal(text.into())), serde_json::json!(text));
        }
        assert_eq!(
            s.sanitize(&DbValue::Decimal("1.50".into())),
            serde_json::json!(1.5)
        );
        assert_eq!(
            s.sanitize(&DbValue::Decimal("-42.125".into())),
            serde_json::json!(-42.125)
        );
    }

    #[test]
    fn test_string_truncated_to_cap() {
        let s = small_limits();
        let out = s.sanitize(&DbValue::Text("x".repeat(1000)));
        assert_eq!(out.as_str().unwrap().chars().count(), 10);

        let json = s.sanitize(&DbValue::Json("{\"key\": \"a long value\"}".into()));
        assert_eq!(json.as_str().unwrap(), "{\"key\": \"a");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let s = small_limits();
        let out = s.sanitize(&DbValue::Text("ж".repeat(50)));
        assert_eq!(out.as_str().unwrap(), "ж".repeat(10));
    }

    #[test]
    fn test_clob_bulk_read_is_capped() {
        let s = small_limits();
        let lob = MockClob::new("y".repeat(500));
        let out = s.sanitize(&DbValue::Clob(Box::new(lob)));
        assert_eq!(out.as_str().unwrap(), "y".repeat(12));
    }

    #[test]
    fn test_clob_falls_back_to_streaming() {
        let s = small_limits();
        let lob = MockClob::new("stream me please, all of it").failing_bulk_read();
        let out = s.sanitize(&DbValue::Clob(Box::new(lob)));
        assert_eq!(out.as_str().unwrap(), "stream me pl");
    }

    #[test]
    fn test_clob_streaming_large_object_stays_bounded() {
        let s = Sanitizer::default();
        let lob = MockClob::new("é".repeat(MAX_CLOB_CHARS * 3)).failing_bulk_read();
        let out = s.sanitize(&DbValue::Clob(Box::new(lob)));
        assert_eq!(out.as_str().unwrap().chars().count(), MAX_CLOB_CHARS);
    }

    #[test]
    fn test_unreadable_clob_becomes_placeholder() {
        let s = small_limits();
        let lob = MockClob::new("x").failing_bulk_read().failing_stream();
        assert_eq!(
            s.sanitize(&DbValue::Clob(Box::new(lob))),
            serde_json::json!(PLACEHOLDER)
        );
    }

    #[test]
    fn test_blob_is_capped_and_base64_encoded() {
        let s = small_limits();
        let out = s.sanitize(&DbValue::Blob(Box::new(MockBlob::new(vec![0xFF; 100]))));
        let decoded = BASE64.decode(out.as_str().unwrap()).unwrap();
        assert_eq!(decoded, vec![0xFF; 6]);

        let failed = s.sanitize(&DbValue::Blob(Box::new(MockBlob::failing())));
        assert_eq!(failed, serde_json::json!(PLACEHOLDER));
    }

    #[test]
    fn test_bytes_and_uuid() {
        let s = Sanitizer::default();
        assert_eq!(
            s.sanitize(&DbValue::Bytes(b"hi".to_vec())),
            serde_json::json!("aGk=")
        );
        let id = uuid::Uuid::from_u128(0x1234);
        assert_eq!(
            s.sanitize(&DbValue::Uuid(id)),
            serde_json::json!("00000000-0000-0000-0000-000000001234")
        );
    }

    #[test]
    fn test_temporal_values_render_canonically() {
        let s = Sanitizer::default();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(s.sanitize(&DbValue::Date(date)), serde_json::json!("2024-03-09"));

        let ts = date.and_hms_milli_opt(7, 5, 3, 250).unwrap();
        assert_eq!(
            s.sanitize(&DbValue::Timestamp(ts)),
            serde_json::json!("2024-03-09T07:05:03.250")
        );

        let tz = Utc.from_utc_datetime(&ts).fixed_offset();
        assert_eq!(
            s.sanitize(&DbValue::TimestampTz(tz)),
            serde_json::json!("2024-03-09T07:05:03.250+00:00")
        );

        let vendor = MockDriverValue::rendering("TIMESTAMP WITH LOCAL TZ", "2024-03-09 07:05:03");
        assert_eq!(
            s.sanitize(&DbValue::VendorTimestamp(Box::new(vendor))),
            serde_json::json!("2024-03-09 07:05:03")
        );
    }

    #[test]
    fn test_other_values_render_or_degrade() {
        let s = small_limits();
        let ok = MockDriverValue::rendering("INTERVAL", "1 day 02:00:00 and more");
        assert_eq!(
            s.sanitize(&DbValue::Other(Box::new(ok))),
            serde_json::json!("1 day 02:0")
        );
        let broken = MockDriverValue::unreadable("GEOMETRY");
        assert_eq!(
            s.sanitize(&DbValue::Other(Box::new(broken))),
            serde_json::json!(PLACEHOLDER)
        );
    }

    #[test]
    fn test_struct_within_depth_is_expanded() {
        let s = Sanitizer::default();
        let value = DbValue::Struct(vec![
            ("id".to_string(), DbValue::Int(7)),
            (
                "tags".to_string(),
                DbValue::Array(vec![DbValue::Text("a".into()), DbValue::Null]),
            ),
        ]);
        assert_eq!(
            s.sanitize(&value),
            serde_json::json!({"id": 7, "tags": ["a", null]})
        );
    }

    #[test]
    fn test_nesting_beyond_max_depth_becomes_placeholder() {
        let s = Sanitizer::default();
        assert_eq!(s.sanitize(&nested(3)), serde_json::json!([[[1]]]));
        assert_eq!(
            s.sanitize(&nested(4)),
            serde_json::json!([[[PLACEHOLDER]]])
        );
        // Very deep input still terminates with the same bounded shape.
        assert_eq!(
            s.sanitize(&nested(500)),
            serde_json::json!([[[PLACEHOLDER]]])
        );
    }

    #[test]
    fn test_sanitize_row_keeps_column_order() {
        let s = Sanitizer::default();
        let columns = vec!["z".to_string(), "a".to_string(), "m".to_string()];
        let row = s.sanitize_row(&columns, &[DbValue::Int(1), DbValue::Text("x".into())]);
        let keys: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(row["m"], Value::Null);
    }
}
