//! Raw column values as handed over by database drivers.
//!
//! Drivers map whatever their wire protocol produces into `DbValue`. Values
//! that need further I/O to materialize (large objects) or that only the
//! driver knows how to render are carried behind traits, so the sanitizer
//! can bound the work it does on them.

use std::fmt;
use std::io::Read;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::error::DbError;

/// Character large object.
pub trait CharLob: Send + Sync + fmt::Debug {
    /// Reads at most `max_chars` characters in a single call.
    fn read_prefix(&self, max_chars: usize) -> Result<String, DbError>;

    /// Opens a UTF-8 byte stream over the whole object.
    fn open_stream(&self) -> Result<Box<dyn Read + Send + '_>, DbError>;
}

/// Binary large object.
pub trait ByteLob: Send + Sync + fmt::Debug {
    /// Reads at most `max_bytes` bytes.
    fn read_prefix(&self, max_bytes: usize) -> Result<Vec<u8>, DbError>;
}

/// A vendor value the engine has no dedicated variant for.
pub trait DriverValue: Send + Sync + fmt::Debug {
    /// Driver type name, used in logs.
    fn type_name(&self) -> &str;

    /// Textual rendering of the value, if the driver can produce one.
    fn render(&self) -> Result<String, DbError>;
}

/// Raw value of one result cell.
#[derive(Debug)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision number in its decimal text form.
    Decimal(String),
    Text(String),
    /// Driver wrapper around textual content (json/jsonb, xml, ...).
    Json(String),
    Clob(Box<dyn CharLob>),
    Blob(Box<dyn ByteLob>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    /// Vendor timestamp type that only renders itself as text.
    VendorTimestamp(Box<dyn DriverValue>),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    /// Row / composite type, attribute name to value.
    Struct(Vec<(String, DbValue)>),
    Array(Vec<DbValue>),
    Other(Box<dyn DriverValue>),
}

impl DbValue {
    /// Short name of the variant, for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            DbValue::Null => "null",
            DbValue::Bool(_) => "bool",
            DbValue::Int(_) => "int",
            DbValue::Float(_) => "float",
            DbValue::Decimal(_) => "decimal",
            DbValue::Text(_) => "text",
            DbValue::Json(_) => "json",
            DbValue::Clob(_) => "clob",
            DbValue::Blob(_) => "blob",
            DbValue::Date(_) => "date",
            DbValue::Time(_) => "time",
            DbValue::Timestamp(_) => "timestamp",
            DbValue::TimestampTz(_) => "timestamptz",
            DbValue::VendorTimestamp(_) => "vendor_timestamp",
            DbValue::Bytes(_) => "bytes",
            DbValue::Uuid(_) => "uuid",
            DbValue::Struct(_) => "struct",
            DbValue::Array(_) => "array",
            DbValue::Other(_) => "other",
        }
    }
}

impl From<&str> for DbValue {
    fn from(s: &str) -> Self {
        DbValue::Text(s.to_string())
    }
}

impl From<String> for DbValue {
    fn from(s: String) -> Self {
        DbValue::Text(s)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Int(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Float(v)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Bool(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(DbValue::Null, Into::into)
    }
}
