//! Binary column decoding.
//!
//! Columns are first captured untyped as [`RawValue`] (any type, nullable)
//! and then decoded by their PostgreSQL type. Types without a decoder become
//! opaque values that refuse to render.

use std::error::Error;
use std::fmt::Write;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use postgres::types::{FromSql, Kind, PgLsn, Type};

use crate::error::DbError;
use crate::value::{DbValue, DriverValue};

type BoxError = Box<dyn Error + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Column value captured before decoding.
#[derive(Debug, Clone)]
pub(crate) struct RawValue {
    ty: Type,
    raw: Option<Vec<u8>>,
}

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self {
            ty: ty.clone(),
            raw: Some(raw.to_vec()),
        })
    }

    fn from_sql_null(ty: &Type) -> Result<Self, BoxError> {
        Ok(Self {
            ty: ty.clone(),
            raw: None,
        })
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

impl RawValue {
    #[cfg(test)]
    pub(crate) fn new(ty: Type, raw: Option<Vec<u8>>) -> Self {
        Self { ty, raw }
    }

    /// Decodes the value; failures become an opaque value.
    pub(crate) fn decode(&self) -> DbValue {
        let Some(raw) = self.raw.as_deref() else {
            return DbValue::Null;
        };
        decode_typed(&self.ty, raw).unwrap_or_else(|e| {
            DbValue::Other(Box::new(PgOpaque {
                type_name: self.ty.name().to_string(),
                reason: e.to_string(),
            }))
        })
    }
}

fn decode_typed(ty: &Type, raw: &[u8]) -> Result<DbValue, BoxError> {
    let value = match *ty {
        Type::BOOL => DbValue::Bool(bool::from_sql(ty, raw)?),
        Type::CHAR => DbValue::Text((i8::from_sql(ty, raw)? as u8 as char).to_string()),
        Type::INT2 => DbValue::Int(i16::from_sql(ty, raw)?.into()),
        Type::INT4 => DbValue::Int(i32::from_sql(ty, raw)?.into()),
        Type::INT8 => DbValue::Int(i64::from_sql(ty, raw)?),
        Type::OID
        | Type::XID
        | Type::CID
        | Type::REGCLASS
        | Type::REGPROC
        | Type::REGTYPE
        | Type::REGNAMESPACE
        | Type::REGROLE => DbValue::Int(Reader { buf: raw }.u32()?.into()),
        Type::XID8 => {
            let xid = Reader { buf: raw }.u64()?;
            match i64::try_from(xid) {
                Ok(v) => DbValue::Int(v),
                Err(_) => DbValue::Decimal(xid.to_string()),
            }
        }
        Type::FLOAT4 => DbValue::Float(f32::from_sql(ty, raw)?.into()),
        Type::FLOAT8 => DbValue::Float(f64::from_sql(ty, raw)?),
        Type::NUMERIC => DbValue::Decimal(numeric_to_string(raw)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            DbValue::Text(String::from_sql(ty, raw)?)
        }
        Type::XML => DbValue::Text(std::str::from_utf8(raw)?.to_string()),
        Type::INET | Type::CIDR => DbValue::Text(inet_to_string(raw)?),
        Type::MACADDR => DbValue::Text(hex_octets(Reader { buf: raw }.take(6)?)),
        Type::MACADDR8 => DbValue::Text(hex_octets(Reader { buf: raw }.take(8)?)),
        Type::PG_LSN => DbValue::Text(PgLsn::from_sql(ty, raw)?.to_string()),
        Type::TID => {
            let mut r = Reader { buf: raw };
            let block = r.u32()?;
            let offset = r.u16()?;
            DbValue::Text(format!("({block},{offset})"))
        }
        Type::JSON | Type::JSONB => DbValue::Json(serde_json::Value::from_sql(ty, raw)?.to_string()),
        Type::BYTEA => DbValue::Bytes(Vec::<u8>::from_sql(ty, raw)?),
        Type::DATE => DbValue::Date(NaiveDate::from_sql(ty, raw)?),
        Type::TIME => DbValue::Time(NaiveTime::from_sql(ty, raw)?),
        Type::TIMESTAMP => DbValue::Timestamp(NaiveDateTime::from_sql(ty, raw)?),
        Type::TIMESTAMPTZ => DbValue::TimestampTz(DateTime::<Utc>::from_sql(ty, raw)?.fixed_offset()),
        Type::INTERVAL => DbValue::Text(interval_to_string(raw)?),
        Type::UUID => DbValue::Uuid(uuid::Uuid::from_sql(ty, raw)?),
        _ => match ty.kind() {
            Kind::Enum(_) => DbValue::Text(std::str::from_utf8(raw)?.to_string()),
            Kind::Domain(inner) => decode_typed(inner, raw)?,
            Kind::Array(_) => {
                let items = Vec::<RawValue>::from_sql(ty, raw)?;
                DbValue::Array(items.iter().map(RawValue::decode).collect())
            }
            Kind::Composite(fields) => {
                let values = composite_fields(raw)?;
                if values.len() != fields.len() {
                    return Err(format!(
                        "composite {} has {} fields, got {}",
                        ty.name(),
                        fields.len(),
                        values.len()
                    )
                    .into());
                }
                DbValue::Struct(
                    fields
                        .iter()
                        .zip(values)
                        .map(|(field, raw)| {
                            let value = RawValue {
                                ty: field.type_().clone(),
                                raw,
                            };
                            (field.name().to_string(), value.decode())
                        })
                        .collect(),
                )
            }
            _ => return Err(format!("no decoder for type {}", ty.name()).into()),
        },
    };
    Ok(value)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BoxError> {
        if self.buf.len() < n {
            return Err("unexpected end of value".into());
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, BoxError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u8(&mut self) -> Result<u8, BoxError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, BoxError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, BoxError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn i32(&mut self) -> Result<i32, BoxError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, BoxError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }
}

/// Field payloads of a binary record, `None` for NULL fields.
fn composite_fields(raw: &[u8]) -> Result<Vec<Option<Vec<u8>>>, BoxError> {
    let mut r = Reader { buf: raw };
    let count = r.i32()?;
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let _oid = r.i32()?;
        let len = r.i32()?;
        if len < 0 {
            fields.push(None);
        } else {
            fields.push(Some(r.take(len as usize)?.to_vec()));
        }
    }
    Ok(fields)
}

/// Renders a binary NUMERIC exactly, in plain decimal notation.
pub(crate) fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    let mut r = Reader { buf: raw };
    let ndigits = r.u16()? as usize;
    let weight = r.u16()? as i16 as i32;
    let sign = r.u16()?;
    let dscale = r.u16()? as usize;
    let mut digits = Vec::with_capacity(ndigits);
    for _ in 0..ndigits {
        digits.push(r.u16()?);
    }

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("invalid numeric sign {other:#06x}").into()),
    }

    let digit = |group: i32| -> u16 {
        if group >= 0 {
            digits.get(group as usize).copied().unwrap_or(0)
        } else {
            0
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for group in 0..=weight {
            if group == 0 {
                write!(out, "{}", digit(group))?;
            } else {
                write!(out, "{:04}", digit(group))?;
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut group = weight + 1;
        while frac.len() < dscale {
            write!(frac, "{:04}", digit(group))?;
            group += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// Renders a binary INET or CIDR the way the server prints it: the netmask
/// is shown for CIDR values and for INET values that are not host addresses.
pub(crate) fn inet_to_string(raw: &[u8]) -> Result<String, BoxError> {
    let mut r = Reader { buf: raw };
    let family = r.u8()?;
    let bits = r.u8()?;
    let is_cidr = r.u8()? != 0;
    let len = r.u8()? as usize;
    let addr = r.take(len)?;

    let (text, max_bits) = match (family, len) {
        (PGSQL_AF_INET, 4) => (Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string(), 32),
        (PGSQL_AF_INET6, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => return Err(format!("invalid inet family {family} with {len} address bytes").into()),
    };
    if is_cidr || bits != max_bits {
        Ok(format!("{text}/{bits}"))
    } else {
        Ok(text)
    }
}

fn hex_octets(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Renders a binary INTERVAL like `1 mons 2 days 03:04:05.5`.
pub(crate) fn interval_to_string(raw: &[u8]) -> Result<String, BoxError> {
    let mut r = Reader { buf: raw };
    let micros = r.i64()?;
    let days = r.i32()?;
    let months = r.i32()?;

    let mut out = String::new();
    if months != 0 {
        write!(out, "{months} mons ")?;
    }
    if days != 0 {
        write!(out, "{days} days ")?;
    }
    let sign = if micros < 0 { "-" } else { "" };
    let total = micros.unsigned_abs();
    let secs = total / 1_000_000;
    let frac = total % 1_000_000;
    write!(
        out,
        "{sign}{:02}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )?;
    if frac != 0 {
        let frac = format!("{frac:06}");
        write!(out, ".{}", frac.trim_end_matches('0'))?;
    }
    Ok(out)
}

/// Value of a type without a decoder.
#[derive(Debug)]
struct PgOpaque {
    type_name: String,
    reason: String,
}

impl DriverValue for PgOpaque {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn render(&self) -> Result<String, DbError> {
        Err(DbError::Unsupported(format!(
            "{}: {}",
            self.type_name, self.reason
        )))
    }
}
