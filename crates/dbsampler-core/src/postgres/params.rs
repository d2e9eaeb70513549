//! Binding [`SqlParam`]s to server-inferred parameter types.

use std::error::Error;

use bytes::BytesMut;
use postgres::types::{IsNull, ToSql, Type, to_sql_checked};

use crate::connection::SqlParam;

type BoxError = Box<dyn Error + Sync + Send>;

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn mismatch(param: &SqlParam, ty: &Type) -> BoxError {
    format!("cannot bind {param:?} to parameter of type {}", ty.name()).into()
}

impl ToSql for SqlParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ if is_text(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            SqlParam::Int(i) => bind_int(*i, ty, out).unwrap_or_else(|| Err(mismatch(self, ty))),
            SqlParam::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::FLOAT8 => f.to_sql(ty, out),
                _ if is_text(ty) => f.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            SqlParam::Text(s) => bind_text(s, ty, out).unwrap_or_else(|| Err(mismatch(self, ty))),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_int(i: i64, ty: &Type, out: &mut BytesMut) -> Option<Result<IsNull, BoxError>> {
    let res = match *ty {
        Type::INT2 => i16::try_from(i)
            .map_err(BoxError::from)
            .and_then(|v| v.to_sql(ty, out)),
        Type::INT4 => i32::try_from(i)
            .map_err(BoxError::from)
            .and_then(|v| v.to_sql(ty, out)),
        Type::INT8 => i.to_sql(ty, out),
        Type::OID => u32::try_from(i)
            .map_err(BoxError::from)
            .and_then(|v| v.to_sql(ty, out)),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        _ if is_text(ty) => i.to_string().to_sql(ty, out),
        _ => return None,
    };
    Some(res)
}

fn bind_text(s: &str, ty: &Type, out: &mut BytesMut) -> Option<Result<IsNull, BoxError>> {
    if is_text(ty) {
        return Some(s.to_sql(ty, out));
    }
    let res = match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => match s.trim().parse::<i64>() {
            Ok(i) => return bind_int(i, ty, out),
            Err(e) => Err(e.into()),
        },
        Type::FLOAT4 | Type::FLOAT8 => match s.trim().parse::<f64>() {
            Ok(f) => SqlParam::Float(f).to_sql(ty, out),
            Err(e) => Err(e.into()),
        },
        Type::BOOL => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "on" | "1" => true.to_sql(ty, out),
            "false" | "f" | "no" | "off" | "0" => false.to_sql(ty, out),
            _ => Err(format!("'{s}' is not a boolean").into()),
        },
        Type::UUID => uuid::Uuid::parse_str(s.trim())
            .map_err(BoxError::from)
            .and_then(|u| u.to_sql(ty, out)),
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)
            .map_err(BoxError::from)
            .and_then(|v| v.to_sql(ty, out)),
        _ => return None,
    };
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(param: SqlParam, ty: &Type) -> Result<Vec<u8>, BoxError> {
        let mut buf = BytesMut::new();
        match param.to_sql(ty, &mut buf)? {
            IsNull::Yes => Ok(Vec::new()),
            IsNull::No => Ok(buf.to_vec()),
        }
    }

    #[test]
    fn test_int_follows_parameter_type() {
        assert_eq!(bind(SqlParam::Int(5), &Type::INT4).unwrap(), 5i32.to_be_bytes());
        assert_eq!(bind(SqlParam::Int(5), &Type::INT8).unwrap(), 5i64.to_be_bytes());
        assert_eq!(bind(SqlParam::Int(5), &Type::TEXT).unwrap(), b"5");
        assert!(bind(SqlParam::Int(70_000), &Type::INT2).is_err());
        assert!(bind(SqlParam::Int(1), &Type::BOOL).is_err());
    }

    #[test]
    fn test_text_parsed_for_typed_parameters() {
        assert_eq!(
            bind(SqlParam::Text("42".into()), &Type::INT8).unwrap(),
            42i64.to_be_bytes()
        );
        assert_eq!(bind(SqlParam::Text("on".into()), &Type::BOOL).unwrap(), [1]);
        assert_eq!(bind(SqlParam::Text("abc".into()), &Type::VARCHAR).unwrap(), b"abc");
        assert!(bind(SqlParam::Text("abc".into()), &Type::INT4).is_err());
        assert!(bind(SqlParam::Text("abc".into()), &Type::POINT).is_err());
        assert_eq!(
            bind(
                SqlParam::Text("67e55044-10b1-426f-9247-bb680e5fe0c8".into()),
                &Type::UUID
            )
            .unwrap()
            .len(),
            16
        );
    }

    #[test]
    fn test_null_binds_to_anything() {
        assert!(bind(SqlParam::Null, &Type::POINT).unwrap().is_empty());
    }
}
