//! Capabilities the engine needs from a database driver.
//!
//! The engine never opens connections itself. A [`ConnectionProvider`] hands
//! out a connection for a session; the boxed connection is owned by the caller
//! for the duration of one run and released when dropped.

use std::sync::Arc;

use serde_json::Value;

use crate::error::DbError;
use crate::value::DbValue;

/// Bindable statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&Value> for SqlParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Int(i),
                None => n
                    .as_f64()
                    .map_or_else(|| SqlParam::Text(n.to_string()), SqlParam::Float),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Text(other.to_string()),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(s: String) -> Self {
        SqlParam::Text(s)
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(v)
    }
}

/// Column names plus raw rows of one statement.
#[derive(Debug, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<DbValue>>,
}

/// Interrupts a statement running on a connection, from another thread.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// A live database connection.
pub trait Connection: Send {
    /// Version banner of the server, used for pack selection only.
    fn server_version(&mut self) -> Result<String, DbError>;

    /// Runs `sql` with positional parameters.
    ///
    /// With `max_rows` set, rows past the limit are dropped.
    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: Option<usize>,
    ) -> Result<QueryOutput, DbError>;

    /// Handle that can cancel the statement currently running on this connection.
    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        None
    }
}

/// Session-scoped connection source.
pub trait ConnectionProvider: Send + Sync {
    /// Borrows a connection for `session_id`. Dropping it releases it.
    fn acquire(&self, session_id: &str) -> Result<Box<dyn Connection>, DbError>;

    /// Database type of the session (e.g. `postgres`).
    fn db_type(&self, session_id: &str) -> Result<String, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_param_from_json() {
        assert_eq!(SqlParam::from(&json!(null)), SqlParam::Null);
        assert_eq!(SqlParam::from(&json!(5)), SqlParam::Int(5));
        assert_eq!(SqlParam::from(&json!(2.5)), SqlParam::Float(2.5));
        assert_eq!(SqlParam::from(&json!("abc")), SqlParam::Text("abc".into()));
        assert_eq!(
            SqlParam::from(&json!([1, 2])),
            SqlParam::Text("[1,2]".into())
        );
    }
}
