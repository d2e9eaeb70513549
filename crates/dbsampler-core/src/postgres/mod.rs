//! PostgreSQL driver built on the synchronous `postgres` client.
//!
//! Every call blocks; the sampler runs them on blocking threads. Rows are
//! fetched in binary format and decoded per column type into [`DbValue`]s,
//! see [`decode`].

mod decode;
mod params;

use std::sync::Arc;

use postgres::error::SqlState;
use postgres::fallible_iterator::FallibleIterator;
use postgres::types::ToSql;
use postgres::{CancelToken, Client, NoTls};
use tracing::{debug, warn};

use crate::connection::{CancelHandle, Connection, QueryOutput, SqlParam};
use crate::error::DbError;
use crate::value::DbValue;

use decode::RawValue;

/// A live PostgreSQL connection.
pub struct PgConnection {
    client: Client,
    cancel: Arc<PgCancelHandle>,
}

impl PgConnection {
    /// Connects with a libpq-style connection string.
    pub fn connect(connection_string: &str) -> Result<Self, DbError> {
        Client::connect(connection_string, NoTls)
            .map(Self::new)
            .map_err(|e| DbError::Connection(format_postgres_error(&e)))
    }

    pub fn new(client: Client) -> Self {
        let cancel = Arc::new(PgCancelHandle {
            token: client.cancel_token(),
        });
        Self { client, cancel }
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl Connection for PgConnection {
    fn server_version(&mut self) -> Result<String, DbError> {
        let row = self
            .client
            .query_one("SHOW server_version", &[])
            .map_err(map_error)?;
        row.try_get::<_, String>(0)
            .map_err(|e| DbError::Decode(e.to_string()))
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: Option<usize>,
    ) -> Result<QueryOutput, DbError> {
        let statement = self.client.prepare(sql).map_err(map_error)?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        if statement.params().len() != params.len() {
            return Err(DbError::Query(format!(
                "statement expects {} parameters, {} given",
                statement.params().len(),
                params.len()
            )));
        }

        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let mut iter = self
            .client
            .query_raw(&statement, bound.iter().copied())
            .map_err(map_error)?;

        let limit = max_rows.unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        while rows.len() < limit {
            let Some(row) = iter.next().map_err(map_error)? else {
                break;
            };
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value = match row.try_get::<_, RawValue>(idx) {
                    Ok(raw) => raw.decode(),
                    Err(e) => {
                        debug!(column = %columns[idx], error = %e, "column fetch failed");
                        DbValue::Null
                    }
                };
                values.push(value);
            }
            rows.push(values);
        }
        Ok(QueryOutput { columns, rows })
    }

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        Some(self.cancel.clone())
    }
}

/// Sends a cancel request for the statement running on a connection.
struct PgCancelHandle {
    token: CancelToken,
}

impl CancelHandle for PgCancelHandle {
    fn cancel(&self) {
        if let Err(e) = self.token.cancel_query(NoTls) {
            warn!(error = %format_postgres_error(&e), "failed to cancel query");
        }
    }
}

fn map_error(e: postgres::Error) -> DbError {
    if e.code() == Some(&SqlState::QUERY_CANCELED) {
        DbError::Cancelled
    } else if e.is_closed() {
        DbError::Connection(format_postgres_error(&e))
    } else {
        DbError::Query(format_postgres_error(&e))
    }
}

/// Short, human-readable form of a driver error.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.rsplit("FATAL:").next().unwrap_or(&msg).trim().to_string()
        } else {
            msg
        }
    }
}
