//! Sessions configured on the command line.
//!
//! A session is `name=dbtype:connection-string`, for example
//! `main=postgres:host=localhost user=postgres dbname=app`. Every tick opens
//! its own connection and drops it when the tick finishes.

use std::collections::HashMap;

use dbsampler_core::postgres::PgConnection;
use dbsampler_core::{Connection, ConnectionProvider, DbError};
use parking_lot::RwLock;

/// One configured database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub name: String,
    pub db_type: String,
    pub connection_string: String,
}

impl SessionSpec {
    /// Parses `name=dbtype:connection-string`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("'{s}': expected name=dbtype:connection-string"))?;
        let (db_type, connection_string) = rest
            .split_once(':')
            .ok_or_else(|| format!("'{s}': expected dbtype:connection-string after '='"))?;

        let name = name.trim();
        let db_type = db_type.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(format!("'{s}': session name is empty"));
        }
        if db_type.is_empty() {
            return Err(format!("'{s}': database type is empty"));
        }
        Ok(Self {
            name: name.to_string(),
            db_type,
            connection_string: connection_string.trim().to_string(),
        })
    }
}

/// Opens PostgreSQL connections for the configured sessions.
#[derive(Default)]
pub struct PgSessionProvider {
    sessions: RwLock<HashMap<String, SessionSpec>>,
}

impl PgSessionProvider {
    pub fn new(specs: impl IntoIterator<Item = SessionSpec>) -> Result<Self, String> {
        let provider = Self::default();
        for spec in specs {
            provider.add(spec)?;
        }
        Ok(provider)
    }

    pub fn add(&self, spec: SessionSpec) -> Result<(), String> {
        if spec.db_type != "postgres" {
            return Err(format!(
                "session '{}': unsupported database type '{}'",
                spec.name, spec.db_type
            ));
        }
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&spec.name) {
            return Err(format!("session '{}' configured twice", spec.name));
        }
        sessions.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Forgets a session; later acquisitions for it fail.
    pub fn remove(&self, name: &str) -> bool {
        self.sessions.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn spec(&self, session_id: &str) -> Result<SessionSpec, DbError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| DbError::Connection(format!("session '{session_id}' not found")))
    }
}

impl ConnectionProvider for PgSessionProvider {
    fn acquire(&self, session_id: &str) -> Result<Box<dyn Connection>, DbError> {
        let spec = self.spec(session_id)?;
        let conn = PgConnection::connect(&spec.connection_string)?;
        Ok(Box::new(conn))
    }

    fn db_type(&self, session_id: &str) -> Result<String, DbError> {
        self.spec(session_id).map(|spec| spec.db_type)
    }
}
