//! In-memory database driver for testing.
//!
//! [`MockDatabase`] answers statements from a script keyed by SQL text and
//! records what ran, how many statements overlapped and how many connections
//! are still checked out. [`MockProvider`] maps session ids to mock databases.
//!
//! ```
//! use dbsampler_core::mock::{MockDatabase, MockResponse};
//! use dbsampler_core::{Connection, DbValue};
//!
//! let db = MockDatabase::new("16.2");
//! db.on("select 1", MockResponse::table(&["one"], vec![vec![DbValue::Int(1)]]));
//! let mut conn = db.connect();
//! let out = conn.query("select 1", &[], None).unwrap();
//! assert_eq!(out.rows.len(), 1);
//! ```

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::{CancelHandle, Connection, ConnectionProvider, QueryOutput, SqlParam};
use crate::error::DbError;
use crate::value::{ByteLob, CharLob, DbValue, DriverValue};

/// Granularity at which a delayed statement checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Scripted answer to one statement.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<MockCell>>,
    },
    Error(String),
}

/// Cloneable cell value used in scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<MockCell>),
}

impl MockCell {
    fn to_value(&self) -> DbValue {
        match self {
            MockCell::Null => DbValue::Null,
            MockCell::Bool(b) => DbValue::Bool(*b),
            MockCell::Int(i) => DbValue::Int(*i),
            MockCell::Float(f) => DbValue::Float(*f),
            MockCell::Text(s) => DbValue::Text(s.clone()),
            MockCell::Array(items) => DbValue::Array(items.iter().map(Self::to_value).collect()),
        }
    }

    fn from_value(value: &DbValue) -> Self {
        match value {
            DbValue::Bool(b) => MockCell::Bool(*b),
            DbValue::Int(i) => MockCell::Int(*i),
            DbValue::Float(f) => MockCell::Float(*f),
            DbValue::Text(s) => MockCell::Text(s.clone()),
            DbValue::Array(items) => MockCell::Array(items.iter().map(Self::from_value).collect()),
            _ => MockCell::Null,
        }
    }
}

impl MockResponse {
    /// Rows built from scalar `DbValue`s; other variants are scripted as null.
    pub fn table(columns: &[&str], rows: Vec<Vec<DbValue>>) -> Self {
        MockResponse::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(MockCell::from_value).collect())
                .collect(),
        }
    }

    pub fn error(message: &str) -> Self {
        MockResponse::Error(message.to_string())
    }
}

#[derive(Default)]
struct MockState {
    version: Option<String>,
    script: HashMap<String, MockResponse>,
    delay: Duration,
    fail_all: Option<String>,
    uncancellable: bool,
    executed: Vec<(String, Vec<SqlParam>)>,
}

#[derive(Default)]
struct MockInner {
    state: Mutex<MockState>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    open_connections: AtomicUsize,
    cancel_requests: AtomicUsize,
}

/// Scripted database shared by all connections made from it.
#[derive(Clone, Default)]
pub struct MockDatabase {
    inner: Arc<MockInner>,
}

impl MockDatabase {
    pub fn new(version: &str) -> Self {
        let db = Self::default();
        db.inner.state.lock().version = Some(version.to_string());
        db
    }

    /// A database whose version query fails.
    pub fn without_version() -> Self {
        Self::default()
    }

    /// Scripts the answer for `sql`.
    pub fn on(&self, sql: &str, response: MockResponse) -> &Self {
        self.inner
            .state
            .lock()
            .script
            .insert(sql.to_string(), response);
        self
    }

    /// Makes every statement take `delay` (cancellable).
    pub fn set_delay(&self, delay: Duration) {
        self.inner.state.lock().delay = delay;
    }

    /// Connections stop offering a cancel handle, so a running statement
    /// always waits out its delay.
    pub fn set_uncancellable(&self) {
        self.inner.state.lock().uncancellable = true;
    }

    /// Makes every statement fail with `message`, or restores the script with `None`.
    pub fn fail_all(&self, message: Option<&str>) {
        self.inner.state.lock().fail_all = message.map(str::to_string);
    }

    pub fn connect(&self) -> MockConnection {
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        MockConnection {
            db: self.clone(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// SQL text of every statement run so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .executed
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    /// Parameters bound to every statement run so far.
    pub fn executed_params(&self) -> Vec<Vec<SqlParam>> {
        self.inner
            .state
            .lock()
            .executed
            .iter()
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn execution_count(&self) -> usize {
        self.inner.state.lock().executed.len()
    }

    /// Highest number of statements that ran at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Connections created and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    pub fn cancel_requests(&self) -> usize {
        self.inner.cancel_requests.load(Ordering::SeqCst)
    }

    fn run(
        &self,
        sql: &str,
        params: &[SqlParam],
        cancelled: &AtomicBool,
    ) -> Result<QueryOutput, DbError> {
        let (delay, response) = {
            let mut state = self.inner.state.lock();
            state.executed.push((sql.to_string(), params.to_vec()));
            let response = match &state.fail_all {
                Some(message) => MockResponse::Error(message.clone()),
                None => state
                    .script
                    .get(sql)
                    .cloned()
                    .unwrap_or_else(|| MockResponse::Error(format!("no mock response for: {sql}"))),
            };
            (state.delay, response)
        };

        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_active.fetch_max(active, Ordering::SeqCst);
        let outcome = wait_cancellable(delay, cancelled);
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        outcome?;

        match response {
            MockResponse::Rows { columns, rows } => Ok(QueryOutput {
                columns,
                rows: rows
                    .iter()
                    .map(|row| row.iter().map(MockCell::to_value).collect())
                    .collect(),
            }),
            MockResponse::Error(message) => Err(DbError::Query(message)),
        }
    }
}

fn wait_cancellable(delay: Duration, cancelled: &AtomicBool) -> Result<(), DbError> {
    let deadline = Instant::now() + delay;
    loop {
        if cancelled.swap(false, Ordering::SeqCst) {
            return Err(DbError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

/// Connection to a [`MockDatabase`].
pub struct MockConnection {
    db: MockDatabase,
    cancelled: Arc<AtomicBool>,
}

impl Connection for MockConnection {
    fn server_version(&mut self) -> Result<String, DbError> {
        self.db
            .inner
            .state
            .lock()
            .version
            .clone()
            .ok_or_else(|| DbError::Unsupported("version query".to_string()))
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam],
        max_rows: Option<usize>,
    ) -> Result<QueryOutput, DbError> {
        let mut out = self.db.run(sql, params, &self.cancelled)?;
        if let Some(max) = max_rows {
            out.rows.truncate(max);
        }
        Ok(out)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        if self.db.inner.state.lock().uncancellable {
            return None;
        }
        Some(Arc::new(MockCancelHandle {
            db: self.db.clone(),
            cancelled: self.cancelled.clone(),
        }))
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.db.inner.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockCancelHandle {
    db: MockDatabase,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle for MockCancelHandle {
    fn cancel(&self) {
        self.db.inner.cancel_requests.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Session-to-database mapping.
#[derive(Clone, Default)]
pub struct MockProvider {
    sessions: Arc<Mutex<HashMap<String, (String, MockDatabase)>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, session_id: &str, db_type: &str, db: MockDatabase) {
        self.sessions
            .lock()
            .insert(session_id.to_string(), (db_type.to_string(), db));
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

impl ConnectionProvider for MockProvider {
    fn acquire(&self, session_id: &str) -> Result<Box<dyn Connection>, DbError> {
        match self.sessions.lock().get(session_id) {
            Some((_, db)) => Ok(Box::new(db.connect())),
            None => Err(DbError::Connection(format!("session {session_id} not found"))),
        }
    }

    fn db_type(&self, session_id: &str) -> Result<String, DbError> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|(db_type, _)| db_type.clone())
            .ok_or_else(|| DbError::Connection(format!("session {session_id} not found")))
    }
}

/// Character object whose bulk read and stream can be made to fail.
#[derive(Debug)]
pub struct MockClob {
    text: String,
    fail_bulk: bool,
    fail_stream: bool,
}

impl MockClob {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fail_bulk: false,
            fail_stream: false,
        }
    }

    pub fn failing_bulk_read(mut self) -> Self {
        self.fail_bulk = true;
        self
    }

    pub fn failing_stream(mut self) -> Self {
        self.fail_stream = true;
        self
    }
}

impl CharLob for MockClob {
    fn read_prefix(&self, max_chars: usize) -> Result<String, DbError> {
        if self.fail_bulk {
            return Err(DbError::Unsupported("bulk read".to_string()));
        }
        Ok(self.text.chars().take(max_chars).collect())
    }

    fn open_stream(&self) -> Result<Box<dyn Read + Send + '_>, DbError> {
        if self.fail_stream {
            return Err(DbError::Decode("stream closed".to_string()));
        }
        Ok(Box::new(Cursor::new(self.text.as_bytes())))
    }
}

/// Binary object, optionally unreadable.
#[derive(Debug)]
pub struct MockBlob {
    bytes: Option<Vec<u8>>,
}

impl MockBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes: Some(bytes) }
    }

    pub fn failing() -> Self {
        Self { bytes: None }
    }
}

impl ByteLob for MockBlob {
    fn read_prefix(&self, max_bytes: usize) -> Result<Vec<u8>, DbError> {
        match &self.bytes {
            Some(bytes) => Ok(bytes.iter().take(max_bytes).copied().collect()),
            None => Err(DbError::Decode("blob locator expired".to_string())),
        }
    }
}

/// Vendor value with a fixed rendering, or none.
#[derive(Debug)]
pub struct MockDriverValue {
    type_name: String,
    rendered: Option<String>,
}

impl MockDriverValue {
    pub fn rendering(type_name: &str, rendered: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            rendered: Some(rendered.to_string()),
        }
    }

    pub fn unreadable(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            rendered: None,
        }
    }
}

impl DriverValue for MockDriverValue {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn render(&self) -> Result<String, DbError> {
        self.rendered
            .clone()
            .ok_or_else(|| DbError::Unsupported(format!("render {}", self.type_name)))
    }
}
