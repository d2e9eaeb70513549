//! dbsampler-core — sampling and collector execution engine.
//!
//! Provides:
//! - `value` / `sanitize` — raw driver values and their bounded, JSON-safe form
//! - `pack` — declarative query-pack model (collectors, layers, queries)
//! - `registry` — pack selection by database type/version and id resolution
//! - `runner` — executes collectors and named queries against a connection
//! - `sampler` — per-session scheduled samplers with run/result policies
//! - `connection` — capability traits implemented by database drivers
//! - `mock` — in-memory driver for tests
//!
//! With `postgres` feature (default):
//! - `postgres` — `Connection` implementation on top of the `postgres` crate

pub mod connection;
pub mod error;
pub mod mock;
pub mod pack;
pub mod registry;
pub mod result;
pub mod runner;
pub mod sampler;
pub mod sanitize;
pub mod value;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use connection::{CancelHandle, Connection, ConnectionProvider, QueryOutput, SqlParam};
pub use error::{DbError, EngineError, PackError};
pub use pack::{CollectorDef, LayerDef, PackSource, QueryDef, QueryPack, Version, VersionRange};
pub use registry::{CollectorInfo, CollectorRegistry, CollectorTarget, QueryInfo};
pub use result::{CollectorResult, LayerResult, QueryOutcome, QueryResult, Row};
pub use runner::{CollectorRunner, QueryInvocation, QueryRequest, RunContext};
pub use sampler::{
    SamplerDefinition, SamplerManager, SamplerPhase, SamplerStatusReport, SnapshotEntry,
    SnapshotLookup,
};
pub use sanitize::{SanitizeLimits, Sanitizer};
pub use value::DbValue;

/// Crate version, reported by the daemon at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
