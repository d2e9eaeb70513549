//! Collector registry: pack selection and id resolution.
//!
//! The registry owns the current set of validated query packs. Readers take
//! a cheap `Arc` snapshot of the set; [`CollectorRegistry::reload`] builds a
//! complete new set and swaps it in one step, so a run never sees a mix of
//! old and new packs.
//!
//! Resolution rules:
//! - an unqualified collector id must match exactly one collector across the
//!   packs selected for the connection, otherwise it is ambiguous or not found;
//! - a qualified reference (`source:collector`) picks the first selected pack
//!   with that source identifier;
//! - a bare query id must match exactly one collector's query.
//!
//! Listing never fails on ambiguity; it returns every candidate sorted by
//! qualified reference.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{EngineError, PackError};
use crate::pack::{CollectorDef, PackSource, QueryDef, QueryPack, REF_SEPARATOR, Version};

/// What to run: an unqualified collector id or a `source:collector` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorTarget {
    Id(String),
    Ref(String),
}

impl CollectorTarget {
    pub fn id(id: impl Into<String>) -> Self {
        CollectorTarget::Id(id.into())
    }

    pub fn reference(reference: impl Into<String>) -> Self {
        CollectorTarget::Ref(reference.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            CollectorTarget::Id(s) | CollectorTarget::Ref(s) => s,
        }
    }
}

impl std::fmt::Display for CollectorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing entry for a collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorInfo {
    pub collector_id: String,
    pub collector_ref: String,
    pub source_identifier: String,
    pub description: String,
    pub layers: Vec<String>,
}

/// Listing entry for a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryInfo {
    pub collector_id: String,
    pub collector_ref: String,
    pub source_identifier: String,
    pub query_id: String,
    pub description: String,
    pub parameters: Vec<String>,
}

/// Packs selected for one connection.
#[derive(Debug, Clone, Default)]
pub struct MatchedPacks {
    pub packs: Vec<Arc<QueryPack>>,
    /// Version banner reported by the server, when probing succeeded.
    pub server_version: Option<String>,
}

/// A collector picked by resolution.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedCollector {
    pub pack: Arc<QueryPack>,
    pub collector_id: String,
    pub collector: CollectorDef,
}

impl ResolvedCollector {
    pub fn collector_ref(&self) -> String {
        self.pack.collector_ref(&self.collector_id)
    }
}

/// A query picked by resolution, with its owning collector.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedQuery {
    pub owner: ResolvedCollector,
    pub query_id: String,
    pub query: QueryDef,
}

pub type PackSet = Arc<Vec<Arc<QueryPack>>>;

/// Shared, atomically replaceable set of query packs.
#[derive(Debug, Default)]
pub struct CollectorRegistry {
    packs: RwLock<PackSet>,
}

impl CollectorRegistry {
    /// Creates a registry from packs, validating each.
    pub fn new(packs: Vec<QueryPack>) -> Result<Self, PackError> {
        let registry = Self::default();
        registry.replace(packs)?;
        Ok(registry)
    }

    /// Validates `packs` and swaps them in. On error the current set is kept.
    pub fn replace(&self, packs: Vec<QueryPack>) -> Result<usize, PackError> {
        for pack in &packs {
            pack.validate()?;
        }
        let count = packs.len();
        let set: PackSet = Arc::new(packs.into_iter().map(Arc::new).collect());
        *self.packs.write() = set;
        Ok(count)
    }

    /// Loads packs from `source` and swaps them in.
    pub fn reload(&self, source: &dyn PackSource) -> Result<usize, PackError> {
        let packs = source.load()?;
        let count = self.replace(packs)?;
        info!(packs = count, "query packs reloaded");
        Ok(count)
    }

    /// Current pack set.
    pub fn packs(&self) -> PackSet {
        self.packs.read().clone()
    }

    /// Selects the packs for `db_type` whose version range admits the server.
    ///
    /// The server version is queried only when some candidate pack has a
    /// bounded range. If probing fails, only unbounded packs are selected.
    pub fn matching_packs(&self, conn: &mut dyn Connection, db_type: &str) -> MatchedPacks {
        let candidates: Vec<Arc<QueryPack>> = self
            .packs()
            .iter()
            .filter(|p| p.matches_db_type(db_type))
            .cloned()
            .collect();

        if candidates.iter().all(|p| p.versions.is_unbounded()) {
            return MatchedPacks {
                packs: candidates,
                server_version: None,
            };
        }

        let (banner, version) = match conn.server_version() {
            Ok(banner) => {
                let version = Version::parse(&banner);
                if version.is_none() {
                    warn!(db_type, banner = %banner, "unrecognized server version");
                }
                (Some(banner), version)
            }
            Err(e) => {
                warn!(db_type, error = %e, "server version query failed");
                (None, None)
            }
        };

        let packs: Vec<Arc<QueryPack>> = candidates
            .into_iter()
            .filter(|p| match &version {
                Some(v) => p.versions.contains(v),
                None => p.versions.is_unbounded(),
            })
            .collect();

        debug!(
            db_type,
            version = ?version.as_ref().map(Version::to_string),
            packs = packs.len(),
            "query packs selected"
        );

        MatchedPacks {
            packs,
            server_version: banner,
        }
    }

    /// Lists every collector of the packs matching the connection.
    pub fn list_collectors(&self, conn: &mut dyn Connection, db_type: &str) -> Vec<CollectorInfo> {
        let matched = self.matching_packs(conn, db_type);
        let mut out: Vec<CollectorInfo> = matched
            .packs
            .iter()
            .flat_map(|pack| {
                pack.collectors.iter().map(move |(id, def)| CollectorInfo {
                    collector_id: id.clone(),
                    collector_ref: pack.collector_ref(id),
                    source_identifier: pack.source_identifier.clone(),
                    description: def.description.clone(),
                    layers: def.layers.keys().cloned().collect(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.collector_ref.cmp(&b.collector_ref));
        out
    }

    /// Lists queries, optionally only those of collectors whose id or
    /// reference equals `collector`.
    pub fn list_queries(
        &self,
        conn: &mut dyn Connection,
        db_type: &str,
        collector: Option<&str>,
    ) -> Vec<QueryInfo> {
        let matched = self.matching_packs(conn, db_type);
        let mut out = Vec::new();
        for pack in &matched.packs {
            for (collector_id, def) in &pack.collectors {
                let collector_ref = pack.collector_ref(collector_id);
                if let Some(filter) = collector {
                    if filter != collector_id && filter != collector_ref {
                        continue;
                    }
                }
                for (query_id, query) in &def.queries {
                    out.push(QueryInfo {
                        collector_id: collector_id.clone(),
                        collector_ref: collector_ref.clone(),
                        source_identifier: pack.source_identifier.clone(),
                        query_id: query_id.clone(),
                        description: query.description.clone(),
                        parameters: query.parameters.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            a.collector_ref
                .cmp(&b.collector_ref)
                .then_with(|| a.query_id.cmp(&b.query_id))
        });
        out
    }
}

/// Resolves a collector among already-selected packs.
pub(crate) fn resolve_collector(
    packs: &[Arc<QueryPack>],
    target: &CollectorTarget,
) -> Result<ResolvedCollector, EngineError> {
    match target {
        CollectorTarget::Ref(reference) => {
            let (source, collector_id) = reference
                .rsplit_once(REF_SEPARATOR)
                .ok_or_else(|| EngineError::CollectorNotFound(reference.clone()))?;
            packs
                .iter()
                .filter(|p| p.source_identifier == source)
                .find_map(|p| {
                    p.collectors.get(collector_id).map(|def| ResolvedCollector {
                        pack: p.clone(),
                        collector_id: collector_id.to_string(),
                        collector: def.clone(),
                    })
                })
                .ok_or_else(|| EngineError::CollectorNotFound(reference.clone()))
        }
        CollectorTarget::Id(id) => {
            let mut found: Vec<ResolvedCollector> = packs
                .iter()
                .filter_map(|p| {
                    p.collectors.get(id).map(|def| ResolvedCollector {
                        pack: p.clone(),
                        collector_id: id.clone(),
                        collector: def.clone(),
                    })
                })
                .collect();
            match found.len() {
                0 => Err(EngineError::CollectorNotFound(id.clone())),
                1 => Ok(found.remove(0)),
                _ => Err(ambiguous(id, found.iter().map(ResolvedCollector::collector_ref))),
            }
        }
    }
}

/// Resolves a query, within one collector when `collector` is given,
/// otherwise across every collector of the selected packs.
pub(crate) fn resolve_query(
    packs: &[Arc<QueryPack>],
    collector: Option<&CollectorTarget>,
    query_id: &str,
) -> Result<ResolvedQuery, EngineError> {
    if let Some(target) = collector {
        let owner = resolve_collector(packs, target)?;
        let query = owner.collector.queries.get(query_id).cloned().ok_or_else(|| {
            EngineError::QueryNotFound(format!("{query_id} in {}", owner.collector_ref()))
        })?;
        return Ok(ResolvedQuery {
            owner,
            query_id: query_id.to_string(),
            query,
        });
    }

    let mut found: Vec<ResolvedQuery> = Vec::new();
    for pack in packs {
        for (collector_id, def) in &pack.collectors {
            if let Some(query) = def.queries.get(query_id) {
                found.push(ResolvedQuery {
                    owner: ResolvedCollector {
                        pack: pack.clone(),
                        collector_id: collector_id.clone(),
                        collector: def.clone(),
                    },
                    query_id: query_id.to_string(),
                    query: query.clone(),
                });
            }
        }
    }

    match found.len() {
        0 => Err(EngineError::QueryNotFound(query_id.to_string())),
        1 => Ok(found.remove(0)),
        _ => Err(ambiguous(
            query_id,
            found.iter().map(|q| q.owner.collector_ref()),
        )),
    }
}

fn ambiguous(reference: &str, candidates: impl Iterator<Item = String>) -> EngineError {
    let mut candidates: Vec<String> = candidates.collect();
    candidates.sort();
    candidates.dedup();
    EngineError::CollectorAmbiguous {
        reference: reference.to_string(),
        candidates,
    }
}
