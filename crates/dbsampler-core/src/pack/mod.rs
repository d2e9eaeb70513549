//! Declarative query packs.
//!
//! A query pack groups collectors for one database type and a range of
//! server versions. Packs are produced by a [`PackSource`] (files, embedded
//! resources, ...) and validated once before the registry serves them;
//! afterwards they are immutable.
//!
//! ```text
//! QueryPack (db_type, source_identifier, versions)
//!  └── collectors: id → CollectorDef
//!       ├── layers:  name → LayerDef   (always run, ordered by `order`)
//!       └── queries: id   → QueryDef   (run on demand, may take parameters)
//! ```

mod version;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PackError;

pub use version::{Version, VersionRange};

/// Separates the pack source from the collector id in a collector reference.
pub const REF_SEPARATOR: char = ':';

/// A parsed collector configuration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPack {
    pub db_type: String,
    #[serde(default, alias = "source")]
    pub source_identifier: String,
    #[serde(default, alias = "supported_versions")]
    pub versions: VersionRange,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub collectors: BTreeMap<String, CollectorDef>,
}

/// A named bundle of layers and queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorDef {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerDef>,
    #[serde(default)]
    pub queries: BTreeMap<String, QueryDef>,
}

/// Fixed sub-query of a collector, producing one result section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub order: i32,
    /// Presentation hints, passed through untouched.
    #[serde(default)]
    pub render_hint: Map<String, Value>,
    pub sql: String,
    #[serde(default)]
    pub single_row: bool,
}

/// Named statement invocable on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDef {
    #[serde(default)]
    pub description: String,
    pub sql: String,
    #[serde(default)]
    pub single_row: bool,
    /// Placeholder names, bound positionally in this order.
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl QueryPack {
    /// Qualified reference of one of this pack's collectors.
    pub fn collector_ref(&self, collector_id: &str) -> String {
        format!("{}{REF_SEPARATOR}{collector_id}", self.source_identifier)
    }

    /// Whether the pack targets `db_type` (case-insensitive).
    pub fn matches_db_type(&self, db_type: &str) -> bool {
        self.db_type.eq_ignore_ascii_case(db_type)
    }

    /// Checks the structural rules the engine relies on.
    pub fn validate(&self) -> Result<(), PackError> {
        let src = self.source_identifier.as_str();
        if src.trim().is_empty() {
            return Err(PackError::invalid("<unnamed>", "source identifier is empty"));
        }
        if self.db_type.trim().is_empty() {
            return Err(PackError::invalid(src, "db_type is empty"));
        }
        if !self.versions.is_ordered() {
            return Err(PackError::invalid(
                src,
                format!("version range {} is inverted", self.versions),
            ));
        }

        for (collector_id, collector) in &self.collectors {
            if collector_id.trim().is_empty() {
                return Err(PackError::invalid(src, "collector id is empty"));
            }
            if collector_id.contains(REF_SEPARATOR) {
                return Err(PackError::invalid(
                    src,
                    format!("collector id '{collector_id}' contains '{REF_SEPARATOR}'"),
                ));
            }
            collector
                .validate()
                .map_err(|reason| PackError::invalid(src, format!("{collector_id}: {reason}")))?;
        }
        Ok(())
    }
}

impl CollectorDef {
    fn validate(&self) -> Result<(), String> {
        let mut orders: HashMap<i32, &str> = HashMap::new();
        for (name, layer) in &self.layers {
            if layer.sql.trim().is_empty() {
                return Err(format!("layer '{name}' has no sql"));
            }
            if let Some(other) = orders.insert(layer.order, name) {
                return Err(format!(
                    "layers '{other}' and '{name}' share order {}",
                    layer.order
                ));
            }
        }

        for (query_id, query) in &self.queries {
            if query.sql.trim().is_empty() {
                return Err(format!("query '{query_id}' has no sql"));
            }
            let mut seen = HashSet::new();
            for param in &query.parameters {
                if param.trim().is_empty() {
                    return Err(format!("query '{query_id}' has an empty parameter name"));
                }
                if !seen.insert(param.as_str()) {
                    return Err(format!(
                        "query '{query_id}' declares parameter '{param}' twice"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Supplier of already-parsed query packs.
pub trait PackSource: Send + Sync {
    fn load(&self) -> Result<Vec<QueryPack>, PackError>;
}

impl PackSource for Vec<QueryPack> {
    fn load(&self) -> Result<Vec<QueryPack>, PackError> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACK_JSON: &str = r#"{
        "db_type": "postgres",
        "source": "pg-core",
        "versions": {"min": "10"},
        "collectors": {
            "top": {
                "description": "top sessions",
                "layers": {
                    "cpu": {"order": 1, "sql": "select 1", "render_hint": {"chart": "bar"}},
                    "waits": {"order": 2, "sql": "select 2", "single_row": true}
                },
                "queries": {
                    "plan": {"sql": "select $1", "parameters": ["sql_id"]}
                }
            }
        }
    }"#;

    fn pack() -> QueryPack {
        serde_json::from_str(PACK_JSON).unwrap()
    }

    #[test]
    fn test_deserialize_pack() {
        let pack = pack();
        assert_eq!(pack.source_identifier, "pg-core");
        assert_eq!(pack.collector_ref("top"), "pg-core:top");
        let top = &pack.collectors["top"];
        assert_eq!(top.layers["cpu"].render_hint["chart"], "bar");
        assert!(top.layers["waits"].single_row);
        assert_eq!(top.queries["plan"].parameters, vec!["sql_id"]);
        assert!(pack.validate().is_ok());
    }

    #[test]
    fn test_duplicate_layer_order_rejected() {
        let mut pack = pack();
        let top = pack.collectors.get_mut("top").unwrap();
        top.layers.get_mut("waits").unwrap().order = 1;
        let err = pack.validate().unwrap_err();
        assert!(err.to_string().contains("share order 1"), "{err}");
    }

    #[test]
    fn test_collector_id_with_separator_rejected() {
        let mut pack = pack();
        let top = pack.collectors.remove("top").unwrap();
        pack.collectors.insert("a:b".to_string(), top);
        assert!(pack.validate().is_err());
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let mut pack = pack();
        let top = pack.collectors.get_mut("top").unwrap();
        top.queries.get_mut("plan").unwrap().parameters = vec!["a".into(), "a".into()];
        assert!(pack.validate().is_err());
    }

    #[test]
    fn test_inverted_version_range_rejected() {
        let mut pack = pack();
        pack.versions = VersionRange::between(Version::parse("15"), Version::parse("12"));
        assert!(pack.validate().is_err());
    }

    #[test]
    fn test_db_type_matching_ignores_case() {
        assert!(pack().matches_db_type("Postgres"));
        assert!(pack().matches_db_type("POSTGRES"));
        assert!(!pack().matches_db_type("oracle"));
    }
}
