//! Results produced by collector and query runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// One sanitized result row, column name to value in result-set order.
pub type Row = Map<String, Value>;

/// Result of one collector layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerResult {
    #[serde(skip)]
    pub name: String,
    pub order: i32,
    pub render_hint: Map<String, Value>,
    pub rows: Vec<Row>,
    /// Failure message when the layer's statement failed; rows are empty then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Layer results kept in ascending `order`.
///
/// Serializes as a JSON object whose keys appear in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerResults(Vec<LayerResult>);

impl LayerResults {
    /// Builds the ordered set; ties on `order` fall back to the layer name.
    pub fn from_unordered(mut layers: Vec<LayerResult>) -> Self {
        layers.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        Self(layers)
    }

    pub fn get(&self, name: &str) -> Option<&LayerResult> {
        self.0.iter().find(|l| l.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|l| l.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerResult> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total rows over all layers.
    pub fn row_count(&self) -> usize {
        self.0.iter().map(|l| l.rows.len()).sum()
    }
}

impl Serialize for LayerResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for layer in &self.0 {
            map.serialize_entry(&layer.name, layer)?;
        }
        map.end()
    }
}

/// Rows of an auxiliary query run alongside a collector, or why it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows(Vec<Row>),
    Error(String),
}

/// Output of one collector run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorResult {
    pub db_type: String,
    /// Sampling interval the result was produced for; absent for ad-hoc runs.
    pub interval_sec: Option<f64>,
    pub collector_id: String,
    pub collector_ref: String,
    pub source_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub collected_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub layers: LayerResults,
    pub queries: BTreeMap<String, QueryOutcome>,
}

impl CollectorResult {
    /// Number of layers whose statement failed.
    pub fn failed_layers(&self) -> usize {
        self.layers.iter().filter(|l| l.error.is_some()).count()
    }
}

/// Output of one named query run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub db_type: String,
    pub collector_id: String,
    pub collector_ref: String,
    pub source_identifier: String,
    pub query_id: String,
    pub rows: Vec<Row>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str, order: i32) -> LayerResult {
        LayerResult {
            name: name.to_string(),
            order,
            render_hint: Map::new(),
            rows: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn test_layers_sorted_by_order() {
        let layers = LayerResults::from_unordered(vec![
            layer("waits", 2),
            layer("io", 3),
            layer("cpu", 1),
        ]);
        assert_eq!(layers.names().collect::<Vec<_>>(), vec!["cpu", "waits", "io"]);
    }

    #[test]
    fn test_layers_serialize_as_ordered_object() {
        let layers = LayerResults::from_unordered(vec![layer("waits", 2), layer("cpu", 1)]);
        let json = serde_json::to_string(&layers).unwrap();
        let cpu = json.find("\"cpu\"").unwrap();
        let waits = json.find("\"waits\"").unwrap();
        assert!(cpu < waits, "{json}");
        assert!(!json.contains("error"));
    }
}
