use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const BUILTIN_SCHEMA: &str = include_str!("schema.toml");

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read graph schema {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid graph schema: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("metric {0:?} is declared more than once")]
    DuplicateMetric(String),
    #[error("graph {0:?} declares no metrics")]
    EmptyGraph(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "integer")]
    Integer,
    #[serde(rename = "percentage")]
    Percentage,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct MetricDef {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub diff: bool,
    #[serde(default)]
    pub stacked: bool,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct GraphDef {
    pub name: String,
    pub label: String,
    pub unit: Unit,
    pub metrics: Vec<MetricDef>,
}

/// Ordered graph definitions. Emission follows declaration order.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Schema {
    pub graphs: Vec<GraphDef>,
}

impl Schema {
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::parse(BUILTIN_SCHEMA)
    }

    pub fn from_path(path: &Path) -> Result<Self, SchemaError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, SchemaError> {
        let schema: Schema = toml::from_str(contents)?;
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for graph in &self.graphs {
            if graph.metrics.is_empty() {
                return Err(SchemaError::EmptyGraph(graph.name.clone()));
            }
            for metric in &graph.metrics {
                if !seen.insert(metric.name.as_str()) {
                    return Err(SchemaError::DuplicateMetric(metric.name.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&GraphDef, &MetricDef)> {
        self.graphs
            .iter()
            .flat_map(|graph| graph.metrics.iter().map(move |metric| (graph, metric)))
    }

    pub fn diff_metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics()
            .filter(|(_, metric)| metric.diff)
            .map(|(_, metric)| metric.name.as_str())
    }

    /// Graph definitions in the shape mackerel-agent reads from a plugin's
    /// metadata output.
    pub fn to_meta(&self) -> GraphMeta<'_> {
        let graphs = self
            .graphs
            .iter()
            .map(|graph| {
                let metrics = graph
                    .metrics
                    .iter()
                    .map(|m| MetricMeta {
                        name: &m.name,
                        label: &m.label,
                        stacked: m.stacked,
                    })
                    .collect();
                (
                    graph.name.as_str(),
                    GraphEntryMeta {
                        label: &graph.label,
                        unit: graph.unit,
                        metrics,
                    },
                )
            })
            .collect();
        GraphMeta { graphs }
    }
}

#[derive(Debug, Serialize)]
pub struct GraphMeta<'a> {
    pub graphs: BTreeMap<&'a str, GraphEntryMeta<'a>>,
}

#[derive(Debug, Serialize)]
pub struct GraphEntryMeta<'a> {
    pub label: &'a str,
    pub unit: Unit,
    pub metrics: Vec<MetricMeta<'a>>,
}

#[derive(Debug, Serialize)]
pub struct MetricMeta<'a> {
    pub name: &'a str,
    pub label: &'a str,
    pub stacked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_schema_parses() {
        let schema = Schema::builtin().unwrap();
        assert_eq!(schema.graphs.len(), 5);
        assert_eq!(schema.graphs[0].name, "linux-usage.cpu");
        assert_eq!(schema.graphs[0].unit, Unit::Percentage);
        assert_eq!(schema.graphs[0].metrics.len(), 10);
        assert!(schema.graphs[0].metrics.iter().all(|m| m.stacked && !m.diff));
    }

    #[test]
    fn builtin_diff_metrics() {
        let schema = Schema::builtin().unwrap();
        let diffs: Vec<&str> = schema.diff_metric_names().collect();
        assert_eq!(diffs, vec!["active", "passive", "overflows", "drops"]);
    }

    #[test]
    fn duplicate_metric_rejected() {
        let toml_str = r#"
[[graphs]]
name = "a"
label = "A"
unit = "float"
metrics = [{ name = "x", label = "x" }]

[[graphs]]
name = "b"
label = "B"
unit = "float"
metrics = [{ name = "x", label = "x" }]
"#;
        let err = Schema::parse(toml_str).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateMetric(ref n) if n == "x"));
    }

    #[test]
    fn empty_graph_rejected() {
        let toml_str = r#"
[[graphs]]
name = "a"
label = "A"
unit = "float"
metrics = []
"#;
        assert!(matches!(
            Schema::parse(toml_str),
            Err(SchemaError::EmptyGraph(_))
        ));
    }

    #[test]
    fn unknown_unit_rejected() {
        let toml_str = r#"
[[graphs]]
name = "a"
label = "A"
unit = "furlongs"
metrics = [{ name = "x", label = "x" }]
"#;
        assert!(matches!(Schema::parse(toml_str), Err(SchemaError::Parse(_))));
    }
}
