use std::io::{self, Write};

use tracing::warn;

use super::diff::DiffTracker;
use super::schema::Schema;
use super::values::MetricValues;
use crate::format::format_value;

/// First line of the metadata block mackerel-agent looks for.
pub const META_HEADER: &str = "# mackerel-agent-plugin";

/// Env var mackerel-agent sets when it wants graph definitions instead of
/// values.
pub const META_ENV: &str = "MACKEREL_AGENT_PLUGIN_META";

pub fn meta_requested() -> bool {
    std::env::var_os(META_ENV).is_some_and(|v| !v.is_empty())
}

pub struct Emitter<'a> {
    schema: &'a Schema,
    diff: DiffTracker<'a>,
}

impl<'a> Emitter<'a> {
    pub fn new(schema: &'a Schema, diff: DiffTracker<'a>) -> Self {
        Emitter { schema, diff }
    }

    /// Write one `<graph>.<metric>\t<value>\t<time>` line per schema metric
    /// present in `values`, in schema order. Returns the number of lines.
    pub fn emit<W: Write>(
        &self,
        out: &mut W,
        values: &MetricValues,
        now: i64,
    ) -> io::Result<usize> {
        let rates = self.diff.rates(self.schema.diff_metric_names(), values, now);

        let mut written = 0;
        for (graph, metric) in self.schema.metrics() {
            let value = if metric.diff {
                rates.get(&metric.name).copied()
            } else {
                values.get(&metric.name)
            };
            let Some(value) = value else {
                continue;
            };
            let key = format!("{}.{}", graph.name, metric.name);
            if !value.is_finite() {
                warn!(metric = %key, value, "invalid value, skipping");
                continue;
            }
            writeln!(out, "{key}\t{}\t{now}", format_value(value))?;
            written += 1;
        }
        Ok(written)
    }
}

pub fn write_meta<W: Write>(out: &mut W, schema: &Schema) -> io::Result<()> {
    let json = serde_json::to_string(&schema.to_meta()).map_err(io::Error::other)?;
    writeln!(out, "{META_HEADER}")?;
    writeln!(out, "{json}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn absent_metrics_are_omitted() {
        let schema = Schema::builtin().unwrap();
        let store = MemoryStore::new();
        let emitter = Emitter::new(&schema, DiffTracker::new(&store, "d"));
        let mut values = MetricValues::new();
        values.insert("loadavg1", 0.25);
        values.insert("unknown", 1.0);

        let mut out = Vec::new();
        let written = emitter.emit(&mut out, &values, 1_700_000_000).unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "linux-usage.loadavg.loadavg1\t0.250000\t1700000000\n"
        );
    }

    #[test]
    fn non_finite_values_skipped() {
        let schema = Schema::builtin().unwrap();
        let store = MemoryStore::new();
        let emitter = Emitter::new(&schema, DiffTracker::new(&store, "d"));
        let mut values = MetricValues::new();
        values.insert("user", f64::NAN);
        values.insert("idle", f64::INFINITY);
        values.insert("all", 7.0);

        let mut out = Vec::new();
        assert_eq!(emitter.emit(&mut out, &values, 1).unwrap(), 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "linux-usage.process.all\t7\t1\n"
        );
    }

    #[test]
    fn meta_block_has_header_and_json() {
        let schema = Schema::builtin().unwrap();
        let mut out = Vec::new();
        write_meta(&mut out, &schema).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(META_HEADER));
        let json: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(json["graphs"]["linux-usage.cpu"]["unit"], "percentage");
        assert_eq!(
            json["graphs"]["linux-usage.tcp-opens"]["metrics"][0]["label"],
            "ActiveOpens"
        );
        assert!(lines.next().is_none());
    }
}
