use std::collections::BTreeMap;

use crate::system::snapshot::Sample;
use crate::usage::CpuUsage;

/// Metric name to value for one invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricValues {
    values: BTreeMap<String, f64>,
}

impl MetricValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Load, process and TCP figures. None of these needs a previous sample.
    pub fn from_sample(sample: &Sample) -> Self {
        let cores = sample.cores as f64;
        let mut values = MetricValues::new();
        values.insert("loadavg1", sample.load.one / cores);
        values.insert("loadavg5", sample.load.five / cores);
        values.insert("loadavg15", sample.load.fifteen / cores);
        values.insert("all", sample.processes.all as f64);
        values.insert("running", sample.processes.running as f64);
        values.insert("active", sample.tcp.active_opens);
        values.insert("passive", sample.tcp.passive_opens);
        values.insert("overflows", sample.tcp.listen_overflows);
        values.insert("drops", sample.tcp.listen_drops);
        values
    }

    pub fn add_cpu_usage(&mut self, usage: &CpuUsage) {
        for (name, value) in usage.named() {
            self.insert(name, value);
        }
    }
}
