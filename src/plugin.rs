//! One sampling cycle: read the kernel counters, diff CPU time against the
//! stored baseline, and write metric lines for mackerel-agent.

use std::io::{self, Write};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::output::diff::{DiffTracker, diff_state_key};
use crate::output::schema::SchemaError;
use crate::output::{Emitter, MetricValues, Schema};
use crate::store::KvStore;
use crate::system::collector::Collector;
use crate::system::procfs::{ProcError, ProcFs};
use crate::usage::{CpuOutcome, DEFAULT_MAX_INTERVAL_SECS, UsageEngine, UsageError, snapshot_key};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Sample(#[from] ProcError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to write metrics: {0}")]
    Output(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub cpu: CpuOutcome,
    pub lines: usize,
}

pub struct Plugin<'a> {
    collector: Collector,
    schema: Schema,
    store: &'a dyn KvStore,
    uid: String,
    max_interval_secs: i64,
}

impl<'a> Plugin<'a> {
    pub fn new(
        collector: Collector,
        schema: Schema,
        store: &'a dyn KvStore,
        uid: impl Into<String>,
    ) -> Self {
        Plugin {
            collector,
            schema,
            store,
            uid: uid.into(),
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
        }
    }

    pub fn from_config(
        config: &Config,
        store: &'a dyn KvStore,
        uid: impl Into<String>,
    ) -> Result<Self, PluginError> {
        let schema = match &config.schema.path {
            Some(path) => Schema::from_path(path)?,
            None => Schema::builtin()?,
        };
        let collector = Collector::new(ProcFs::new(&config.general.proc_root));
        Ok(Plugin::new(collector, schema, store, uid)
            .with_max_interval(config.general.max_interval_secs))
    }

    pub fn with_max_interval(mut self, secs: i64) -> Self {
        self.max_interval_secs = secs;
        self
    }

    /// Run one cycle at unix time `now`, writing metric lines to `out`.
    ///
    /// Sampling failures and unreadable snapshots abort before anything is
    /// written. A stale or unusable baseline only withholds the CPU usage
    /// graph: the other metrics are written and the error is returned after.
    pub fn run<W: Write>(&self, out: &mut W, now: i64) -> Result<RunSummary, PluginError> {
        let sample = self.collector.sample()?;
        let mut values = MetricValues::from_sample(&sample);

        let engine = UsageEngine::new(self.store, snapshot_key(&self.uid))
            .with_max_interval(self.max_interval_secs);
        let cpu = match engine.advance(&sample.cpu_total, now) {
            Err(e) if e.is_fatal() => return Err(e.into()),
            cpu => cpu,
        };
        match &cpu {
            Ok(CpuOutcome::Usage(usage)) => values.add_cpu_usage(usage),
            Ok(CpuOutcome::ColdStart) => info!("first run, cpu usage starts next run"),
            Ok(CpuOutcome::Idle) | Err(_) => {}
        }

        let diff = DiffTracker::new(self.store, diff_state_key(&self.uid))
            .with_max_interval(self.max_interval_secs);
        let lines = Emitter::new(&self.schema, diff).emit(out, &values, now)?;
        debug!(lines, "metrics written");

        Ok(RunSummary { cpu: cpu?, lines })
    }
}
