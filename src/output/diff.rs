use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::values::MetricValues;
use crate::store::{KvStore, load_json, save_json};
use crate::usage::{DEFAULT_MAX_INTERVAL_SECS, SNAPSHOT_KEY_PREFIX};

pub fn diff_state_key(uid: &str) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}-diff-{uid}")
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffState {
    pub values: BTreeMap<String, f64>,
    pub time: i64,
}

/// Turns cumulative counters into per-minute rates against the values
/// stored by the previous run.
pub struct DiffTracker<'a> {
    store: &'a dyn KvStore,
    key: String,
    max_interval_secs: i64,
}

impl<'a> DiffTracker<'a> {
    pub fn new(store: &'a dyn KvStore, key: impl Into<String>) -> Self {
        DiffTracker {
            store,
            key: key.into(),
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
        }
    }

    pub fn with_max_interval(mut self, secs: i64) -> Self {
        self.max_interval_secs = secs;
        self
    }

    /// Rates for `names` present in `values`, then store the raw values for
    /// the next run. State read or write failures are logged and yield no
    /// rates.
    pub fn rates<'n>(
        &self,
        names: impl IntoIterator<Item = &'n str>,
        values: &MetricValues,
        now: i64,
    ) -> BTreeMap<String, f64> {
        let current: BTreeMap<String, f64> = names
            .into_iter()
            .filter_map(|name| values.get(name).map(|v| (name.to_string(), v)))
            .collect();
        if current.is_empty() {
            return BTreeMap::new();
        }

        let previous = match load_json::<DiffState>(self.store, &self.key) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable diff state");
                None
            }
        };

        let rates = match previous {
            Some(previous) => self.compute(&previous, &current, now),
            None => BTreeMap::new(),
        };

        let state = DiffState {
            values: current,
            time: now,
        };
        if let Err(e) = save_json(self.store, &self.key, &state) {
            warn!(error = %e, "failed to save diff state");
        }

        rates
    }

    fn compute(
        &self,
        previous: &DiffState,
        current: &BTreeMap<String, f64>,
        now: i64,
    ) -> BTreeMap<String, f64> {
        let elapsed = now - previous.time;
        if elapsed > self.max_interval_secs {
            warn!(elapsed, "too long duration since previous counters, skipping rates");
            return BTreeMap::new();
        }
        if elapsed <= 0 {
            warn!(elapsed, "previous counters are not older than current ones, skipping rates");
            return BTreeMap::new();
        }

        let mut rates = BTreeMap::new();
        for (name, &value) in current {
            let Some(&last) = previous.values.get(name) else {
                continue;
            };
            if value < last {
                warn!(metric = %name, "counter seems to be reset");
                continue;
            }
            rates.insert(name.clone(), (value - last) * 60.0 / elapsed as f64);
        }
        rates
    }
}
