//! CPU utilisation from two samples of the kernel's time-in-state counters.
//!
//! The previous sample lives in a [`KvStore`] between invocations. Each call
//! to [`UsageEngine::advance`] diffs the fresh counters against it and then
//! replaces it, so a failed diff still leaves a usable baseline for the next
//! run.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{KvStore, StoreError, load_json, save_json};
use crate::system::cpu::{CPU_STATE_NAMES, CpuTimes};

pub const SNAPSHOT_KEY_PREFIX: &str = "mackerel-plugin-linux-usage";
pub const DEFAULT_MAX_INTERVAL_SECS: i64 = 600;

pub fn snapshot_key(uid: &str) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}-{uid}")
}

/// Persisted baseline: counters plus the unix time they were read at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cpustat: CpuTimes,
    #[serde(default)]
    pub time: i64,
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("failed to get previous time")]
    NoPreviousTime,
    #[error("too long duration: {elapsed}s since previous sample (limit {limit}s)")]
    DurationTooLong { elapsed: i64, limit: i64 },
    #[error("previous sample is not older than the current one ({elapsed}s)")]
    NonPositiveElapsed { elapsed: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UsageError {
    /// Fatal errors suppress every metric family, not just CPU usage.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UsageError::Store(_))
    }
}

/// Share of elapsed CPU time per state, in percent. The ten fields are
/// mutually exclusive: guest time is not also counted under user or nice.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuUsage {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub guest: f64,
    pub guest_nice: f64,
}

impl CpuUsage {
    pub fn as_array(&self) -> [f64; 10] {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
            self.guest,
            self.guest_nice,
        ]
    }

    pub fn named(&self) -> impl Iterator<Item = (&'static str, f64)> {
        CPU_STATE_NAMES.into_iter().zip(self.as_array())
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CpuOutcome {
    /// No baseline existed; one was written.
    ColdStart,
    Usage(CpuUsage),
    /// Counters did not move at all between the two samples.
    Idle,
}

/// Per-state gaps after clamping counter resets to zero and taking guest
/// time out of user and nice.
pub fn cpu_gaps(prev: &CpuTimes, cur: &CpuTimes) -> [u64; 10] {
    let gap = |c: u64, p: u64| c.saturating_sub(p);
    let guest = gap(cur.guest, prev.guest);
    let guest_nice = gap(cur.guest_nice, prev.guest_nice);
    [
        gap(cur.user, prev.user).saturating_sub(guest),
        gap(cur.nice, prev.nice).saturating_sub(guest_nice),
        gap(cur.system, prev.system),
        gap(cur.idle, prev.idle),
        gap(cur.iowait, prev.iowait),
        gap(cur.irq, prev.irq),
        gap(cur.softirq, prev.softirq),
        gap(cur.steal, prev.steal),
        guest,
        guest_nice,
    ]
}

/// Percentages between two samples, or `None` when the total gap is zero.
pub fn compute_usage(prev: &CpuTimes, cur: &CpuTimes) -> Option<CpuUsage> {
    let gaps = cpu_gaps(prev, cur);
    let total: u64 = gaps.iter().sum();
    if total == 0 {
        return None;
    }
    let total = total as f64;
    let pct = |g: u64| g as f64 * 100.0 / total;
    let [user, nice, system, idle, iowait, irq, softirq, steal, guest, guest_nice] = gaps;
    Some(CpuUsage {
        user: pct(user),
        nice: pct(nice),
        system: pct(system),
        idle: pct(idle),
        iowait: pct(iowait),
        irq: pct(irq),
        softirq: pct(softirq),
        steal: pct(steal),
        guest: pct(guest),
        guest_nice: pct(guest_nice),
    })
}

pub struct UsageEngine<'a> {
    store: &'a dyn KvStore,
    key: String,
    max_interval_secs: i64,
}

impl<'a> UsageEngine<'a> {
    pub fn new(store: &'a dyn KvStore, key: impl Into<String>) -> Self {
        UsageEngine {
            store,
            key: key.into(),
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
        }
    }

    pub fn with_max_interval(mut self, secs: i64) -> Self {
        self.max_interval_secs = secs;
        self
    }

    pub fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        load_json(self.store, &self.key)
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        save_json(self.store, &self.key, snapshot)
    }

    /// Diff `current` against the stored baseline and store `current` as the
    /// new baseline.
    ///
    /// Writing the first baseline is part of the primary path and its failure
    /// is returned. Once a baseline existed, a failed refresh is only logged.
    pub fn advance(&self, current: &CpuTimes, now: i64) -> Result<CpuOutcome, UsageError> {
        let fresh = Snapshot {
            cpustat: *current,
            time: now,
        };

        let previous = match self.load() {
            Ok(None) => {
                debug!(key = %self.key, "no previous snapshot, writing baseline");
                self.save(&fresh)?;
                return Ok(CpuOutcome::ColdStart);
            }
            Ok(Some(previous)) => Ok(previous),
            Err(e) => Err(UsageError::from(e)),
        };

        let outcome = previous.and_then(|previous| self.diff(&previous, current, now));

        if let Err(e) = self.save(&fresh) {
            warn!(error = %e, "failed to refresh cpu snapshot");
        }

        outcome
    }

    fn diff(
        &self,
        previous: &Snapshot,
        current: &CpuTimes,
        now: i64,
    ) -> Result<CpuOutcome, UsageError> {
        if previous.time == 0 {
            return Err(UsageError::NoPreviousTime);
        }
        let elapsed = now - previous.time;
        if elapsed > self.max_interval_secs {
            return Err(UsageError::DurationTooLong {
                elapsed,
                limit: self.max_interval_secs,
            });
        }
        if elapsed <= 0 {
            return Err(UsageError::NonPositiveElapsed { elapsed });
        }

        match compute_usage(&previous.cpustat, current) {
            Some(usage) => Ok(CpuOutcome::Usage(usage)),
            None => {
                warn!(
                    elapsed,
                    "cpu counters unchanged since previous sample, skipping usage"
                );
                Ok(CpuOutcome::Idle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::PathBuf;

    use super::*;
    use crate::store::MemoryStore;

    /// Reads from memory; writes fail once `read_only` is set.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
        read_only: Cell<bool>,
    }

    impl KvStore for ReadOnlyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
            if self.read_only.get() {
                return Err(StoreError::Write {
                    path: PathBuf::from(key),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.put(key, value)
        }
    }

    fn times(values: [u64; 10]) -> CpuTimes {
        CpuTimes::from_columns(&values).unwrap()
    }

    fn seed(store: &MemoryStore, cpustat: CpuTimes, time: i64) {
        save_json(store, "k", &Snapshot { cpustat, time }).unwrap();
    }

    #[test]
    fn guest_time_removed_from_user_and_nice() {
        let prev = CpuTimes::default();
        let cur = times([100, 50, 0, 0, 0, 0, 0, 0, 30, 10]);
        let gaps = cpu_gaps(&prev, &cur);
        assert_eq!(gaps[0], 70);
        assert_eq!(gaps[1], 40);
        assert_eq!(gaps[8], 30);
        assert_eq!(gaps[9], 10);
        assert_eq!(gaps.iter().sum::<u64>(), 150);
    }

    #[test]
    fn decreasing_counter_clamped() {
        let prev = times([500, 0, 100, 1000, 0, 0, 0, 0, 0, 0]);
        let cur = times([10, 0, 150, 1050, 0, 0, 0, 0, 0, 0]);
        let usage = compute_usage(&prev, &cur).unwrap();
        assert_eq!(usage.user, 0.0);
        assert_eq!(usage.system, 50.0);
        assert_eq!(usage.idle, 50.0);
    }

    #[test]
    fn zero_total_is_none() {
        let t = times([5, 5, 5, 5, 5, 5, 5, 5, 0, 0]);
        assert!(compute_usage(&t, &t).is_none());
    }

    #[test]
    fn cold_start_writes_baseline() {
        let store = MemoryStore::new();
        let engine = UsageEngine::new(&store, "k");
        let outcome = engine.advance(&times([1; 10]), 1_000).unwrap();
        assert_eq!(outcome, CpuOutcome::ColdStart);
        let saved = engine.load().unwrap().unwrap();
        assert_eq!(saved.time, 1_000);
        assert_eq!(saved.cpustat, times([1; 10]));
    }

    #[test]
    fn second_run_reports_usage() {
        let store = MemoryStore::new();
        seed(&store, times([0, 0, 0, 0, 0, 0, 0, 0, 0, 0]), 1_000);
        let engine = UsageEngine::new(&store, "k");
        let cur = times([25, 0, 25, 50, 0, 0, 0, 0, 0, 0]);
        let CpuOutcome::Usage(usage) = engine.advance(&cur, 1_060).unwrap() else {
            panic!("expected usage");
        };
        assert_eq!(usage.user, 25.0);
        assert_eq!(usage.system, 25.0);
        assert_eq!(usage.idle, 50.0);
        assert_eq!(engine.load().unwrap().unwrap().time, 1_060);
    }

    #[test]
    fn stale_snapshot_fails_but_refreshes() {
        let store = MemoryStore::new();
        seed(&store, CpuTimes::default(), 1_000);
        let engine = UsageEngine::new(&store, "k");
        let err = engine.advance(&times([1; 10]), 1_601).unwrap_err();
        assert!(matches!(err, UsageError::DurationTooLong { elapsed: 601, limit: 600 }));
        assert!(!err.is_fatal());
        assert_eq!(engine.load().unwrap().unwrap().time, 1_601);
    }

    #[test]
    fn exactly_at_limit_is_accepted() {
        let store = MemoryStore::new();
        seed(&store, CpuTimes::default(), 1_000);
        let engine = UsageEngine::new(&store, "k");
        let outcome = engine.advance(&times([1; 10]), 1_600).unwrap();
        assert!(matches!(outcome, CpuOutcome::Usage(_)));
    }

    #[test]
    fn zero_time_reports_no_previous_time() {
        let store = MemoryStore::new();
        let without_time = serde_json::json!({ "cpustat": times([1, 0, 0, 0, 0, 0, 0, 0, 0, 0]) });
        store.put("k", without_time.to_string().as_bytes()).unwrap();
        let engine = UsageEngine::new(&store, "k");
        let err = engine.advance(&times([2; 10]), 1_000).unwrap_err();
        assert!(matches!(err, UsageError::NoPreviousTime));
        assert_eq!(engine.load().unwrap().unwrap().time, 1_000);
    }

    #[test]
    fn same_second_is_rejected() {
        let store = MemoryStore::new();
        seed(&store, CpuTimes::default(), 1_000);
        let engine = UsageEngine::new(&store, "k");
        let err = engine.advance(&times([1; 10]), 1_000).unwrap_err();
        assert!(matches!(err, UsageError::NonPositiveElapsed { elapsed: 0 }));
    }

    #[test]
    fn corrupt_snapshot_is_fatal_and_replaced() {
        let store = MemoryStore::new();
        store.put("k", b"garbage").unwrap();
        let engine = UsageEngine::new(&store, "k");
        let err = engine.advance(&times([1; 10]), 1_000).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(engine.load().unwrap().unwrap().time, 1_000);
    }

    #[test]
    fn unchanged_counters_are_idle() {
        let store = MemoryStore::new();
        seed(&store, times([3; 10]), 1_000);
        let engine = UsageEngine::new(&store, "k");
        assert_eq!(engine.advance(&times([3; 10]), 1_060).unwrap(), CpuOutcome::Idle);
    }

    #[test]
    fn custom_interval_limit() {
        let store = MemoryStore::new();
        seed(&store, CpuTimes::default(), 1_000);
        let engine = UsageEngine::new(&store, "k").with_max_interval(30);
        assert!(engine.advance(&times([1; 10]), 1_031).is_err());
    }

    #[test]
    fn failed_refresh_is_logged_not_returned() {
        let store = ReadOnlyStore::default();
        seed(&store.inner, CpuTimes::default(), 1_000);
        store.read_only.set(true);
        let engine = UsageEngine::new(&store, "k");

        let cur = times([10, 0, 10, 80, 0, 0, 0, 0, 0, 0]);
        let CpuOutcome::Usage(usage) = engine.advance(&cur, 1_060).unwrap() else {
            panic!("expected usage");
        };
        assert_eq!(usage.user, 10.0);
        assert_eq!(usage.idle, 80.0);
        // Baseline unchanged because the write was refused.
        assert_eq!(engine.load().unwrap().unwrap().time, 1_000);
    }

    #[test]
    fn failed_refresh_keeps_delta_error() {
        let store = ReadOnlyStore::default();
        seed(&store.inner, CpuTimes::default(), 1_000);
        store.read_only.set(true);
        let engine = UsageEngine::new(&store, "k");

        let err = engine.advance(&times([1; 10]), 2_000).unwrap_err();
        assert!(matches!(err, UsageError::DurationTooLong { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn failed_cold_start_write_is_fatal() {
        let store = ReadOnlyStore::default();
        store.read_only.set(true);
        let engine = UsageEngine::new(&store, "k");

        let err = engine.advance(&times([1; 10]), 1_000).unwrap_err();
        assert!(matches!(err, UsageError::Store(StoreError::Write { .. })));
        assert!(err.is_fatal());
        assert!(engine.load().unwrap().is_none());
    }

    #[test]
    fn snapshot_key_contains_uid() {
        assert_eq!(snapshot_key("1000"), "mackerel-plugin-linux-usage-1000");
    }
}
