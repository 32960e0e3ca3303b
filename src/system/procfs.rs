use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::cpu::CpuTimes;
use super::snapshot::{LoadAverage, ProcessCounts, TcpCounters};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("failed to read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {}", .path.display(), .reason)]
    Parse { path: PathBuf, reason: String },
}

/// Aggregate CPU counters plus the number of per-core lines seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuStat {
    pub total: CpuTimes,
    pub cores: usize,
}

/// Reader for the kernel statistics files under a proc mount.
#[derive(Clone, Debug)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProcFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, rel: &str) -> Result<(PathBuf, String), ProcError> {
        let path = self.root.join(rel);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok((path, contents)),
            Err(source) => Err(ProcError::Io { path, source }),
        }
    }

    pub fn cpu_stat(&self) -> Result<CpuStat, ProcError> {
        let (path, contents) = self.read("stat")?;
        parse_stat(&contents).map_err(|reason| ProcError::Parse { path, reason })
    }

    pub fn load_avg(&self) -> Result<LoadAverage, ProcError> {
        let (path, contents) = self.read("loadavg")?;
        parse_loadavg(&contents).map_err(|reason| ProcError::Parse { path, reason })
    }

    /// Count every process in the table and those in the running state.
    /// A pid whose `stat` cannot be read or parsed is left out of both counts.
    pub fn process_counts(&self) -> Result<ProcessCounts, ProcError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ProcError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut counts = ProcessCounts::default();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let stat_path = entry.path().join("stat");
            let Ok(contents) = fs::read_to_string(&stat_path) else {
                debug!(pid = name, "skipping process with unreadable stat");
                continue;
            };
            let Some(state) = process_state(&contents) else {
                debug!(pid = name, "skipping process with malformed stat");
                continue;
            };
            if state == "R" {
                counts.running += 1;
            }
            counts.all += 1;
        }
        Ok(counts)
    }

    pub fn tcp_counters(&self) -> Result<TcpCounters, ProcError> {
        let (snmp_path, snmp) = self.read("self/net/snmp")?;
        let tcp = keyed_section(&snmp, "Tcp").map_err(|reason| ProcError::Parse {
            path: snmp_path.clone(),
            reason,
        })?;
        let (netstat_path, netstat) = self.read("self/net/netstat")?;
        let tcp_ext = keyed_section(&netstat, "TcpExt").map_err(|reason| ProcError::Parse {
            path: netstat_path.clone(),
            reason,
        })?;

        let field = |section: &HashMap<&str, f64>, path: &Path, key: &str| {
            section.get(key).copied().ok_or_else(|| ProcError::Parse {
                path: path.to_path_buf(),
                reason: format!("missing field {key}"),
            })
        };

        Ok(TcpCounters {
            active_opens: field(&tcp, &snmp_path, "ActiveOpens")?,
            passive_opens: field(&tcp, &snmp_path, "PassiveOpens")?,
            listen_overflows: field(&tcp_ext, &netstat_path, "ListenOverflows")?,
            listen_drops: field(&tcp_ext, &netstat_path, "ListenDrops")?,
        })
    }
}

pub fn parse_stat(contents: &str) -> Result<CpuStat, String> {
    let mut total = None;
    let mut cores = 0;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        if label == "cpu" {
            let columns = fields
                .map(|f| f.parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("bad cpu column: {e}"))?;
            total = Some(
                CpuTimes::from_columns(&columns)
                    .ok_or_else(|| format!("cpu line has {} columns", columns.len()))?,
            );
        } else if label.starts_with("cpu") && label[3..].bytes().all(|b| b.is_ascii_digit()) {
            cores += 1;
        }
    }
    let total = total.ok_or_else(|| "missing aggregate cpu line".to_string())?;
    if cores == 0 {
        return Err("no per-cpu lines".to_string());
    }
    Ok(CpuStat { total, cores })
}

pub fn parse_loadavg(contents: &str) -> Result<LoadAverage, String> {
    let values = contents
        .split_whitespace()
        .take(3)
        .map(|f| f.parse::<f64>().map_err(|e| format!("bad load average {f:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match values.as_slice() {
        &[one, five, fifteen] => Ok(LoadAverage { one, five, fifteen }),
        _ => Err(format!("expected 3 load averages, found {}", values.len())),
    }
}

/// Scheduling state of a `/proc/<pid>/stat` line. `comm` may contain spaces
/// and parens, so the state is the first field after the last `)`.
pub fn process_state(contents: &str) -> Option<&str> {
    let after_comm = contents.rfind(')')? + 1;
    contents[after_comm..].split_whitespace().next()
}

/// Values of a header/value line pair such as the `Tcp:` rows of
/// `/proc/net/snmp`.
pub fn keyed_section<'a>(
    contents: &'a str,
    section: &str,
) -> Result<HashMap<&'a str, f64>, String> {
    let mut rows = contents.lines().filter_map(|line| {
        let (name, rest) = line.split_once(':')?;
        (name == section).then_some(rest)
    });
    let header = rows.next().ok_or_else(|| format!("missing {section} header"))?;
    let values = rows.next().ok_or_else(|| format!("missing {section} values"))?;

    let keys: Vec<&str> = header.split_whitespace().collect();
    let nums: Vec<&str> = values.split_whitespace().collect();
    if keys.len() != nums.len() {
        return Err(format!(
            "{section} has {} fields but {} values",
            keys.len(),
            nums.len()
        ));
    }
    keys.into_iter()
        .zip(nums)
        .map(|(k, v)| {
            v.parse::<f64>()
                .map(|n| (k, n))
                .map_err(|e| format!("bad {section} value for {k}: {e}"))
        })
        .collect()
}
