use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

use super::procfs::{ProcError, ProcFs};
use super::snapshot::Sample;

pub struct Collector {
    procfs: ProcFs,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new(ProcFs::default())
    }
}

impl Collector {
    pub fn new(procfs: ProcFs) -> Self {
        Collector { procfs }
    }

    /// Read every source once. Any source failing aborts the whole sample.
    pub fn sample(&self) -> Result<Sample, ProcError> {
        let _span = tracing::debug_span!("collector.sample").entered();

        let stat = self.procfs.cpu_stat()?;
        let load = self.procfs.load_avg()?;
        let processes = self.procfs.process_counts()?;
        let tcp = self.procfs.tcp_counters()?;

        debug!(
            cores = stat.cores,
            processes = processes.all,
            running = processes.running,
            "sampled {}",
            self.procfs.root().display()
        );

        Ok(Sample {
            cpu_total: stat.total,
            cores: stat.cores,
            load,
            processes,
            tcp,
        })
    }
}

/// Numeric uid owning this process, or `"0"` when it cannot be determined.
pub fn current_uid() -> String {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return "0".to_string();
    };
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        false,
        ProcessRefreshKind::nothing().with_user(UpdateKind::Always),
    );
    sys.process(pid)
        .and_then(|process| process.user_id())
        .map(|uid| (**uid).to_string())
        .unwrap_or_else(|| "0".to_string())
}
