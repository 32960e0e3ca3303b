use serde::{Deserialize, Serialize};

/// Accumulated CPU time per state since boot, in kernel clock ticks.
///
/// Field order follows the columns of a `cpu` line in `/proc/stat`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
}

/// Metric names for the ten CPU states, in `/proc/stat` column order.
pub const CPU_STATE_NAMES: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

impl CpuTimes {
    pub fn as_array(&self) -> [u64; 10] {
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

    /// Build from the numeric columns of a `cpu` line. The first four columns
    /// are required; later ones are zero on kernels that do not report them.
    pub fn from_columns(columns: &[u64]) -> Option<Self> {
        if columns.len() < 4 {
            return None;
        }
        let at = |i: usize| columns.get(i).copied().unwrap_or(0);
        Some(CpuTimes {
            user: at(0),
            nice: at(1),
            system: at(2),
            idle: at(3),
            iowait: at(4),
            irq: at(5),
            softirq: at(6),
            steal: at(7),
            guest: at(8),
            guest_nice: at(9),
        })
    }
}
