use super::cpu::CpuTimes;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessCounts {
    pub all: u64,
    pub running: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TcpCounters {
    pub active_opens: f64,
    pub passive_opens: f64,
    pub listen_overflows: f64,
    pub listen_drops: f64,
}

/// One read of every kernel source the plugin reports on.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub cpu_total: CpuTimes,
    pub cores: usize,
    pub load: LoadAverage,
    pub processes: ProcessCounts,
    pub tcp: TcpCounters,
}
