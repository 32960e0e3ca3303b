pub mod collector;
pub mod cpu;
pub mod procfs;
pub mod snapshot;
