pub mod config;
pub mod format;
pub mod logging;
pub mod output;
pub mod plugin;
pub mod store;
pub mod system;
pub mod usage;
