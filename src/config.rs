use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::system::procfs::DEFAULT_PROC_ROOT;
use crate::usage::DEFAULT_MAX_INTERVAL_SECS;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub schema: SchemaConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// State directory. `MACKEREL_PLUGIN_WORKDIR` takes precedence.
    pub workdir: Option<PathBuf>,
    pub proc_root: PathBuf,
    pub max_interval_secs: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            workdir: None,
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Graph definitions to use instead of the built-in table.
    pub path: Option<PathBuf>,
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mackerel-plugin-linux-usage").join("config.toml"))
}

pub fn load_config() -> Config {
    match config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => Config::default(),
    }
}

pub fn load_config_from_path(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }),
        Err(_) => Config::default(),
    }
}
