use std::io::{Write, stdout};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use linux_usage::config::{self, load_config, load_config_from_path};
use linux_usage::logging::init_tracing;
use linux_usage::output::Schema;
use linux_usage::output::emitter::{meta_requested, write_meta};
use linux_usage::plugin::Plugin;
use linux_usage::store::{FileStore, plugin_workdir};
use linux_usage::system::collector::current_uid;

#[derive(Parser)]
#[command(
    name = "mackerel-plugin-linux-usage",
    about = "Report Linux CPU usage, load average, process and TCP counters to mackerel-agent",
    disable_version_flag = true
)]
struct Cli {
    /// Show version
    #[arg(short = 'v', long)]
    version: bool,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => {
            e.print()?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if cli.version {
        print!("{}", version_text());
        return Ok(());
    }

    init_tracing()?;
    let config = load_config_for_cli(&cli);

    if meta_requested() {
        let schema = match &config.schema.path {
            Some(path) => Schema::from_path(path)?,
            None => Schema::builtin()?,
        };
        let mut out = stdout().lock();
        write_meta(&mut out, &schema)?;
        out.flush()?;
        return Ok(());
    }

    let store = FileStore::new(plugin_workdir(config.general.workdir.as_deref()));
    let plugin = Plugin::from_config(&config, &store, current_uid())?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| eyre!("system clock is before UNIX_EPOCH: {e}"))?
        .as_secs() as i64;

    let mut out = stdout().lock();
    let result = plugin.run(&mut out, now);
    out.flush()?;
    result?;
    Ok(())
}

fn load_config_for_cli(cli: &Cli) -> config::Config {
    match &cli.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    }
}

fn version_text() -> String {
    let argv0 = std::env::args()
        .next()
        .unwrap_or_else(|| "mackerel-plugin-linux-usage".to_string());
    format!(
        "{argv0} {}\nCompiler: rustc {}/{}\n",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
