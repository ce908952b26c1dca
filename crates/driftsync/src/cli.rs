use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use driftsync_core::config::LogFormat;
use driftsync_core::simulation::FaultMode;

#[derive(Parser, Debug)]
#[command(name = "dsync")]
#[command(about = "Inspect and exercise the driftsync engine", version)]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "DRIFTSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level filter; RUST_LOG overrides it
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Outbox depth and pending writes of a database
    Status {
        #[command(flatten)]
        db: DbArgs,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Local records as JSON lines
    Records {
        #[command(flatten)]
        db: DbArgs,
        /// Only records of this owner
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead of the loaded file
        #[arg(long)]
        default: bool,
    },
    /// Run an in-memory engine against the simulated remote and print the
    /// diagnostic report
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
pub struct DbArgs {
    /// SQLite database (defaults to storage.db_path)
    #[arg(long)]
    pub db: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Records saved while offline
    #[arg(long, default_value_t = 5)]
    pub records: usize,

    /// How the remote answers upserts
    #[arg(long, default_value_t = FaultMode::Ok)]
    pub fail: FaultMode,

    /// Manual flush cycles after going online
    #[arg(long, default_value_t = 1)]
    pub cycles: u32,

    /// Owner the records are saved under
    #[arg(long, default_value = "demo-user")]
    pub owner: String,
}
