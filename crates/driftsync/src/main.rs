//! `dsync`: command-line front end for driftsync.

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use driftsync_core::config::Config;
use driftsync_core::logging::init_logging;

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.logging)?;

    match cli.cmd {
        Command::Status { db, json } => {
            let path = db.db.unwrap_or_else(|| config.storage.db_path.clone());
            commands::status(&path, json)
        }
        Command::Records { db, owner } => {
            let path = db.db.unwrap_or_else(|| config.storage.db_path.clone());
            commands::records(&path, owner.as_deref())
        }
        Command::Config { default } => {
            if default {
                commands::show_config(&Config::default())
            } else {
                commands::show_config(&config)
            }
        }
        Command::Simulate(args) => commands::simulate(config, args).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<driftsync_core::Error>()
                .and_then(driftsync_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}
