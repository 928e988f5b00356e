use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

use session_statusline::app;
use session_statusline::cli::{Cli, Commands};
use session_statusline::config::StatuslineConfig;
use session_statusline::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("session-statusline error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = StatuslineConfig::load_or_init().unwrap_or_else(|err| {
        warn!(error = format!("{err:#}"), "falling back to default configuration");
        StatuslineConfig::default()
    });

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        None => {
            app::run_statusline(&config, !cli.no_color)?;
            Ok(0)
        }
    }
}
