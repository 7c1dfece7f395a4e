mod cgi;
mod cli;
mod config;
mod http;
mod net;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::LevelFilter;

use cli::Cli;

fn init_logger(verbose: u8) {
    let base = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(base)
        .parse_default_env()
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config_path = match cli.config {
        Some(path) => path,
        None => {
            log::warn!("no config path given, falling back to {}", cli::DEFAULT_CONFIG_PATH);
            PathBuf::from(cli::DEFAULT_CONFIG_PATH)
        }
    };
    cli::validate_config_path(&config_path).map_err(|e| anyhow!(e))?;

    let container = config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    log::info!("configuration loaded from {}", config_path.display());

    net::run(container).context("connection manager exited with an error")
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
