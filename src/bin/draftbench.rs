//! Draftbench Binary
//!
//! Command-line interface and stdio JSON-RPC server for the workbench engine.

use anyhow::Context;
use clap::Parser;
use draftbench::cli::{Cli, Commands, RunContext};
use draftbench::config::ConfigLoader;
use draftbench::logging::{init_logging, LoggingConfig};
use std::path::Path;
use std::process;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    init_logging(Some(&logging_config)).context("Failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    info!("Draftbench starting");

    let context = match RunContext::new(cli.workbenches_dir.clone(), cli.config.clone()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            eprintln!("{}", draftbench::cli::map_error(&e));
            process::exit(1);
        }
    };

    match runtime.block_on(context.execute(&cli.command)) {
        Ok(output) => {
            info!("Command completed successfully");
            if !output.is_empty() {
                println!("{}", output);
            }
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("{}", draftbench::cli::map_error(&e));
            process::exit(1);
        }
    }
}

/// Build logging configuration from CLI args and the config file.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    // Plain commands stay quiet unless asked; the server always logs to stderr.
    let serving = matches!(cli.command, Commands::Serve);
    if !cli.verbose && !serving && cli.log_level.is_none() {
        return LoggingConfig {
            level: "off".to_string(),
            ..Default::default()
        };
    }

    let mut config = match cli.config {
        Some(ref path) => ConfigLoader::load_from_file(path).ok(),
        None => ConfigLoader::load(Path::new(".")).ok(),
    }
    .map(|c| c.logging)
    .unwrap_or_default();

    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if serving && config.output == "stdout" {
        // Stdout carries the JSON-RPC stream.
        config.output = "stderr".to_string();
    }
    config
}
