//! Sandbox Execution Service - Main Entry Point
//!
//! `sandboxd` (or `sandboxd serve`) runs the HTTP service. The hidden
//! `sandboxd worker` subcommand is what the service spawns for each request.

use std::io::Read;

use anyhow::{Context, Result};
use capsules_js_exec::{run_program, WorkerOptions};
use clap::Parser;
use sandboxd::config::{Cli, Command, ServeArgs, WorkerArgs};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    match Cli::parse().into_command() {
        Command::Serve(args) => serve(args),
        Command::Worker(args) => worker(args),
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sandboxd=debug"));
    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Sandbox Execution Service");
    info!("Configuration:");
    info!("  Timeout: {}ms", config.sandbox.timeout_ms());
    info!("  Reaper grace: {}ms", config.grace_period.as_millis());
    info!("  Max concurrent executions: {}", config.sandbox.max_concurrent);
    info!("  Worker: {}", config.sandbox.worker_path.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match runtime.block_on(sandboxd::serve(config)) {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Server failed: {}", e);
            Err(e)
        }
    }
}

/// Runs inside the sandbox process: read the program from stdin, run it,
/// write frames to stdout. Diagnostics go to stderr, which the supervisor
/// forwards to its own log.
fn worker(args: WorkerArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let mut source = String::new();
    std::io::stdin()
        .read_to_string(&mut source)
        .context("failed to read program from stdin")?;

    let options = WorkerOptions {
        heap_limit_bytes: args.heap_limit_mb * 1024 * 1024,
        max_result_nodes: args.max_result_nodes,
    };
    run_program(&source, &options, std::io::stdout())?;
    Ok(())
}
