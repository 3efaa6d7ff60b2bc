//! Backup Engine - Main entry point
//!
//! One invocation runs one mode and exits; scheduling is left to the caller.

use backup_engine::executor::report::exit_code;
use backup_engine::{config::Config, daemon::shutdown::ShutdownCoordinator, utils, Engine, Mode, RunRequest};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// What to run
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Limit the run to one source id
    #[arg(short, long)]
    source: Option<String>,

    /// Artifact id to restore (latest when omitted)
    #[arg(long)]
    artifact: Option<String>,

    /// Restore target directory, or the mount point to label
    #[arg(long, value_name = "DIR")]
    target: Option<PathBuf>,

    /// Label to write with --mode label-medium
    #[arg(long)]
    medium_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("backup-engine: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("backup-engine: cannot initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        "Starting backup-engine v{} (host: {}, mode: {})",
        env!("CARGO_PKG_VERSION"),
        config.engine.host_id,
        args.mode.as_str()
    );

    // Create shutdown coordinator
    let shutdown = ShutdownCoordinator::new();
    shutdown.spawn_signal_listener();

    let engine = match Engine::new(config, shutdown.token()) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Cannot open engine state: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let request = RunRequest {
        source: args.source,
        artifact: args.artifact,
        target: args.target,
        medium_id: args.medium_id,
    };
    let reports = engine.run(args.mode, &request).await;

    if args.mode == Mode::Status {
        if let Some(details) = reports.first().and_then(|r| r.details.as_ref()) {
            match serde_json::to_string_pretty(details) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::error!("Cannot render status: {}", e),
            }
        }
    }

    ExitCode::from(exit_code(&reports))
}
