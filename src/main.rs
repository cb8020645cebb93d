// ABOUTME: Main entry point for chess-engine-service
//
// Binary: chess-engine-service
// Usage: chess-engine-service [--config FILE] [--format text|json] [COMMAND]
// - No command / serve: run the service over line-delimited JSON on stdin/stdout
// - analyze: analyze one position with one or more engines
// - health: start the engines, probe once, report readiness
// - engines: list configured engines
//
// Logs go to stderr so stdout stays free for command output.

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

use chess_engine_service::cli::{self, Commands};
use chess_engine_service::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config = ServiceConfig::load(args.config.as_deref())?;

    setup_logging(config.debug);
    setup_panic_handler();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        engines = config.engines.len(),
        "Starting chess-engine-service"
    );

    match args.command {
        Some(Commands::Analyze(analyze_args)) => {
            cli::analyze::execute(analyze_args, config, args.format).await
        }
        Some(Commands::Health) => cli::health::execute(config, args.format).await,
        Some(Commands::Engines) => cli::engines::execute(config, args.format).await,
        Some(Commands::Serve) | None => cli::serve::execute(config).await,
    }
}

fn setup_logging(debug: bool) {
    use tracing_subscriber::prelude::*;

    let default_filter = if debug {
        "chess_engine_service=debug"
    } else {
        "chess_engine_service=info"
    };

    let pretty = debug.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let json = (!debug).then(|| {
        tracing_subscriber::fmt::layer()
            .json() // Output in JSON Lines format
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(pretty)
        .with(json)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
    }));
}
