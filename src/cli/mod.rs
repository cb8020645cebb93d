// ABOUTME: CLI argument parsing and command routing for chess-engine-service
//
// Provides command-line interface for:
// - Running the service over line-delimited JSON on stdin/stdout (serve, default)
// - One-shot analysis of a position (analyze)
// - Readiness probing (health)
// - Listing configured engines (engines)

pub mod analyze;
pub mod engines;
pub mod health;
pub mod serve;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Multi-engine chess analysis over UCI: lc0, Maia and Stockfish
#[derive(Parser)]
#[command(name = "chess-engine-service")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand; `serve` when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (overrides the search path)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the service, reading JSON commands from stdin (default if no command given)
    Serve,

    /// Analyze one position and print the result
    Analyze(AnalyzeArgs),

    /// Start the engines, probe them once and report readiness
    Health,

    /// List configured engines
    Engines,
}

/// Arguments for the analyze command
#[derive(clap::Args)]
pub struct AnalyzeArgs {
    /// Position: `startpos`, `startpos moves ...`, `fen <FEN> [moves ...]` or a bare FEN
    #[arg(default_value = "startpos")]
    pub position: String,

    /// Engine to run (repeat for several; defaults to the first configured engine)
    #[arg(long = "engine", short)]
    pub engines: Vec<String>,

    /// Node budget
    #[arg(long, conflicts_with_all = ["depth", "time_ms"])]
    pub nodes: Option<u64>,

    /// Depth budget
    #[arg(long, conflicts_with = "time_ms")]
    pub depth: Option<u32>,

    /// Time budget in milliseconds
    #[arg(long)]
    pub time_ms: Option<u64>,

    /// Number of candidate moves
    #[arg(long, short = 'n')]
    pub num_moves: Option<u32>,
}
