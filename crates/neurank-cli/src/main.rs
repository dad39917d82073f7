//! neurank CLI
//!
//! # Commands
//!
//! - `train`: build features, train a reranker on one fold, rerank the test queries
//! - `evaluate`: score a TREC run against qrels
//!
//! Exit code 0 on success, 1 on any error.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

/// Train and evaluate neural document rerankers
#[derive(Parser)]
#[command(name = "neurank")]
#[command(version)]
#[command(about = "Train and evaluate neural document rerankers")]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a reranker and write dev/test runs
    Train(commands::train::TrainArgs),
    /// Evaluate a run file against relevance judgments
    Evaluate(commands::evaluate::EvaluateArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match cli.command {
        Commands::Train(args) => commands::train::handle_train(args),
        Commands::Evaluate(args) => commands::evaluate::handle_evaluate(args),
    };

    std::process::exit(exit_code);
}
