//! `evaluate`: trec_eval-style metrics for a run file.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::error;

use neurank_core::metrics::evaluate_many;
use neurank_core::{Qrels, Run};

/// Arguments for the evaluate command.
#[derive(Args, Debug)]
pub struct EvaluateArgs {
    /// TREC run file
    #[arg(long)]
    pub run: PathBuf,

    /// TREC qrels file
    #[arg(long)]
    pub qrels: PathBuf,

    /// Comma-separated metric names (map, P_k, ndcg_cut_k, recip_rank)
    #[arg(long, value_delimiter = ',', default_value = "map,P_20,ndcg_cut_20")]
    pub metrics: Vec<String>,
}

/// Execute the evaluate command, printing metrics as JSON on stdout.
pub fn handle_evaluate(args: EvaluateArgs) -> i32 {
    match run(&args) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            error!("evaluate failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn run(args: &EvaluateArgs) -> anyhow::Result<String> {
    let run = Run::read_trec(&args.run).with_context(|| format!("reading run {}", args.run.display()))?;
    let qrels =
        Qrels::from_trec_file(&args.qrels).with_context(|| format!("reading qrels {}", args.qrels.display()))?;
    let names: Vec<&str> = args.metrics.iter().map(|m| m.trim()).collect();
    let scores = evaluate_many(&run, &qrels, &names)?;
    Ok(serde_json::to_string_pretty(&scores)?)
}
