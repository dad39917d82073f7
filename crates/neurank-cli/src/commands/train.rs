//! `train`: fit a reranker on one fold and rerank its test queries.
//!
//! # Usage
//!
//! ```bash
//! neurank -v train --config pacrr.toml --docs docs.jsonl --topics topics.tsv \
//!     --qrels qrels.txt --run bm25.run --folds folds.json --fold s1 --output out/
//! ```
//!
//! Output layout:
//!
//! ```text
//! out/config.toml         effective configuration
//! out/train/              checkpoints, dev.best weights and dev.best.json
//! out/dev/<iter>.run      validation runs
//! out/test.run            test queries reranked with the best model
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Args;
use tracing::{error, info};

use neurank_core::benchmark::{load_topics_tsv, Benchmark};
use neurank_core::config::ExtractorConfig;
use neurank_core::index::InMemoryIndex;
use neurank_core::metrics::{evaluate_many, Metric};
use neurank_core::{Components, PredDataset, Qrels, RerankConfig, Run, TrainDataset, Trainer};

/// Arguments for the train command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// TOML configuration (defaults apply when omitted)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Documents as JSON lines with `docid` and `text`
    #[arg(long)]
    pub docs: PathBuf,

    /// Topics as `qid<TAB>text` lines
    #[arg(long)]
    pub topics: PathBuf,

    /// TREC qrels
    #[arg(long)]
    pub qrels: PathBuf,

    /// First-stage TREC run supplying candidates
    #[arg(long)]
    pub run: PathBuf,

    /// Folds JSON: name -> {train_qids, dev_qids, test_qids}
    #[arg(long)]
    pub folds: PathBuf,

    /// Fold to train on
    #[arg(long, default_value = "s1")]
    pub fold: String,

    /// Candidates kept per query from the first-stage run
    #[arg(long, default_value = "100")]
    pub depth: usize,

    /// GloVe-format vectors, overriding the configured embedding path
    #[arg(long, env = "NEURANK_EMBEDDINGS")]
    pub embeddings: Option<PathBuf>,

    /// Validation metric
    #[arg(long, default_value = "map")]
    pub metric: String,

    /// Output directory
    #[arg(long)]
    pub output: PathBuf,
}

/// Execute the train command, printing a JSON summary on stdout.
pub fn handle_train(args: TrainArgs) -> i32 {
    match run(&args) {
        Ok(summary) => {
            println!("{}", summary);
            0
        }
        Err(e) => {
            error!("train failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}

fn load_config(args: &TrainArgs) -> anyhow::Result<RerankConfig> {
    let mut config = match &args.config {
        Some(path) => RerankConfig::from_file(path)?,
        None => RerankConfig::default(),
    }
    .with_env_overrides();
    if let (Some(path), ExtractorConfig::EmbedText(c)) = (&args.embeddings, &mut config.extractor) {
        c.embedding_path = Some(path.clone());
    }
    Ok(config)
}

fn run(args: &TrainArgs) -> anyhow::Result<String> {
    let metric: Metric = args.metric.parse()?;
    let config = load_config(args)?;
    let components = Components::from_config(config)?;

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    std::fs::write(args.output.join("config.toml"), components.config.to_toml_string()?)?;

    let benchmark = Benchmark {
        topics: load_topics_tsv(&args.topics).context("reading topics")?,
        qrels: Qrels::from_trec_file(&args.qrels).context("reading qrels")?,
        folds: Default::default(),
    }
    .with_folds_file(&args.folds)
    .context("reading folds")?;
    let fold = benchmark.fold(&args.fold)?;
    let first_stage = Run::read_trec(&args.run).context("reading first-stage run")?;

    let depth = Some(args.depth);
    let train_cands = first_stage.candidates(fold.train_qids.iter().map(String::as_str), depth);
    let dev_cands = first_stage.candidates(fold.dev_qids.iter().map(String::as_str), depth);
    let test_cands = first_stage.candidates(fold.test_qids.iter().map(String::as_str), depth);
    if train_cands.is_empty() || dev_cands.is_empty() {
        bail!("fold '{}' has no train or dev queries in {}", args.fold, args.run.display());
    }

    let mut qids = BTreeSet::new();
    let mut docids = BTreeSet::new();
    for cands in [&train_cands, &dev_cands, &test_cands] {
        for (qid, docs) in cands {
            qids.insert(qid.clone());
            docids.extend(docs.iter().cloned());
        }
    }
    let qids: Vec<String> = qids.into_iter().collect();
    let docids: Vec<String> = docids.into_iter().collect();

    let index = InMemoryIndex::from_jsonl(&args.docs, components.tokenizer.as_ref())
        .with_context(|| format!("indexing {}", args.docs.display()))?;
    let (extractor, outcome) =
        components.extractor(Arc::new(index), None, &qids, &docids, &benchmark.topics)?;
    info!(?outcome, queries = qids.len(), documents = docids.len(), "Features ready");

    let mut reranker = components.reranker(&extractor)?;
    let trainer = Trainer::new(components.config.trainer.clone())?;
    let train_dir = args.output.join("train");
    let summary = trainer.train(
        reranker.as_mut(),
        &TrainDataset::new(&train_cands, &benchmark.qrels, components.config.trainer.seed)?,
        &train_dir,
        &PredDataset::new(&dev_cands),
        &args.output.join("dev"),
        &benchmark.qrels,
        metric,
    )?;

    let mut test_metrics = None;
    if !test_cands.is_empty() {
        trainer.load_best_model(reranker.as_mut(), &train_dir)?;
        let test_run = trainer.predict(reranker.as_ref(), &PredDataset::new(&test_cands), &test_path(&args.output))?;
        let names = [metric.to_string()];
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        test_metrics = Some(evaluate_many(&test_run, &benchmark.qrels, &names)?);
    }

    let json = serde_json::json!({
        "reranker": reranker.name(),
        "metric": metric.to_string(),
        "best_dev": summary.best_metric,
        "best_iteration": summary.best_iteration,
        "iterations": summary.iterations,
        "resumed_from": summary.resumed_from,
        "dropped_batches": summary.dropped_batches,
        "skipped_steps": summary.skipped_steps,
        "test": test_metrics,
    });
    Ok(serde_json::to_string_pretty(&json)?)
}

fn test_path(output: &Path) -> PathBuf {
    output.join("test.run")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[extractor]
name = "bagofwords"
maxqlen = 4
maxdoclen = 12

[reranker]
name = "dssm"
nhiddens = [8]

[trainer]
batch = 2
itersize = 4
niters = 1

[cache]
enabled = false
"#;

    fn write_inputs(dir: &Path) -> TrainArgs {
        let w = |name: &str, body: &str| {
            let p = dir.join(name);
            std::fs::write(&p, body).unwrap();
            p
        };
        TrainArgs {
            config: Some(w("config.toml", CONFIG)),
            docs: w(
                "docs.jsonl",
                "{\"docid\": \"d1\", \"text\": \"dummy dummy hello world\"}\n\
                 {\"docid\": \"d2\", \"text\": \"lessdummy greetings from outer space\"}\n",
            ),
            topics: w("topics.tsv", "301\tdummy doc\n302\touter space\n"),
            qrels: w("qrels.txt", "301 0 d1 1\n302 0 d2 1\n"),
            run: w(
                "bm25.run",
                "301 Q0 d1 1 2.0 bm25\n301 Q0 d2 2 1.0 bm25\n302 Q0 d1 1 2.0 bm25\n302 Q0 d2 2 1.0 bm25\n",
            ),
            folds: w(
                "folds.json",
                r#"{"s1": {"train_qids": ["301"], "dev_qids": ["301"], "test_qids": ["302"]}}"#,
            ),
            fold: "s1".to_string(),
            depth: 100,
            embeddings: None,
            metric: "map".to_string(),
            output: dir.join("out"),
        }
    }

    #[test]
    fn test_train_end_to_end() {
        let dir = TempDir::new().unwrap();
        let args = write_inputs(dir.path());
        let json: serde_json::Value = serde_json::from_str(&run(&args).unwrap()).unwrap();

        assert_eq!(json["reranker"], "dssm");
        assert!(json["best_dev"].as_f64().unwrap() >= 0.0);
        assert!(json["test"]["map"].as_f64().is_some());
        assert!(args.output.join("train/dev.best").exists());
        assert!(args.output.join("test.run").exists());
        assert!(args.output.join("config.toml").exists());
    }

    #[test]
    fn test_missing_fold_fails() {
        let dir = TempDir::new().unwrap();
        let mut args = write_inputs(dir.path());
        args.fold = "s9".to_string();
        assert!(run(&args).is_err());
    }
}
