//! Minibatch training with validation-driven model selection.
//!
//! One `train` call runs `niters` iterations of `itersize` samples:
//! - Features built per sample through the reranker's extractor
//! - Pairwise loss, candle autograd backward pass
//! - Gradient accumulation over `gradacc` minibatches, then an AdamW step
//! - Validation every `validatefreq` iterations and at the last one
//! - `best` checkpoint on strict metric improvement, `latest` after every iteration
//!
//! The best weights are also published as `<train_output>/dev.best`
//! (safetensors), described by `dev.best.json`.
//!
//! With `fastforward` set, training resumes from the `latest` checkpoint:
//! weights, optimizer moments, sampling position and metric history are all
//! restored, so an interrupted run ends where an uninterrupted one would.

mod checkpoint;
mod loss;
mod optimizer;

pub use checkpoint::{Checkpoint, CheckpointStore, IterationRecord, Slot, TrainerState};
pub use loss::{softplus, PairwiseLoss};
pub use optimizer::{AdamW, AdamWConfig, GradAccumulator};

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::batch::collate;
use crate::benchmark::Qrels;
use crate::config::TrainerConfig;
use crate::dataset::{PairStream, PredDataset, TrainDataset, TrainPair};
use crate::error::{RerankError, RerankResult};
use crate::metrics::{self, Metric};
use crate::reranker::Reranker;
use crate::run::Run;

/// Weights of the best validated model, safetensors encoded.
pub const DEV_BEST_FILE: &str = "dev.best";
/// Metric and iteration of [`DEV_BEST_FILE`].
pub const DEV_BEST_META_FILE: &str = "dev.best.json";

/// Contents of `dev.best.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevBest {
    pub metric: Metric,
    pub value: f64,
    pub iteration: usize,
}

/// Result of [`Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub metric: Metric,
    pub best_metric: Option<f64>,
    pub best_iteration: Option<usize>,
    /// Iterations completed, including restored ones.
    pub iterations: usize,
    /// Iteration restored from `latest`, when fastforwarding.
    pub resumed_from: Option<usize>,
    pub optimizer_steps: usize,
    pub dropped_batches: usize,
    pub skipped_steps: usize,
    pub history: Vec<IterationRecord>,
}

impl TrainingSummary {
    fn from_state(state: &TrainerState, resumed_from: Option<usize>) -> Self {
        Self {
            metric: state.metric,
            best_metric: state.best_metric,
            best_iteration: state.best_iteration,
            iterations: state.iteration,
            resumed_from,
            optimizer_steps: state.optimizer_step,
            dropped_batches: state.history.iter().map(|r| r.dropped_batches).sum(),
            skipped_steps: state.history.iter().map(|r| r.skipped_steps).sum(),
            history: state.history.clone(),
        }
    }
}

/// Drives training, prediction and best-model restore.
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    /// # Errors
    /// - `ConfigError` for an invalid configuration
    pub fn new(config: TrainerConfig) -> RerankResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train `reranker` and keep the checkpoint scoring best on `dev`.
    #[allow(clippy::too_many_arguments)]
    pub fn train(
        &self,
        reranker: &mut dyn Reranker,
        train: &TrainDataset,
        train_output: &Path,
        dev: &PredDataset,
        dev_output: &Path,
        qrels: &Qrels,
        metric: Metric,
    ) -> RerankResult<TrainingSummary> {
        reranker.build()?;
        fs::create_dir_all(train_output)?;
        fs::create_dir_all(dev_output)?;

        let store = CheckpointStore::new(train_output);
        let mut optimizer = AdamW::new(AdamWConfig::from_trainer(&self.config));
        let mut state = TrainerState::new(metric);
        let mut resumed_from = None;
        let mut last_dev_run: Option<Run> = None;

        if self.config.fastforward {
            if let Some(latest) = store.load(Slot::Latest)? {
                if latest.state.metric != metric {
                    return Err(RerankError::CheckpointError {
                        message: format!(
                            "latest checkpoint tracks {}, this run validates on {}",
                            latest.state.metric, metric
                        ),
                    });
                }
                reranker.params().load_bytes(&latest.model)?;
                optimizer.load(&latest.optimizer, latest.state.optimizer_step, reranker.params())?;
                state = latest.state;
                last_dev_run = latest.dev_run;
                resumed_from = Some(state.iteration);
                info!(
                    iteration = state.iteration,
                    samples = state.samples_consumed,
                    best = ?state.best_metric,
                    "Fastforwarding from latest checkpoint"
                );
            }
        }

        let mut stream = train.pairs_from(state.samples_consumed);
        let loss = PairwiseLoss::from_config(&self.config);
        info!(
            reranker = reranker.name(),
            params = reranker.params().num_elements(),
            start = state.iteration + 1,
            niters = self.config.niters,
            "Training"
        );

        for iteration in state.iteration + 1..=self.config.niters {
            let mut record = self.train_iteration(reranker, &mut stream, &mut optimizer, loss)?;
            record.iteration = iteration;
            state.iteration = iteration;
            state.samples_consumed = stream.consumed();
            state.optimizer_step = optimizer.global_step();

            let validate = iteration % self.config.validatefreq == 0 || iteration == self.config.niters;
            let mut improved = false;
            if validate {
                let run_path = dev_output.join(format!("{}.run", iteration));
                let run = self.predict(reranker, dev, &run_path)?;
                let value = metrics::evaluate(&run, qrels, metric);
                record.metric = Some(value);
                improved = state.observe(iteration, value);
                info!(iteration, %metric, value, improved, "Validated");
                last_dev_run = Some(run);
            }
            state.history.push(record.clone());

            let model = reranker.params().to_bytes()?;
            let moments = optimizer.to_bytes()?;
            if improved {
                store.save(Slot::Best, &model, &moments, &state, last_dev_run.as_ref())?;
                write_dev_best(
                    train_output,
                    &model,
                    &DevBest {
                        metric,
                        value: state.best_metric.unwrap_or_default(),
                        iteration,
                    },
                )?;
            }
            store.save(Slot::Latest, &model, &moments, &state, last_dev_run.as_ref())?;

            info!(
                iteration,
                loss = ?record.mean_loss,
                batches = record.batches,
                dropped = record.dropped_batches,
                skipped_steps = record.skipped_steps,
                "Iteration done"
            );
        }

        let summary = TrainingSummary::from_state(&state, resumed_from);
        info!(best = ?summary.best_metric, at = ?summary.best_iteration, "Training finished");
        Ok(summary)
    }

    fn train_iteration(
        &self,
        reranker: &dyn Reranker,
        stream: &mut PairStream<'_>,
        optimizer: &mut AdamW,
        loss: PairwiseLoss,
    ) -> RerankResult<IterationRecord> {
        let mut record = IterationRecord::default();
        let mut accumulator = GradAccumulator::new();
        let mut loss_sum = 0.0;
        let mut remaining = self.config.itersize;

        while remaining > 0 {
            let take = remaining.min(self.config.batch);
            remaining -= take;
            let pairs: Vec<TrainPair> = stream.by_ref().take(take).collect();
            let samples = pairs
                .iter()
                .map(|p| p.features(reranker.extractor()))
                .collect::<RerankResult<Vec<_>>>()?;
            let batch = collate(&samples, reranker.device())?;
            record.batches += 1;

            let (value, tensor) = match reranker.score(&batch).and_then(|s| loss.compute(&s)) {
                Ok((tensor, value)) => (value, tensor),
                Err(e) if e.is_numeric() => {
                    warn!(batch = record.batches, error = %e, "Dropping minibatch");
                    record.dropped_batches += 1;
                    accumulator.clear();
                    continue;
                }
                Err(e) => return Err(e),
            };
            loss_sum += value;
            let grads = tensor.backward().map_err(|e| RerankError::TensorError {
                message: format!("Backward pass failed: {}", e),
            })?;
            accumulator.add(reranker.params(), &grads)?;
            debug!(batch = record.batches, loss = value, "Minibatch");

            if accumulator.pending() >= self.config.gradacc {
                Self::apply(optimizer, reranker, &mut accumulator, &mut record)?;
            }
        }
        if !accumulator.is_empty() {
            Self::apply(optimizer, reranker, &mut accumulator, &mut record)?;
        }

        let kept = record.batches - record.dropped_batches;
        if kept > 0 {
            record.mean_loss = Some(loss_sum / kept as f64);
        }
        Ok(record)
    }

    fn apply(
        optimizer: &mut AdamW,
        reranker: &dyn Reranker,
        accumulator: &mut GradAccumulator,
        record: &mut IterationRecord,
    ) -> RerankResult<()> {
        let grads = accumulator.take()?;
        match optimizer.step(reranker.params(), &grads) {
            Ok(norm) => {
                debug!(step = optimizer.global_step(), grad_norm = norm, lr = optimizer.current_lr(), "Optimizer step");
                Ok(())
            }
            Err(e) if e.is_numeric() => {
                warn!(error = %e, "Skipping optimizer step");
                record.skipped_steps += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Score every pair of `dataset` and write the run to `output_path`.
    pub fn predict(
        &self,
        reranker: &dyn Reranker,
        dataset: &PredDataset,
        output_path: &Path,
    ) -> RerankResult<Run> {
        let mut scored = Vec::with_capacity(dataset.len());
        for chunk in dataset.chunks(self.config.batch) {
            let samples = chunk
                .iter()
                .map(|p| p.features(reranker.extractor()))
                .collect::<RerankResult<Vec<_>>>()?;
            let batch = collate(&samples, reranker.device())?;
            let scores = reranker.test(&batch)?;
            scored.extend(
                chunk
                    .iter()
                    .zip(scores)
                    .map(|(pair, score)| (pair.qid.as_str(), pair.docid.as_str(), score as f64)),
            );
        }
        let mut run = Run::new();
        run.extend_scores(scored);
        run.write_trec(output_path, reranker.name())?;
        debug!(pairs = dataset.len(), path = %output_path.display(), "Prediction written");
        Ok(run)
    }

    /// Restore the weights saved in `<train_output>/dev.best`.
    ///
    /// # Errors
    /// - `CheckpointError` if `dev.best` is missing or does not fit the model
    pub fn load_best_model(&self, reranker: &mut dyn Reranker, train_output: &Path) -> RerankResult<()> {
        reranker.build()?;
        let path = train_output.join(DEV_BEST_FILE);
        let model = fs::read(&path).map_err(|e| RerankError::CheckpointError {
            message: format!("{}: {}", path.display(), e),
        })?;
        reranker.params().load_bytes(&model)?;
        info!(reranker = reranker.name(), path = %path.display(), "Loaded best model");
        Ok(())
    }
}

/// Read the `dev.best.json` description of the best model.
pub fn read_dev_best(train_output: &Path) -> RerankResult<DevBest> {
    let path = train_output.join(DEV_BEST_META_FILE);
    let bytes = fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| RerankError::SerializationError {
        message: format!("{}: {}", path.display(), e),
    })
}

/// Weights first, then the description, each published atomically.
fn write_dev_best(train_output: &Path, model: &[u8], best: &DevBest) -> RerankResult<()> {
    let json = serde_json::to_vec_pretty(best).map_err(|e| RerankError::SerializationError {
        message: format!("{}: {}", DEV_BEST_META_FILE, e),
    })?;
    publish(train_output, DEV_BEST_FILE, model)?;
    publish(train_output, DEV_BEST_META_FILE, &json)
}

fn publish(dir: &Path, name: &str, bytes: &[u8]) -> RerankResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.persist(dir.join(name)).map_err(|e| RerankError::IoError(e.error))?;
    Ok(())
}
