//! On-disk `latest` and `best` checkpoints.
//!
//! ```text
//! <train_output>/checkpoints/{latest,best}/
//!     model.safetensors
//!     optimizer.safetensors
//!     state.json
//!     dev.run            (when a validation has run)
//! ```
//!
//! A checkpoint is assembled in a staging directory next to its target and
//! swapped in with renames. The previous slot is parked as `.{slot}.old`
//! until the new one is in place; a reader that finds no complete slot
//! falls back to the parked copy.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RerankError, RerankResult};
use crate::metrics::Metric;
use crate::run::Run;

pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const STATE_FILE: &str = "state.json";
pub const DEV_RUN_FILE: &str = "dev.run";

/// Which checkpoint slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Latest,
    Best,
}

impl Slot {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Slot::Latest => "latest",
            Slot::Best => "best",
        }
    }
}

/// Outcome of one training iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Mean loss over the minibatches that were not dropped.
    pub mean_loss: Option<f64>,
    pub batches: usize,
    /// Minibatches dropped for a non-finite loss.
    pub dropped_batches: usize,
    /// Optimizer steps skipped for a non-finite gradient norm.
    pub skipped_steps: usize,
    /// Validation metric, when this iteration validated.
    pub metric: Option<f64>,
}

/// Trainer progress stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Completed iterations.
    pub iteration: usize,
    pub samples_consumed: u64,
    pub optimizer_step: usize,
    pub metric: Metric,
    pub best_metric: Option<f64>,
    pub best_iteration: Option<usize>,
    pub history: Vec<IterationRecord>,
}

impl TrainerState {
    pub fn new(metric: Metric) -> Self {
        Self {
            iteration: 0,
            samples_consumed: 0,
            optimizer_step: 0,
            metric,
            best_metric: None,
            best_iteration: None,
            history: Vec::new(),
        }
    }

    /// Record a validation result; true on strict improvement (or the first result).
    pub fn observe(&mut self, iteration: usize, value: f64) -> bool {
        let improved = self.best_metric.map_or(true, |best| value > best);
        if improved {
            self.best_metric = Some(value);
            self.best_iteration = Some(iteration);
        }
        improved
    }
}

/// Contents of a saved checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model: Vec<u8>,
    pub optimizer: Vec<u8>,
    pub state: TrainerState,
    /// Last validation run, when one was saved with the checkpoint.
    pub dev_run: Option<Run>,
}

/// Checkpoint directory of one training run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(train_output: impl AsRef<Path>) -> Self {
        Self {
            root: train_output.as_ref().join("checkpoints"),
        }
    }

    pub fn path(&self, slot: Slot) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    /// Write a checkpoint and swap it into `slot`.
    pub fn save(
        &self,
        slot: Slot,
        model: &[u8],
        optimizer: &[u8],
        state: &TrainerState,
        dev_run: Option<&Run>,
    ) -> RerankResult<()> {
        fs::create_dir_all(&self.root)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}-", slot.dir_name()))
            .tempdir_in(&self.root)?;

        fs::write(staging.path().join(MODEL_FILE), model)?;
        fs::write(staging.path().join(OPTIMIZER_FILE), optimizer)?;
        let state_json = serde_json::to_vec_pretty(state).map_err(|e| RerankError::SerializationError {
            message: format!("trainer state: {}", e),
        })?;
        fs::write(staging.path().join(STATE_FILE), state_json)?;
        if let Some(run) = dev_run {
            fs::write(staging.path().join(DEV_RUN_FILE), run.to_trec_string("dev"))?;
        }

        let target = self.path(slot);
        let retired = self.retired_path(slot);
        if is_complete(&target) {
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            fs::rename(&target, &retired)?;
        } else if target.exists() {
            // half-written slot from an interrupted save; the parked copy stays
            fs::remove_dir_all(&target)?;
        }
        fs::rename(staging.into_path(), &target)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        debug!(slot = slot.dir_name(), iteration = state.iteration, "Checkpoint written");
        Ok(())
    }

    fn retired_path(&self, slot: Slot) -> PathBuf {
        self.root.join(format!(".{}.old", slot.dir_name()))
    }

    /// Directory holding the readable copy of `slot`.
    fn resolve(&self, slot: Slot) -> Option<PathBuf> {
        let dir = self.path(slot);
        if is_complete(&dir) {
            return Some(dir);
        }
        let retired = self.retired_path(slot);
        if is_complete(&retired) {
            warn!(slot = slot.dir_name(), path = %retired.display(), "Recovering checkpoint from interrupted swap");
            return Some(retired);
        }
        None
    }

    /// Read `slot`, or `None` if it was never written.
    pub fn load(&self, slot: Slot) -> RerankResult<Option<Checkpoint>> {
        let Some(dir) = self.resolve(slot) else {
            return Ok(None);
        };
        let read = |name: &str| {
            fs::read(dir.join(name)).map_err(|e| RerankError::CheckpointError {
                message: format!("{} in {}: {}", name, dir.display(), e),
            })
        };
        let state = serde_json::from_slice(&read(STATE_FILE)?).map_err(|e| {
            RerankError::CheckpointError {
                message: format!("corrupt {} in {}: {}", STATE_FILE, dir.display(), e),
            }
        })?;
        let run_path = dir.join(DEV_RUN_FILE);
        let dev_run = if run_path.exists() {
            Some(Run::read_trec(&run_path)?)
        } else {
            None
        };
        Ok(Some(Checkpoint {
            model: read(MODEL_FILE)?,
            optimizer: read(OPTIMIZER_FILE)?,
            state,
            dev_run,
        }))
    }

    /// Model weights of `slot`.
    pub fn load_model(&self, slot: Slot) -> RerankResult<Vec<u8>> {
        let path = self.resolve(slot).unwrap_or_else(|| self.path(slot)).join(MODEL_FILE);
        fs::read(&path).map_err(|e| RerankError::CheckpointError {
            message: format!("{}: {}", path.display(), e),
        })
    }
}

fn is_complete(dir: &Path) -> bool {
    dir.join(STATE_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_and_replace() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load(Slot::Latest).unwrap().is_none());

        let mut state = TrainerState::new(Metric::Map);
        state.iteration = 1;
        store.save(Slot::Latest, b"m1", b"o1", &state, None).unwrap();

        state.iteration = 2;
        let mut run = Run::new();
        run.insert("301", "d1", 1.5);
        store.save(Slot::Latest, b"m2", b"o2", &state, Some(&run)).unwrap();

        let loaded = store.load(Slot::Latest).unwrap().unwrap();
        assert_eq!(loaded.model, b"m2");
        assert_eq!(loaded.optimizer, b"o2");
        assert_eq!(loaded.state.iteration, 2);
        assert_eq!(loaded.dev_run, Some(run));
        assert_eq!(store.load_model(Slot::Latest).unwrap(), b"m2");

        // only the latest slot remains, no staging or parked copies
        let entries: Vec<_> = fs::read_dir(dir.path().join("checkpoints")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_interrupted_swap_recovers_parked_slot() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut state = TrainerState::new(Metric::Map);
        state.iteration = 5;
        store.save(Slot::Latest, b"m5", b"o5", &state, None).unwrap();

        // killed after parking the old slot, before the new one moved in
        let parked = dir.path().join("checkpoints").join(".latest.old");
        fs::rename(store.path(Slot::Latest), &parked).unwrap();

        let recovered = store.load(Slot::Latest).unwrap().unwrap();
        assert_eq!(recovered.state.iteration, 5);
        assert_eq!(store.load_model(Slot::Latest).unwrap(), b"m5");

        // a half-written slot does not hide the parked copy either
        fs::create_dir_all(store.path(Slot::Latest)).unwrap();
        fs::write(store.path(Slot::Latest).join(MODEL_FILE), b"partial").unwrap();
        assert_eq!(store.load(Slot::Latest).unwrap().unwrap().model, b"m5");

        state.iteration = 6;
        store.save(Slot::Latest, b"m6", b"o6", &state, None).unwrap();
        let loaded = store.load(Slot::Latest).unwrap().unwrap();
        assert_eq!(loaded.state.iteration, 6);
        assert_eq!(loaded.model, b"m6");
        assert!(!parked.exists());
    }

    #[test]
    fn test_observe_strict_improvement() {
        let mut state = TrainerState::new(Metric::Map);
        assert!(state.observe(1, 0.0));
        assert!(!state.observe(2, 0.0));
        assert!(state.observe(3, 0.4));
        assert!(!state.observe(4, 0.3));
        assert_eq!(state.best_metric, Some(0.4));
        assert_eq!(state.best_iteration, Some(3));
    }

    #[test]
    fn test_corrupt_state_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let slot = store.path(Slot::Best);
        fs::create_dir_all(&slot).unwrap();
        fs::write(slot.join(STATE_FILE), "{not json").unwrap();
        assert!(matches!(
            store.load(Slot::Best),
            Err(RerankError::CheckpointError { .. })
        ));
    }
}
