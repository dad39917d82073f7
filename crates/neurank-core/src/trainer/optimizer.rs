//! AdamW over a [`ParamStore`], plus gradient accumulation.
//!
//! Implements AdamW with:
//! - Per-parameter moment estimates (m, v) keyed by parameter name
//! - Constant or linear warmup + cosine decay schedule
//! - Optional global-norm gradient clipping
//! - Decoupled weight decay

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};

use crate::config::{LrSchedule, TrainerConfig};
use crate::error::{RerankError, RerankResult};
use crate::reranker::ParamStore;
use crate::tensorio::{self, NamedArray};

const FIRST_MOMENT: &str = "exp_avg";
const SECOND_MOMENT: &str = "exp_avg_sq";

/// AdamW optimizer configuration.
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Base learning rate.
    pub lr: f64,
    /// First moment exponential decay rate.
    pub beta1: f64,
    /// Second moment exponential decay rate.
    pub beta2: f64,
    /// Numerical stability constant.
    pub epsilon: f64,
    /// Decoupled weight decay coefficient.
    pub weight_decay: f64,
    /// Maximum global gradient norm; `None` disables clipping.
    pub max_grad_norm: Option<f64>,
    pub schedule: LrSchedule,
    /// Total number of optimizer steps (for the schedule).
    pub total_steps: usize,
    /// Fraction of total steps for linear warmup.
    pub warmup_fraction: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: None,
            schedule: LrSchedule::Constant,
            total_steps: 1000,
            warmup_fraction: 0.1,
        }
    }
}

impl AdamWConfig {
    pub fn from_trainer(config: &TrainerConfig) -> Self {
        Self {
            lr: config.lr,
            weight_decay: config.weight_decay,
            max_grad_norm: config.max_grad_norm,
            schedule: config.schedule,
            total_steps: config.total_steps(),
            warmup_fraction: config.warmup_fraction,
            ..Default::default()
        }
    }
}

/// Moment estimates of one parameter.
struct Moments {
    m: Tensor,
    v: Tensor,
}

/// AdamW optimizer.
pub struct AdamW {
    config: AdamWConfig,
    moments: BTreeMap<String, Moments>,
    /// Global step counter (for schedule + bias correction).
    step: usize,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            moments: BTreeMap::new(),
            step: 0,
        }
    }

    /// Learning rate of the current step.
    pub fn current_lr(&self) -> f64 {
        let base_lr = self.config.lr;
        match self.config.schedule {
            LrSchedule::Constant => base_lr,
            LrSchedule::WarmupCosine => {
                let warmup_steps =
                    (self.config.total_steps as f64 * self.config.warmup_fraction) as usize;
                if self.step < warmup_steps {
                    base_lr * (self.step as f64 / warmup_steps.max(1) as f64)
                } else {
                    let decay_steps = self.config.total_steps.saturating_sub(warmup_steps);
                    let progress = (self.step - warmup_steps) as f64 / decay_steps.max(1) as f64;
                    let cosine_factor = 0.5 * (1.0 + (std::f64::consts::PI * progress.min(1.0)).cos());
                    base_lr * cosine_factor
                }
            }
        }
    }

    /// Apply one update from gradients keyed by parameter name.
    ///
    /// Returns the global gradient norm before clipping.
    ///
    /// # Errors
    /// - `NumericInstability` if the gradient norm is not finite; nothing is updated
    pub fn step(&mut self, params: &ParamStore, grads: &BTreeMap<String, Tensor>) -> RerankResult<f64> {
        let total_norm = global_norm(grads)?;
        if !total_norm.is_finite() {
            return Err(RerankError::NumericInstability {
                stage: "gradient norm".to_string(),
                value: total_norm,
            });
        }

        self.step += 1;
        let t = self.step as i32;
        let clip_scale = match self.config.max_grad_norm {
            Some(max) if total_norm > max => max / (total_norm + self.config.epsilon),
            _ => 1.0,
        };
        let lr = self.current_lr();
        let AdamWConfig {
            beta1,
            beta2,
            epsilon,
            weight_decay,
            ..
        } = self.config;
        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);

        for (name, var) in params.iter() {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let grad = if clip_scale < 1.0 {
                grad.affine(clip_scale, 0.0).map_err(map_candle)?
            } else {
                grad.clone()
            };

            let current = var.as_tensor().detach();
            let moments = match self.moments.remove(name) {
                Some(m) => m,
                None => Moments {
                    m: current.zeros_like().map_err(map_candle)?,
                    v: current.zeros_like().map_err(map_candle)?,
                },
            };

            // m = β1 * m + (1 - β1) * g ; v = β2 * v + (1 - β2) * g²
            let m = moments
                .m
                .affine(beta1, 0.0)
                .and_then(|m| m.add(&grad.affine(1.0 - beta1, 0.0)?))
                .map_err(map_candle)?
                .detach();
            let v = moments
                .v
                .affine(beta2, 0.0)
                .and_then(|v| v.add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?))
                .map_err(map_candle)?
                .detach();

            let denom = v
                .affine(1.0 / bc2, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, epsilon))
                .map_err(map_candle)?;
            let update = m
                .affine(1.0 / bc1, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(-lr, 0.0))
                .map_err(map_candle)?;

            // θ = θ - lr * wd * θ + update
            let new_val = current
                .affine(1.0 - lr * weight_decay, 0.0)
                .and_then(|c| c.add(&update))
                .map_err(map_candle)?
                .detach();
            var.set(&new_val).map_err(map_candle)?;

            self.moments.insert(name.to_string(), Moments { m, v });
        }

        Ok(total_norm)
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Serialize moments as safetensors bytes.
    pub fn to_bytes(&self) -> RerankResult<Vec<u8>> {
        let mut arrays = BTreeMap::new();
        for (name, moments) in &self.moments {
            arrays.insert(format!("{}.{}", FIRST_MOMENT, name), to_array(&moments.m)?);
            arrays.insert(format!("{}.{}", SECOND_MOMENT, name), to_array(&moments.v)?);
        }
        tensorio::encode(&arrays)
    }

    /// Restore moments and the step counter.
    ///
    /// # Errors
    /// - `CheckpointError` if a moment is missing its pair or names an unknown parameter
    pub fn load(&mut self, bytes: &[u8], step: usize, params: &ParamStore) -> RerankResult<()> {
        let arrays = tensorio::decode(bytes)?;
        let device = params.device();
        let mut moments = BTreeMap::new();
        for (key, m) in &arrays {
            let Some(name) = key.strip_prefix(&format!("{}.", FIRST_MOMENT)) else {
                continue;
            };
            let var = params.get(name).ok_or_else(|| RerankError::CheckpointError {
                message: format!("optimizer state for unknown parameter '{}'", name),
            })?;
            let v = arrays
                .get(&format!("{}.{}", SECOND_MOMENT, name))
                .ok_or_else(|| RerankError::CheckpointError {
                    message: format!("optimizer state for '{}' lacks its second moment", name),
                })?;
            if m.shape.as_slice() != var.as_tensor().dims() || v.shape != m.shape {
                return Err(RerankError::CheckpointError {
                    message: format!("optimizer state for '{}' has shape {:?}", name, m.shape),
                });
            }
            moments.insert(
                name.to_string(),
                Moments {
                    m: from_array(m, device)?,
                    v: from_array(v, device)?,
                },
            );
        }
        if moments.len() * 2 != arrays.len() {
            return Err(RerankError::CheckpointError {
                message: "optimizer state holds unpaired moments".to_string(),
            });
        }
        self.moments = moments;
        self.step = step;
        Ok(())
    }
}

/// Sums minibatch gradients until the optimizer consumes them.
#[derive(Default)]
pub struct GradAccumulator {
    grads: BTreeMap<String, Tensor>,
    pending: usize,
}

impl GradAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradients of every parameter in `params` found in `store`.
    pub fn add(&mut self, params: &ParamStore, store: &GradStore) -> RerankResult<()> {
        for (name, var) in params.iter() {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let summed = match self.grads.remove(name) {
                Some(acc) => acc.add(&grad).map_err(map_candle)?,
                None => grad,
            };
            self.grads.insert(name.to_string(), summed);
        }
        self.pending += 1;
        Ok(())
    }

    /// Minibatches added since the last `take` or `clear`.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Mean gradients over the pending minibatches; resets the accumulator.
    pub fn take(&mut self) -> RerankResult<BTreeMap<String, Tensor>> {
        let scale = 1.0 / self.pending.max(1) as f64;
        let grads = std::mem::take(&mut self.grads);
        self.pending = 0;
        grads
            .into_iter()
            .map(|(name, g)| Ok((name, g.affine(scale, 0.0).map_err(map_candle)?)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.grads.clear();
        self.pending = 0;
    }
}

fn global_norm(grads: &BTreeMap<String, Tensor>) -> RerankResult<f64> {
    let mut total_sq = 0.0f64;
    for grad in grads.values() {
        let sq_sum: f32 = grad
            .sqr()
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_scalar())
            .map_err(map_candle)?;
        total_sq += sq_sum as f64;
    }
    Ok(total_sq.sqrt())
}

fn to_array(tensor: &Tensor) -> RerankResult<NamedArray> {
    let data = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(map_candle)?;
    Ok(NamedArray::new(tensor.dims().to_vec(), data))
}

fn from_array(array: &NamedArray, device: &Device) -> RerankResult<Tensor> {
    Tensor::from_slice(&array.data, array.shape.as_slice(), device).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> RerankError {
    RerankError::TensorError {
        message: format!("Optimizer error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ParamStore, Tensor) {
        let mut params = ParamStore::new(1, &Device::Cpu);
        let w = params.values("w", &[2], &[1.0, -1.0]).unwrap();
        (params, w)
    }

    fn grads(values: &[f32]) -> BTreeMap<String, Tensor> {
        let mut g = BTreeMap::new();
        g.insert("w".to_string(), Tensor::new(values, &Device::Cpu).unwrap());
        g
    }

    #[test]
    fn test_warmup_schedule() {
        let config = AdamWConfig {
            lr: 1e-4,
            schedule: LrSchedule::WarmupCosine,
            total_steps: 100,
            warmup_fraction: 0.1,
            ..Default::default()
        };
        let mut opt = AdamW::new(config);

        assert_eq!(opt.current_lr(), 0.0);

        opt.step = 5;
        assert!((opt.current_lr() - 0.5e-4).abs() < 1e-10);

        opt.step = 10;
        assert!((opt.current_lr() - 1e-4).abs() < 1e-10);

        opt.step = 100;
        assert!(opt.current_lr() < 1e-8, "LR at end should be ~0, got {}", opt.current_lr());
    }

    #[test]
    fn test_constant_schedule() {
        let mut opt = AdamW::new(AdamWConfig::default());
        opt.step = 500;
        assert_eq!(opt.current_lr(), 1e-3);
    }

    #[test]
    fn test_first_step_moves_against_gradient() {
        let (params, w) = store();
        let mut opt = AdamW::new(AdamWConfig {
            lr: 0.1,
            ..Default::default()
        });
        let norm = opt.step(&params, &grads(&[3.0, -4.0])).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert_eq!(opt.global_step(), 1);

        // bias-corrected Adam takes a step of ~lr in the sign of -g
        let v: Vec<f32> = w.to_vec1().unwrap();
        assert!((v[0] - 0.9).abs() < 1e-4, "{:?}", v);
        assert!((v[1] + 0.9).abs() < 1e-4, "{:?}", v);
    }

    #[test]
    fn test_non_finite_norm_skips_update() {
        let (params, w) = store();
        let mut opt = AdamW::new(AdamWConfig::default());
        let err = opt.step(&params, &grads(&[f32::NAN, 0.0])).unwrap_err();
        assert!(err.is_numeric());
        assert_eq!(opt.global_step(), 0);
        assert_eq!(w.to_vec1::<f32>().unwrap(), vec![1.0, -1.0]);
    }

    #[test]
    fn test_state_round_trip_continues_identically() {
        let (params_a, wa) = store();
        let mut a = AdamW::new(AdamWConfig::default());
        a.step(&params_a, &grads(&[0.5, 0.25])).unwrap();

        let (params_b, wb) = store();
        params_b.load_bytes(&params_a.to_bytes().unwrap()).unwrap();
        let mut b = AdamW::new(AdamWConfig::default());
        b.load(&a.to_bytes().unwrap(), a.global_step(), &params_b).unwrap();

        a.step(&params_a, &grads(&[-0.1, 0.3])).unwrap();
        b.step(&params_b, &grads(&[-0.1, 0.3])).unwrap();
        assert_eq!(wa.to_vec1::<f32>().unwrap(), wb.to_vec1::<f32>().unwrap());
        assert_eq!(b.global_step(), 2);
    }

    #[test]
    fn test_accumulator_averages() {
        let mut params = ParamStore::new(1, &Device::Cpu);
        let w = params.values("w", &[1], &[2.0]).unwrap();
        let mut acc = GradAccumulator::new();
        for scale in [1.0, 3.0] {
            let loss = w.affine(scale, 0.0).unwrap().sum_all().unwrap();
            acc.add(&params, &loss.backward().unwrap()).unwrap();
        }
        assert_eq!(acc.pending(), 2);
        let g = acc.take().unwrap();
        assert_eq!(g["w"].to_vec1::<f32>().unwrap(), vec![2.0]);
        assert!(acc.is_empty());
    }
}
