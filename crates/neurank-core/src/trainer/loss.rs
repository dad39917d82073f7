//! Pairwise ranking losses.

use candle_core::Tensor;

use crate::config::TrainerConfig;
use crate::error::{RerankError, RerankResult};
use crate::reranker::PairScores;

/// Objective over (positive, negative) score pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairwiseLoss {
    /// Cross-entropy of a two-way softmax: `mean(softplus(neg - pos))`.
    Softmax,
    /// Hinge: `mean(relu(margin - pos + neg))`.
    Margin(f64),
}

impl PairwiseLoss {
    pub fn from_config(config: &TrainerConfig) -> Self {
        if config.softmaxloss {
            Self::Softmax
        } else {
            Self::Margin(config.margin)
        }
    }

    /// Scalar loss tensor and its host value.
    ///
    /// # Errors
    /// - `NumericInstability` if the loss is NaN or infinite
    pub fn compute(&self, scores: &PairScores) -> RerankResult<(Tensor, f64)> {
        let diff = scores.neg.sub(&scores.pos).map_err(map_candle)?;
        let per_pair = match self {
            Self::Softmax => softplus(&diff)?,
            Self::Margin(margin) => diff.affine(1.0, *margin).and_then(|t| t.relu()).map_err(map_candle)?,
        };
        let loss = per_pair.mean_all().map_err(map_candle)?;
        let value = loss.to_scalar::<f32>().map_err(map_candle)? as f64;
        if !value.is_finite() {
            return Err(RerankError::NumericInstability {
                stage: "loss".to_string(),
                value,
            });
        }
        Ok((loss, value))
    }
}

/// `ln(1 + e^x)` in the overflow-safe form `relu(x) + ln(1 + e^-|x|)`.
pub fn softplus(x: &Tensor) -> RerankResult<Tensor> {
    let tail = x
        .abs()
        .and_then(|t| t.neg())
        .and_then(|t| t.exp())
        .and_then(|t| t.affine(1.0, 1.0))
        .and_then(|t| t.log())
        .map_err(map_candle)?;
    x.relu().and_then(|r| r.add(&tail)).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> RerankError {
    RerankError::TensorError {
        message: format!("Loss error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scores(pos: &[f32], neg: &[f32]) -> PairScores {
        PairScores {
            pos: Tensor::new(pos, &Device::Cpu).unwrap(),
            neg: Tensor::new(neg, &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn test_softmax_loss_values() {
        let (_, tie) = PairwiseLoss::Softmax.compute(&scores(&[0.5], &[0.5])).unwrap();
        assert!((tie - std::f64::consts::LN_2).abs() < 1e-6);

        let (_, good) = PairwiseLoss::Softmax.compute(&scores(&[5.0], &[-5.0])).unwrap();
        assert!(good < 1e-4);

        // large gaps do not overflow
        let (_, bad) = PairwiseLoss::Softmax.compute(&scores(&[-200.0], &[200.0])).unwrap();
        assert!((bad - 400.0).abs() < 1e-3);
    }

    #[test]
    fn test_margin_loss_values() {
        let loss = PairwiseLoss::Margin(1.0);
        let (_, satisfied) = loss.compute(&scores(&[2.0, 3.0], &[0.0, 1.0])).unwrap();
        assert_eq!(satisfied, 0.0);
        let (_, violated) = loss.compute(&scores(&[0.0, 0.0], &[0.5, -0.5])).unwrap();
        assert!((violated - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_loss_is_numeric_error() {
        let err = PairwiseLoss::Softmax
            .compute(&scores(&[f32::NAN], &[0.0]))
            .unwrap_err();
        assert!(err.is_numeric());
    }

    #[test]
    fn test_from_config() {
        let config = TrainerConfig {
            softmaxloss: false,
            margin: 0.3,
            ..Default::default()
        };
        assert_eq!(PairwiseLoss::from_config(&config), PairwiseLoss::Margin(0.3));
        assert_eq!(PairwiseLoss::from_config(&TrainerConfig::default()), PairwiseLoss::Softmax);
    }
}
