//! TK: transformer-contextualized embeddings with RBF kernel pooling.
//!
//! Query and document embeddings pass through the same stack of pre-norm
//! self-attention blocks, optionally mixed back with the raw embeddings.
//! The cosine matrix of the contextual vectors is soft-binned by eleven
//! Gaussian kernels, and log-summed kernel counts feed a single dense layer
//! (or, with `singlefc = false`, a log-sum and a length-normalized branch
//! joined by a combining layer).

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Linear;
use tracing::info;

use super::layers::{
    attention_mask, cosine_matrix, embed, map_candle, mask_matrix, pair_mask, valid_mask,
    TransformerBlock,
};
use super::params::ParamStore;
use super::{extractor_not_built, reranker_not_built, DocSlot, Reranker};
use crate::batch::Batch;
use crate::config::TkConfig;
use crate::error::RerankResult;
use crate::extractor::{EmbedText, Extractor, QUERY};

/// Kernel centers, exact match first.
pub const KERNEL_MUS: [f32; 11] = [1.0, 0.9, 0.7, 0.5, 0.3, 0.1, -0.1, -0.3, -0.5, -0.7, -0.9];
/// Kernel width shared by all kernels.
pub const KERNEL_SIGMA: f32 = 0.1;

const KERNEL_SCALE: f64 = 0.01;
const LOG_FLOOR: f64 = 1e-10;

pub struct Tk {
    config: TkConfig,
    extractor: Arc<EmbedText>,
    params: ParamStore,
    device: Device,
    model: Option<Model>,
}

struct Model {
    embeddings: Tensor,
    blocks: Vec<TransformerBlock>,
    mixer: Option<Tensor>,
    mu: Tensor,
    sigma: Tensor,
    dense: Linear,
    mean_branch: Option<(Linear, Linear)>,
}

impl Tk {
    pub fn new(config: TkConfig, extractor: Arc<EmbedText>, device: &Device) -> Self {
        Self {
            params: ParamStore::new(config.seed, device),
            config,
            extractor,
            device: device.clone(),
            model: None,
        }
    }

    /// Attention mask `[B, L, L]` for an embedded sequence `[B, L, E]`.
    ///
    /// Positions whose embedding is all zeros count as padding; entry
    /// `(b, i, j)` is 0 when both `i` and `j` are real tokens and `-inf`
    /// otherwise.
    pub fn get_mask(embedding: &Tensor) -> RerankResult<Tensor> {
        let valid = embedding
            .abs()
            .and_then(|t| t.sum(D::Minus1))
            .and_then(|t| t.ne(0f32))
            .and_then(|t| t.to_dtype(DType::F32))
            .map_err(map_candle)?;
        pair_mask(&valid)
    }

    fn contextualize(&self, model: &Model, x: &Tensor, valid: &Tensor) -> RerankResult<Tensor> {
        let mask = if self.config.usemask {
            Some(attention_mask(valid)?)
        } else {
            None
        };
        let mut h = x.clone();
        for block in &model.blocks {
            h = block.forward(&h, mask.as_ref())?;
        }
        if let Some(mixer) = &model.mixer {
            let raw = x.broadcast_mul(mixer).map_err(map_candle)?;
            let ctx = mixer
                .affine(-1.0, 1.0)
                .and_then(|m| h.broadcast_mul(&m))
                .map_err(map_candle)?;
            h = raw.add(&ctx).map_err(map_candle)?;
        }
        let valid = valid.unsqueeze(2).map_err(map_candle)?;
        h.broadcast_mul(&valid).map_err(map_candle)
    }

    /// Gaussian kernel activations `[B, Q, K]` summed over document positions.
    fn kernel_counts(&self, model: &Model, sim: &Tensor, dmask: &Tensor) -> RerankResult<Tensor> {
        let k = KERNEL_MUS.len();
        let mu = model.mu.reshape((1, 1, 1, k)).map_err(map_candle)?;
        let two_sigma_sq = model
            .sigma
            .sqr()
            .and_then(|s| s.affine(2.0, 0.0))
            .and_then(|s| s.reshape((1, 1, 1, k)))
            .map_err(map_candle)?;
        let dmask = dmask
            .unsqueeze(1)
            .and_then(|t| t.unsqueeze(3))
            .map_err(map_candle)?;

        sim.unsqueeze(3)
            .and_then(|t| t.broadcast_sub(&mu))
            .and_then(|t| t.sqr())
            .and_then(|t| t.broadcast_div(&two_sigma_sq))
            .and_then(|t| t.neg())
            .and_then(|t| t.exp())
            .and_then(|t| t.broadcast_mul(&dmask))
            .and_then(|t| t.sum(2))
            .map_err(map_candle)
    }
}

impl Reranker for Tk {
    fn name(&self) -> &'static str {
        "tk"
    }

    fn build(&mut self) -> RerankResult<()> {
        if self.model.is_some() {
            return Ok(());
        }
        if !self.extractor.is_built() {
            return Err(extractor_not_built("tk"));
        }

        let table = self.extractor.embedding_tensor(&self.device)?;
        let embeddings = if self.config.finetune {
            self.params.register("embedding", &table)?
        } else {
            table
        };
        let dim = self.extractor.embedding_dim();

        let mut blocks = Vec::with_capacity(self.config.numlayers);
        for i in 0..self.config.numlayers {
            blocks.push(TransformerBlock::new(
                &mut self.params,
                &format!("block{}", i),
                dim,
                self.config.projdim,
                self.config.numattheads,
                self.config.ffdim,
            )?);
        }

        let mixer = if self.config.usemixer {
            Some(self.params.constant("mixer", &[1], self.config.alpha as f32)?)
        } else {
            None
        };

        let k = KERNEL_MUS.len();
        let sigmas = [KERNEL_SIGMA; 11];
        let (mu, sigma) = if self.config.gradkernels {
            (
                self.params.values("kernel_mu", &[k], &KERNEL_MUS)?,
                self.params.values("kernel_sigma", &[k], &sigmas)?,
            )
        } else {
            (
                Tensor::from_slice(&KERNEL_MUS, k, &self.device).map_err(map_candle)?,
                Tensor::from_slice(&sigmas, k, &self.device).map_err(map_candle)?,
            )
        };

        let dense = self.params.linear("dense", k, 1, false)?;
        let mean_branch = if self.config.singlefc {
            None
        } else {
            Some((
                self.params.linear("dense_mean", k, 1, false)?,
                self.params.linear("dense_comb", 2, 1, false)?,
            ))
        };

        info!(
            params = self.params.num_elements(),
            layers = blocks.len(),
            finetune = self.config.finetune,
            "Built tk"
        );
        self.model = Some(Model {
            embeddings,
            blocks,
            mixer,
            mu,
            sigma,
            dense,
            mean_branch,
        });
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.model.is_some()
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn extractor(&self) -> &dyn Extractor {
        self.extractor.as_ref()
    }

    fn score_docs(&self, batch: &Batch, slot: DocSlot) -> RerankResult<Tensor> {
        let model = self.model.as_ref().ok_or_else(|| reranker_not_built("tk"))?;
        let q_ids = batch.feature(QUERY)?;
        let d_ids = batch.feature(slot.feature())?;
        let qmask = valid_mask(q_ids)?;
        let dmask = valid_mask(d_ids)?;

        let q = self.contextualize(model, &embed(&model.embeddings, q_ids)?, &qmask)?;
        let d = self.contextualize(model, &embed(&model.embeddings, d_ids)?, &dmask)?;
        let sim = mask_matrix(&cosine_matrix(&q, &d)?, &qmask, &dmask)?;

        let counts = self.kernel_counts(model, &sim, &dmask)?;
        let qmask3 = qmask.unsqueeze(2).map_err(map_candle)?;

        let log_sum = counts
            .maximum(LOG_FLOOR)
            .and_then(|t| t.log())
            .and_then(|t| t.affine(KERNEL_SCALE, 0.0))
            .and_then(|t| t.broadcast_mul(&qmask3))
            .and_then(|t| t.sum(1))
            .map_err(map_candle)?;
        let mut score = model.dense.forward(&log_sum).map_err(map_candle)?;

        if let Some((dense_mean, dense_comb)) = &model.mean_branch {
            let doc_len = dmask
                .sum_keepdim(1)
                .and_then(|t| t.affine(1.0, 1.0))
                .and_then(|t| t.unsqueeze(2))
                .map_err(map_candle)?;
            let mean = counts
                .broadcast_div(&doc_len)
                .and_then(|t| t.affine(KERNEL_SCALE, 0.0))
                .and_then(|t| t.broadcast_mul(&qmask3))
                .and_then(|t| t.sum(1))
                .map_err(map_candle)?;
            let mean_score = dense_mean.forward(&mean).map_err(map_candle)?;
            score = Tensor::cat(&[&score, &mean_score], 1)
                .and_then(|t| dense_comb.forward(&t))
                .map_err(map_candle)?;
        }

        if self.config.scoretanh {
            score = score.tanh().map_err(map_candle)?;
        }
        score.squeeze(1).map_err(map_candle)
    }
}
