//! Building blocks shared by the rerankers.
//!
//! Everything here is composed from differentiable candle primitives so
//! gradients flow through the whole model. Layer norm is written out
//! explicitly for the same reason.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::Linear;

use super::params::ParamStore;
use crate::error::{RerankError, RerankResult};

/// Score assigned to padding positions before top-k selection.
pub const PAD_SENTINEL: f32 = -1e4;

const NORM_EPS: f64 = 1e-9;
const LAYER_NORM_EPS: f64 = 1e-5;

/// Rows of `table` for `ids [B, L]`, giving `[B, L, E]`.
pub fn embed(table: &Tensor, ids: &Tensor) -> RerankResult<Tensor> {
    let (b, l) = ids.dims2().map_err(map_candle)?;
    let e = table.dim(1).map_err(map_candle)?;
    table
        .index_select(&ids.flatten_all().map_err(map_candle)?, 0)
        .and_then(|t| t.reshape((b, l, e)))
        .map_err(map_candle)
}

/// 1.0 where `ids [B, L]` is not padding, else 0.0.
pub fn valid_mask(ids: &Tensor) -> RerankResult<Tensor> {
    ids.ne(0u32)
        .and_then(|m| m.to_dtype(DType::F32))
        .map_err(map_candle)
}

/// Scale rows to unit L2 norm; zero rows stay zero.
pub fn l2_normalize(x: &Tensor) -> RerankResult<Tensor> {
    let norm = x
        .sqr()
        .and_then(|t| t.sum_keepdim(D::Minus1))
        .and_then(|t| t.sqrt())
        .and_then(|t| t.affine(1.0, NORM_EPS))
        .map_err(map_candle)?;
    x.broadcast_div(&norm).map_err(map_candle)
}

/// Cosine similarity matrix `[B, Q, D]` of `q [B, Q, E]` and `d [B, D, E]`.
pub fn cosine_matrix(q: &Tensor, d: &Tensor) -> RerankResult<Tensor> {
    let qn = l2_normalize(q)?;
    let dn = l2_normalize(d)?;
    let dt = dn.transpose(1, 2).and_then(|t| t.contiguous()).map_err(map_candle)?;
    qn.contiguous().and_then(|t| t.matmul(&dt)).map_err(map_candle)
}

/// Zero out rows and columns of `sim [B, Q, D]` that belong to padding.
pub fn mask_matrix(sim: &Tensor, qmask: &Tensor, dmask: &Tensor) -> RerankResult<Tensor> {
    let q = qmask.unsqueeze(2).map_err(map_candle)?;
    let d = dmask.unsqueeze(1).map_err(map_candle)?;
    sim.broadcast_mul(&q)
        .and_then(|t| t.broadcast_mul(&d))
        .map_err(map_candle)
}

/// Pairwise attention mask `[B, L, L]` from validity `[B, L]`:
/// 0 where both positions are real tokens, `-inf` otherwise.
pub fn pair_mask(valid: &Tensor) -> RerankResult<Tensor> {
    let (b, l) = valid.dims2().map_err(map_candle)?;
    let rows = valid.unsqueeze(2).and_then(|t| t.broadcast_as((b, l, l))).map_err(map_candle)?;
    let cols = valid.unsqueeze(1).and_then(|t| t.broadcast_as((b, l, l))).map_err(map_candle)?;
    let both = rows.mul(&cols).map_err(map_candle)?;
    let zeros = Tensor::zeros((b, l, l), DType::F32, valid.device()).map_err(map_candle)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (b, l, l), valid.device()).map_err(map_candle)?;
    both.ne(0f32)
        .and_then(|m| m.where_cond(&zeros, &neg_inf))
        .map_err(map_candle)
}

/// Pair mask with padding rows opened up so every softmax row stays finite.
pub fn attention_mask(valid: &Tensor) -> RerankResult<Tensor> {
    let mask = pair_mask(valid)?;
    let (b, l) = valid.dims2().map_err(map_candle)?;
    let pad_rows = valid
        .unsqueeze(2)
        .and_then(|t| t.broadcast_as((b, l, l)))
        .and_then(|t| t.eq(0f32))
        .map_err(map_candle)?;
    let zeros = Tensor::zeros((b, l, l), DType::F32, valid.device()).map_err(map_candle)?;
    pad_rows.where_cond(&zeros, &mask).map_err(map_candle)
}

/// Keep the `k` largest values along the last axis of `x [B, Q, D]`,
/// ignoring positions where `dmask [B, D]` is 0. Slots that only padding
/// could fill come out as 0.
pub fn masked_kmax(x: &Tensor, dmask: &Tensor, k: usize) -> RerankResult<Tensor> {
    let (b, q, d) = x.dims3().map_err(map_candle)?;
    let keep = dmask
        .unsqueeze(1)
        .and_then(|t| t.broadcast_as((b, q, d)))
        .and_then(|t| t.ne(0f32))
        .map_err(map_candle)?;
    let sentinel = Tensor::full(PAD_SENTINEL, (b, q, d), x.device()).map_err(map_candle)?;
    let masked = keep.where_cond(x, &sentinel).map_err(map_candle)?;

    let take = k.min(d);
    let order = masked
        .contiguous()
        .and_then(|t| t.arg_sort_last_dim(false))
        .and_then(|t| t.narrow(2, 0, take))
        .and_then(|t| t.contiguous())
        .map_err(map_candle)?;
    let top = masked.contiguous().and_then(|t| t.gather(&order, 2)).map_err(map_candle)?;

    let zeros = top.zeros_like().map_err(map_candle)?;
    let top = top
        .ge(PAD_SENTINEL / 2.0)
        .and_then(|m| m.where_cond(&top, &zeros))
        .map_err(map_candle)?;

    if take < k {
        top.pad_with_zeros(2, 0, k - take).map_err(map_candle)
    } else {
        Ok(top)
    }
}

/// Softmax over the last axis with masked positions pushed to ~0 weight.
pub fn masked_softmax(x: &Tensor, mask: &Tensor) -> RerankResult<Tensor> {
    let sentinel = Tensor::full(PAD_SENTINEL, x.dims(), x.device()).map_err(map_candle)?;
    let filled = mask
        .ne(0f32)
        .and_then(|m| m.where_cond(x, &sentinel))
        .map_err(map_candle)?;
    candle_nn::ops::softmax(&filled, D::Minus1).map_err(map_candle)
}

// ============================================================================
// LAYER NORM
// ============================================================================

/// Layer normalization over the last axis.
pub struct LayerNorm {
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    pub fn new(params: &mut ParamStore, name: &str, dim: usize) -> RerankResult<Self> {
        Ok(Self {
            gamma: params.constant(&format!("{}.gamma", name), &[dim], 1.0)?,
            beta: params.constant(&format!("{}.beta", name), &[dim], 0.0)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> RerankResult<Tensor> {
        let mean = x.mean_keepdim(D::Minus1).map_err(map_candle)?;
        let centered = x.broadcast_sub(&mean).map_err(map_candle)?;
        let var = centered
            .sqr()
            .and_then(|t| t.mean_keepdim(D::Minus1))
            .map_err(map_candle)?;
        let denom = var
            .affine(1.0, LAYER_NORM_EPS)
            .and_then(|t| t.sqrt())
            .map_err(map_candle)?;
        centered
            .broadcast_div(&denom)
            .and_then(|t| t.broadcast_mul(&self.gamma))
            .and_then(|t| t.broadcast_add(&self.beta))
            .map_err(map_candle)
    }
}

// ============================================================================
// TRANSFORMER BLOCK
// ============================================================================

/// Multi-head self-attention with projections of width `projdim`.
pub struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn new(
        params: &mut ParamStore,
        name: &str,
        dim: usize,
        projdim: usize,
        heads: usize,
    ) -> RerankResult<Self> {
        if heads == 0 || projdim % heads != 0 {
            return Err(RerankError::config(format!(
                "projdim {} is not divisible by {} heads",
                projdim, heads
            )));
        }
        Ok(Self {
            query: params.linear(&format!("{}.query", name), dim, projdim, true)?,
            key: params.linear(&format!("{}.key", name), dim, projdim, true)?,
            value: params.linear(&format!("{}.value", name), dim, projdim, true)?,
            output: params.linear(&format!("{}.output", name), projdim, dim, true)?,
            heads,
            head_dim: projdim / heads,
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, l: usize) -> RerankResult<Tensor> {
        x.reshape((b, l, self.heads, self.head_dim))
            .and_then(|t| t.transpose(1, 2))
            .and_then(|t| t.contiguous())
            .map_err(map_candle)
    }

    /// `x [B, L, E]`, optional additive `mask [B, L, L]`.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> RerankResult<Tensor> {
        let (b, l, _) = x.dims3().map_err(map_candle)?;
        let q = self.split_heads(&self.query.forward(x).map_err(map_candle)?, b, l)?;
        let k = self.split_heads(&self.key.forward(x).map_err(map_candle)?, b, l)?;
        let v = self.split_heads(&self.value.forward(x).map_err(map_candle)?, b, l)?;

        let kt = k.transpose(2, 3).and_then(|t| t.contiguous()).map_err(map_candle)?;
        let mut scores = q
            .matmul(&kt)
            .and_then(|t| t.affine(1.0 / (self.head_dim as f64).sqrt(), 0.0))
            .map_err(map_candle)?;
        if let Some(mask) = mask {
            let mask = mask.unsqueeze(1).map_err(map_candle)?;
            scores = scores.broadcast_add(&mask).map_err(map_candle)?;
        }
        let weights = candle_nn::ops::softmax(&scores, D::Minus1).map_err(map_candle)?;
        let context = weights
            .matmul(&v)
            .and_then(|t| t.transpose(1, 2))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((b, l, self.heads * self.head_dim)))
            .map_err(map_candle)?;
        self.output.forward(&context).map_err(map_candle)
    }
}

/// Pre-norm transformer block: attention then feed-forward, both residual.
pub struct TransformerBlock {
    attn_norm: LayerNorm,
    attention: SelfAttention,
    ff_norm: LayerNorm,
    ff_in: Linear,
    ff_out: Linear,
}

impl TransformerBlock {
    pub fn new(
        params: &mut ParamStore,
        name: &str,
        dim: usize,
        projdim: usize,
        heads: usize,
        ffdim: usize,
    ) -> RerankResult<Self> {
        Ok(Self {
            attn_norm: LayerNorm::new(params, &format!("{}.attn_norm", name), dim)?,
            attention: SelfAttention::new(params, &format!("{}.attn", name), dim, projdim, heads)?,
            ff_norm: LayerNorm::new(params, &format!("{}.ff_norm", name), dim)?,
            ff_in: params.linear(&format!("{}.ff_in", name), dim, ffdim, true)?,
            ff_out: params.linear(&format!("{}.ff_out", name), ffdim, dim, true)?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> RerankResult<Tensor> {
        let attended = self.attention.forward(&self.attn_norm.forward(x)?, mask)?;
        let x = x.add(&attended).map_err(map_candle)?;
        let hidden = self
            .ff_in
            .forward(&self.ff_norm.forward(&x)?)
            .and_then(|t| t.relu())
            .map_err(map_candle)?;
        let ff = self.ff_out.forward(&hidden).map_err(map_candle)?;
        x.add(&ff).map_err(map_candle)
    }
}

pub(crate) fn map_candle(e: candle_core::Error) -> RerankError {
    RerankError::TensorError {
        message: format!("Reranker error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t2(v: Vec<Vec<f32>>) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_embed_lookup() {
        let table = t2(vec![vec![0.0, 0.0], vec![1.0, 2.0], vec![3.0, 4.0]]);
        let ids = Tensor::new(&[[2u32, 0], [1, 1]], &Device::Cpu).unwrap();
        let out = embed(&table, &ids).unwrap();
        assert_eq!(out.dims(), &[2, 2, 2]);
        assert_eq!(
            out.to_vec3::<f32>().unwrap(),
            vec![vec![vec![3.0, 4.0], vec![0.0, 0.0]], vec![vec![1.0, 2.0], vec![1.0, 2.0]]]
        );
    }

    #[test]
    fn test_cosine_matrix_zero_rows() {
        let q = Tensor::new(&[[[1f32, 0.0], [0.0, 0.0]]], &Device::Cpu).unwrap();
        let d = Tensor::new(&[[[2f32, 0.0], [0.0, 3.0]]], &Device::Cpu).unwrap();
        let sim = cosine_matrix(&q, &d).unwrap().to_vec3::<f32>().unwrap();
        assert!((sim[0][0][0] - 1.0).abs() < 1e-5);
        assert!(sim[0][0][1].abs() < 1e-5);
        assert_eq!(sim[0][1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_masked_kmax_ignores_padding() {
        let x = Tensor::new(&[[[0.1f32, 0.9, 0.5, 0.7]]], &Device::Cpu).unwrap();
        let dmask = t2(vec![vec![1.0, 0.0, 1.0, 0.0]]);
        let top = masked_kmax(&x, &dmask, 3).unwrap().to_vec3::<f32>().unwrap();
        // 0.9 and 0.7 sit on padding; the third slot is only fillable by padding
        assert_eq!(top[0][0], vec![0.5, 0.1, 0.0]);
    }

    #[test]
    fn test_masked_kmax_pads_short_documents() {
        let x = Tensor::new(&[[[0.2f32, 0.4]]], &Device::Cpu).unwrap();
        let dmask = t2(vec![vec![1.0, 1.0]]);
        let top = masked_kmax(&x, &dmask, 3).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(top[0][0], vec![0.4, 0.2, 0.0]);
    }

    #[test]
    fn test_attention_mask_rows_finite() {
        let valid = t2(vec![vec![1.0, 0.0]]);
        let mask = attention_mask(&valid).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(mask[0][0][0], 0.0);
        assert_eq!(mask[0][0][1], f32::NEG_INFINITY);
        assert_eq!(mask[0][1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_masked_softmax() {
        let x = t2(vec![vec![1.0, 1.0, 5.0]]);
        let mask = t2(vec![vec![1.0, 1.0, 0.0]]);
        let p = masked_softmax(&x, &mask).unwrap().to_vec2::<f32>().unwrap();
        assert!((p[0][0] - 0.5).abs() < 1e-4);
        assert!(p[0][2] < 1e-6);
    }

    #[test]
    fn test_layer_norm_and_block_shapes() {
        let mut params = ParamStore::new(3, &Device::Cpu);
        let norm = LayerNorm::new(&mut params, "ln", 4).unwrap();
        let x = Tensor::new(&[[[1f32, 2.0, 3.0, 4.0]]], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap().to_vec3::<f32>().unwrap();
        let mean: f32 = y[0][0].iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);

        let block = TransformerBlock::new(&mut params, "block0", 4, 8, 2, 6).unwrap();
        let x = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let valid = t2(vec![vec![1.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]]);
        let mask = attention_mask(&valid).unwrap();
        let out = block.forward(&x, Some(&mask)).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
