//! Neural reranker family.
//!
//! Every reranker scores `(query, document)` pairs from a collated
//! [`Batch`]. Rerankers receive their extractor at construction, allocate
//! parameters in [`Reranker::build`], and expose them through a
//! [`ParamStore`] for the optimizer and for checkpoints.
//!
//! | Reranker | Extractor | Model |
//! |----------|-----------|-------|
//! | [`Pacrr`] | `embedtext` | cosine matrix, n-gram convolutions, k-max pooling |
//! | [`Dssm`] | `bagofwords` | shared tanh MLP over count vectors |
//! | [`Tk`] | `embedtext` | transformer contextualization, RBF kernel pooling |

mod dssm;
pub mod layers;
mod pacrr;
mod params;
mod tk;

pub use dssm::Dssm;
pub use pacrr::Pacrr;
pub use params::ParamStore;
pub use tk::Tk;

use candle_core::{Device, Tensor};

use crate::batch::Batch;
use crate::config::RerankerConfig;
use crate::error::{RerankError, RerankResult};
use crate::extractor::{Extractor, ExtractorHandle, NEGDOC, POSDOC};

/// Which document of a pair sample to score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocSlot {
    /// `posdoc` features (the only document at prediction time).
    Pos,
    /// `negdoc` features.
    Neg,
}

impl DocSlot {
    /// Feature name holding this slot's document.
    pub fn feature(&self) -> &'static str {
        match self {
            DocSlot::Pos => POSDOC,
            DocSlot::Neg => NEGDOC,
        }
    }
}

/// Scores of both documents of each pair, each `[batch]`.
#[derive(Debug, Clone)]
pub struct PairScores {
    pub pos: Tensor,
    pub neg: Tensor,
}

/// A trainable scoring model.
pub trait Reranker: Send {
    fn name(&self) -> &'static str;

    /// Allocate parameters.
    ///
    /// # Errors
    /// - `ConfigError` if the extractor has not been built yet
    fn build(&mut self) -> RerankResult<()>;

    fn is_built(&self) -> bool;

    /// Trainable variables (empty before `build`).
    fn params(&self) -> &ParamStore;

    /// Device the parameters live on.
    fn device(&self) -> &Device;

    /// Extractor whose features this reranker consumes.
    fn extractor(&self) -> &dyn Extractor;

    /// Scores `[batch]` of the documents in `slot`.
    fn score_docs(&self, batch: &Batch, slot: DocSlot) -> RerankResult<Tensor>;

    /// Scores of positive and negative documents of a training batch.
    fn score(&self, batch: &Batch) -> RerankResult<PairScores> {
        Ok(PairScores {
            pos: self.score_docs(batch, DocSlot::Pos)?,
            neg: self.score_docs(batch, DocSlot::Neg)?,
        })
    }

    /// Scores of a prediction batch on the host.
    fn test(&self, batch: &Batch) -> RerankResult<Vec<f32>> {
        self.score_docs(batch, DocSlot::Pos)?
            .to_vec1::<f32>()
            .map_err(|e| RerankError::TensorError {
                message: format!("Failed to read scores: {}", e),
            })
    }
}

/// Construct the configured reranker around a built extractor.
///
/// # Errors
/// - `ConfigError` when the extractor flavor does not match the reranker
pub fn create_reranker(
    config: &RerankerConfig,
    extractor: &ExtractorHandle,
    device: &Device,
) -> RerankResult<Box<dyn Reranker>> {
    config.validate()?;
    match (config, extractor) {
        (RerankerConfig::Pacrr(c), ExtractorHandle::EmbedText(e)) => {
            Ok(Box::new(Pacrr::new(c.clone(), e.clone(), device)))
        }
        (RerankerConfig::Tk(c), ExtractorHandle::EmbedText(e)) => {
            Ok(Box::new(Tk::new(c.clone(), e.clone(), device)))
        }
        (RerankerConfig::Dssm(c), ExtractorHandle::BagOfWords(e)) => {
            Ok(Box::new(Dssm::new(c.clone(), e.clone(), device)))
        }
        (config, extractor) => Err(RerankError::config(format!(
            "reranker '{}' cannot consume features of extractor '{}'",
            config.name(),
            extractor.name()
        ))),
    }
}

/// Error for `build()` called before the extractor.
pub(crate) fn extractor_not_built(reranker: &str) -> RerankError {
    RerankError::config(format!(
        "configuration order: {} requires a built extractor; call create() first",
        reranker
    ))
}

/// Error for scoring before `build()`.
pub(crate) fn reranker_not_built(reranker: &'static str) -> RerankError {
    RerankError::NotBuilt {
        component: reranker,
        message: "call build() before scoring".to_string(),
    }
}
