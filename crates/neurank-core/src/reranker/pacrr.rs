//! PACRR: position-aware convolutions over a query/document similarity matrix.

use std::sync::Arc;

use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Linear};
use tracing::info;

use super::layers::{cosine_matrix, embed, map_candle, mask_matrix, masked_kmax, masked_softmax, valid_mask};
use super::params::ParamStore;
use super::{extractor_not_built, reranker_not_built, DocSlot, Reranker};
use crate::batch::Batch;
use crate::config::{Nonlinearity, PacrrConfig};
use crate::error::{RerankError, RerankResult};
use crate::extractor::{EmbedText, Extractor, QUERY, QUERY_IDF};

pub struct Pacrr {
    config: PacrrConfig,
    extractor: Arc<EmbedText>,
    params: ParamStore,
    device: Device,
    model: Option<Model>,
}

struct Model {
    embeddings: Tensor,
    convs: Vec<(usize, Conv2d)>,
    combine1: Linear,
    combine2: Linear,
    output: Linear,
}

impl Pacrr {
    pub fn new(config: PacrrConfig, extractor: Arc<EmbedText>, device: &Device) -> Self {
        Self {
            params: ParamStore::new(config.seed, device),
            config,
            extractor,
            device: device.clone(),
            model: None,
        }
    }

    fn activate(&self, x: &Tensor) -> RerankResult<Tensor> {
        match self.config.nonlinearity {
            Nonlinearity::Relu => x.relu(),
            Nonlinearity::Tanh => x.tanh(),
        }
        .map_err(map_candle)
    }

    /// Width of the flattened per-query feature vector.
    fn feature_width(&self) -> usize {
        let ngrams = self.config.maxgram - self.config.mingram + 1;
        let per_term = ngrams * self.config.kmax + usize::from(self.config.idf);
        self.extractor.maxqlen() * per_term
    }
}

impl Reranker for Pacrr {
    fn name(&self) -> &'static str {
        "pacrr"
    }

    fn build(&mut self) -> RerankResult<()> {
        if self.model.is_some() {
            return Ok(());
        }
        if !self.extractor.is_built() {
            return Err(extractor_not_built("pacrr"));
        }
        if self.config.idf && !self.extractor.config().calcidf {
            return Err(RerankError::config(
                "pacrr idf=true needs an embedtext extractor with calcidf=true",
            ));
        }

        let embeddings = self.extractor.embedding_tensor(&self.device)?;
        let mut convs = Vec::new();
        for n in self.config.mingram..=self.config.maxgram {
            let conv = self.params.conv2d(&format!("conv{}", n), 1, self.config.nfilters, n)?;
            convs.push((n, conv));
        }
        let width = self.feature_width();
        let combine = self.config.combine;
        let combine1 = self.params.linear("combine1", width, combine, true)?;
        let combine2 = self.params.linear("combine2", combine, combine, true)?;
        let output = self.params.linear("output", combine, 1, true)?;

        info!(
            params = self.params.num_elements(),
            ngrams = convs.len(),
            feature_width = width,
            "Built pacrr"
        );
        self.model = Some(Model {
            embeddings,
            convs,
            combine1,
            combine2,
            output,
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
        let model = self.model.as_ref().ok_or_else(|| reranker_not_built("pacrr"))?;
        let q_ids = batch.feature(QUERY)?;
        let d_ids = batch.feature(slot.feature())?;
        let qmask = valid_mask(q_ids)?;
        let dmask = valid_mask(d_ids)?;

        let q = embed(&model.embeddings, q_ids)?;
        let d = embed(&model.embeddings, d_ids)?;
        let sim = mask_matrix(&cosine_matrix(&q, &d)?, &qmask, &dmask)?;
        let sim = sim.unsqueeze(1).map_err(map_candle)?;

        let mut pooled = Vec::with_capacity(model.convs.len() + 1);
        for (n, conv) in &model.convs {
            // pad bottom/right so every position starts an n-gram window
            let padded = if *n > 1 {
                sim.pad_with_zeros(2, 0, n - 1)
                    .and_then(|t| t.pad_with_zeros(3, 0, n - 1))
                    .map_err(map_candle)?
            } else {
                sim.clone()
            };
            let filtered = padded
                .contiguous()
                .and_then(|t| conv.forward(&t))
                .and_then(|t| t.relu())
                .and_then(|t| t.max(1))
                .map_err(map_candle)?;
            pooled.push(masked_kmax(&filtered, &dmask, self.config.kmax)?);
        }

        if self.config.idf {
            let idf = batch.feature(QUERY_IDF)?;
            let weights = masked_softmax(idf, &qmask)?.unsqueeze(2).map_err(map_candle)?;
            pooled.push(weights);
        }

        let features = Tensor::cat(&pooled, 2)
            .and_then(|t| t.flatten_from(1))
            .map_err(map_candle)?;
        let hidden = self.activate(&model.combine1.forward(&features).map_err(map_candle)?)?;
        let hidden = self.activate(&model.combine2.forward(&hidden).map_err(map_candle)?)?;
        model
            .output
            .forward(&hidden)
            .and_then(|t| t.squeeze(1))
            .map_err(map_candle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedTextConfig;
    use crate::testutil;

    fn small_config() -> PacrrConfig {
        PacrrConfig {
            maxgram: 2,
            nfilters: 4,
            kmax: 2,
            combine: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_scores_have_batch_shape() {
        let ext = testutil::embedtext(EmbedTextConfig {
            maxqlen: 4,
            maxdoclen: 10,
            ..Default::default()
        });
        let mut model = Pacrr::new(small_config(), ext.clone(), &Device::Cpu);
        model.build().unwrap();
        // 2 convolutions + 2 linear layers with biases, plus the output layer
        assert_eq!(model.params().len(), 10);

        let batch = testutil::pair_batch(ext.as_ref());
        let scores = model.score(&batch).unwrap();
        assert_eq!(scores.pos.dims(), &[1]);
        assert_eq!(scores.neg.dims(), &[1]);
        assert!(scores.pos.to_vec1::<f32>().unwrap()[0].is_finite());
    }

    #[test]
    fn test_same_seed_same_scores() {
        let ext = testutil::embedtext(EmbedTextConfig::default());
        let batch = testutil::pair_batch(ext.as_ref());
        let run = || {
            let mut model = Pacrr::new(small_config(), ext.clone(), &Device::Cpu);
            model.build().unwrap();
            model.test(&batch).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_build_requires_built_extractor() {
        let ext = testutil::unbuilt_embedtext(EmbedTextConfig::default());
        let mut model = Pacrr::new(small_config(), ext, &Device::Cpu);
        let err = model.build().unwrap_err();
        assert!(err.to_string().contains("configuration order"));
    }

    #[test]
    fn test_score_before_build() {
        let ext = testutil::embedtext(EmbedTextConfig::default());
        let batch = testutil::pair_batch(ext.as_ref());
        let model = Pacrr::new(small_config(), ext, &Device::Cpu);
        assert!(matches!(model.test(&batch), Err(RerankError::NotBuilt { .. })));
    }

    #[test]
    fn test_idf_requires_calcidf() {
        let ext = testutil::embedtext(EmbedTextConfig {
            calcidf: false,
            ..Default::default()
        });
        let mut model = Pacrr::new(small_config(), ext, &Device::Cpu);
        assert!(model.build().is_err());
    }
}
