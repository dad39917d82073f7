//! DSSM: shared tanh projection of bag-of-words vectors.

use std::sync::Arc;

use candle_core::{Device, Module, Tensor, D};
use candle_nn::Linear;
use tracing::info;

use super::layers::{l2_normalize, map_candle};
use super::params::ParamStore;
use super::{extractor_not_built, reranker_not_built, DocSlot, Reranker};
use crate::batch::Batch;
use crate::config::{DssmConfig, Similarity};
use crate::error::RerankResult;
use crate::extractor::{BagOfWords, Extractor, QUERY};

pub struct Dssm {
    config: DssmConfig,
    extractor: Arc<BagOfWords>,
    params: ParamStore,
    device: Device,
    layers: Option<Vec<Linear>>,
}

impl Dssm {
    pub fn new(config: DssmConfig, extractor: Arc<BagOfWords>, device: &Device) -> Self {
        Self {
            params: ParamStore::new(config.seed, device),
            config,
            extractor,
            device: device.clone(),
            layers: None,
        }
    }

    fn project(layers: &[Linear], x: &Tensor) -> RerankResult<Tensor> {
        let mut h = x.clone();
        for layer in layers {
            h = layer.forward(&h).and_then(|t| t.tanh()).map_err(map_candle)?;
        }
        Ok(h)
    }
}

impl Reranker for Dssm {
    fn name(&self) -> &'static str {
        "dssm"
    }

    fn build(&mut self) -> RerankResult<()> {
        if self.layers.is_some() {
            return Ok(());
        }
        if !self.extractor.is_built() {
            return Err(extractor_not_built("dssm"));
        }

        let mut in_dim = self.extractor.vocab_size()?;
        let mut layers = Vec::with_capacity(self.config.nhiddens.len());
        for (i, width) in self.config.nhiddens.iter().enumerate() {
            layers.push(self.params.linear(&format!("hidden{}", i), in_dim, *width, true)?);
            in_dim = *width;
        }
        info!(params = self.params.num_elements(), layers = layers.len(), "Built dssm");
        self.layers = Some(layers);
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.layers.is_some()
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
        let layers = self.layers.as_ref().ok_or_else(|| reranker_not_built("dssm"))?;
        let q = Self::project(layers, batch.feature(QUERY)?)?;
        let d = Self::project(layers, batch.feature(slot.feature())?)?;

        let (q, d) = match self.config.similarity {
            Similarity::Cosine => (l2_normalize(&q)?, l2_normalize(&d)?),
            Similarity::Dot => (q, d),
        };
        q.mul(&d).and_then(|t| t.sum(D::Minus1)).map_err(map_candle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BagOfWordsConfig;
    use crate::testutil;

    #[test]
    fn test_cosine_scores_are_bounded() {
        let ext = testutil::bagofwords(BagOfWordsConfig::default());
        let mut model = Dssm::new(
            DssmConfig {
                nhiddens: vec![16, 8],
                ..Default::default()
            },
            ext.clone(),
            &Device::Cpu,
        );
        model.build().unwrap();
        assert_eq!(model.params().len(), 4);

        let batch = testutil::pair_batch(ext.as_ref());
        let scores = model.score(&batch).unwrap();
        for s in [scores.pos, scores.neg] {
            let v = s.to_vec1::<f32>().unwrap();
            assert_eq!(v.len(), 1);
            assert!(v[0].abs() <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn test_dot_similarity() {
        let ext = testutil::bagofwords(BagOfWordsConfig::default());
        let mut model = Dssm::new(
            DssmConfig {
                similarity: Similarity::Dot,
                ..Default::default()
            },
            ext.clone(),
            &Device::Cpu,
        );
        model.build().unwrap();
        let batch = testutil::pair_batch(ext.as_ref());
        assert!(model.test(&batch).unwrap()[0].is_finite());
    }

    #[test]
    fn test_build_requires_built_extractor() {
        let ext = testutil::unbuilt_bagofwords(BagOfWordsConfig::default());
        let mut model = Dssm::new(DssmConfig::default(), ext, &Device::Cpu);
        assert!(model.build().is_err());
        assert!(!model.is_built());
    }
}
