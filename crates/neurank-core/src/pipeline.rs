//! Wiring of configured components.
//!
//! [`Components`] resolves the shared collaborators of a [`RerankConfig`]
//! (tokenizer, feature cache, device) once, then constructs the extractor
//! and reranker in the required order: extractor `create` first, reranker
//! construction second.

use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use crate::benchmark::Topics;
use crate::cache::{DiskCache, FeatureCache};
use crate::config::RerankConfig;
use crate::error::RerankResult;
use crate::extractor::{AnyExtractor, CreateOutcome, ExtractorDeps, ExtractorHandle, PretrainedEmbeddings};
use crate::index::DocumentIndex;
use crate::reranker::{create_reranker, Reranker};
use crate::tokenizer::{tokenizer_from_config, Tokenizer};

/// Collaborators shared by the extractor and the reranker.
#[derive(Clone)]
pub struct Components {
    pub config: RerankConfig,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub cache: Option<Arc<dyn FeatureCache>>,
    pub device: Device,
}

impl Components {
    /// Validate `config` and resolve its collaborators.
    pub fn from_config(config: RerankConfig) -> RerankResult<Self> {
        config.validate()?;
        let tokenizer = tokenizer_from_config(&config.tokenizer)?;
        let cache: Option<Arc<dyn FeatureCache>> = if config.cache.enabled {
            Some(Arc::new(DiskCache::new(config.cache.root.clone())))
        } else {
            None
        };
        let device = config.device()?;
        info!(
            device = %config.device,
            tokenizer = tokenizer.name(),
            cache = config.cache.enabled,
            "Components ready"
        );
        Ok(Self {
            config,
            tokenizer,
            cache,
            device,
        })
    }

    /// Replace the feature cache (e.g. with an in-memory one).
    pub fn with_cache(mut self, cache: Option<Arc<dyn FeatureCache>>) -> Self {
        self.cache = cache;
        self
    }

    /// Construct the configured extractor and build it for exactly these ids.
    pub fn extractor(
        &self,
        index: Arc<dyn DocumentIndex>,
        embeddings: Option<Arc<dyn PretrainedEmbeddings>>,
        qids: &[String],
        docids: &[String],
        topics: &Topics,
    ) -> RerankResult<(ExtractorHandle, CreateOutcome)> {
        let deps = ExtractorDeps {
            tokenizer: self.tokenizer.clone(),
            index,
            cache: self.cache.clone(),
        };
        let mut extractor = AnyExtractor::from_config(&self.config.extractor, deps, embeddings, self.config.seed)?;
        let outcome = extractor.create(qids, docids, topics)?;
        Ok((extractor.into_handle()?, outcome))
    }

    /// Construct and build the configured reranker.
    pub fn reranker(&self, extractor: &ExtractorHandle) -> RerankResult<Box<dyn Reranker>> {
        let mut reranker = create_reranker(&self.config.reranker, extractor, &self.device)?;
        reranker.build()?;
        Ok(reranker)
    }
}
