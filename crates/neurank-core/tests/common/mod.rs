//! Shared fixture: two documents, one query, one relevant document.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;
use neurank_core::config::{
    BagOfWordsConfig, EmbedTextConfig, ExtractorConfig, RerankConfig, RerankerConfig, TrainerConfig,
};
use neurank_core::extractor::{PretrainedEmbeddings, StaticEmbeddings};
use neurank_core::index::InMemoryIndex;
use neurank_core::{collate, Batch, Components, ExtractorHandle, PredDataset, Qrels, Topics, TrainDataset};
use tempfile::TempDir;

pub const QID: &str = "301";
pub const DOC1: &str = "LA010189-0001";
pub const DOC2: &str = "LA010189-0002";

pub struct Fixture {
    pub dir: TempDir,
    pub components: Components,
    pub extractor: ExtractorHandle,
    pub topics: Topics,
    pub qrels: Qrels,
    pub candidates: BTreeMap<String, Vec<String>>,
}

impl Fixture {
    pub fn new(reranker: RerankerConfig) -> Self {
        Self::with_config(config_for(reranker))
    }

    pub fn with_config(mut config: RerankConfig) -> Self {
        let dir = TempDir::new().unwrap();
        config.cache.root = dir.path().join("cache");
        let components = Components::from_config(config).unwrap();
        let index = InMemoryIndex::build(
            vec![
                (DOC1, "Dummy Dummy Dummy Hello world, greetings from outer space!"),
                (DOC2, "Dummy LessDummy Hello world, greetings from outer space!"),
            ],
            components.tokenizer.as_ref(),
        )
        .unwrap();

        let mut topics = Topics::new();
        topics.insert(QID.to_string(), "dummy doc".to_string());
        let mut qrels = Qrels::new();
        qrels.insert(QID, DOC1, 1);
        let mut candidates = BTreeMap::new();
        candidates.insert(QID.to_string(), vec![DOC1.to_string(), DOC2.to_string()]);

        let (extractor, _) = components
            .extractor(
                Arc::new(index),
                Some(embeddings()),
                &[QID.to_string()],
                &[DOC1.to_string(), DOC2.to_string()],
                &topics,
            )
            .unwrap();

        Self {
            dir,
            components,
            extractor,
            topics,
            qrels,
            candidates,
        }
    }

    pub fn train_dataset(&self) -> TrainDataset {
        TrainDataset::new(&self.candidates, &self.qrels, self.components.config.trainer.seed).unwrap()
    }

    pub fn dev_dataset(&self) -> PredDataset {
        PredDataset::new(&self.candidates)
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Both documents as prediction samples.
    pub fn pred_batch(&self) -> Batch {
        let samples: Vec<_> = [DOC1, DOC2]
            .iter()
            .map(|d| self.extractor.id2vec(QID, d, None, None).unwrap())
            .collect();
        collate(&samples, &Device::Cpu).unwrap()
    }
}

/// Small-model configuration with the extractor each reranker consumes.
pub fn config_for(reranker: RerankerConfig) -> RerankConfig {
    let extractor = match reranker {
        RerankerConfig::Dssm(_) => ExtractorConfig::BagOfWords(BagOfWordsConfig {
            maxqlen: 4,
            maxdoclen: 12,
            ..Default::default()
        }),
        _ => ExtractorConfig::EmbedText(EmbedTextConfig {
            embedding_dim: 8,
            maxqlen: 4,
            maxdoclen: 12,
            ..Default::default()
        }),
    };
    RerankConfig {
        extractor,
        reranker,
        trainer: TrainerConfig {
            batch: 2,
            itersize: 4,
            niters: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 8-d vectors for the toy vocabulary.
pub fn embeddings() -> Arc<dyn PretrainedEmbeddings> {
    let mut emb = StaticEmbeddings::empty("toy", 8);
    let terms = ["dummy", "doc", "hello", "world", "greetings", "from", "outer", "space"];
    for (i, term) in terms.iter().enumerate() {
        let vector = (0..8)
            .map(|j| if j == i { 1.0 } else { 0.05 * ((i * 3 + j) % 4) as f32 })
            .collect();
        emb.insert(*term, vector).unwrap();
    }
    Arc::new(emb)
}
