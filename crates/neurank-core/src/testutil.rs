//! Toy collection shared by unit tests.

use std::sync::Arc;

use candle_core::Device;

use crate::batch::{collate, Batch};
use crate::benchmark::Topics;
use crate::config::{BagOfWordsConfig, EmbedTextConfig};
use crate::extractor::{BagOfWords, EmbedText, Extractor, ExtractorDeps, StaticEmbeddings};
use crate::index::InMemoryIndex;
use crate::tokenizer::AnalyzerTokenizer;

pub const QID: &str = "301";
pub const DOC1: &str = "LA010189-0001";
pub const DOC2: &str = "LA010189-0002";

pub fn topics() -> Topics {
    let mut topics = Topics::new();
    topics.insert(QID.to_string(), "dummy doc".to_string());
    topics
}

pub fn deps() -> ExtractorDeps {
    let tokenizer = Arc::new(AnalyzerTokenizer::default());
    let index = InMemoryIndex::build(
        vec![
            (DOC1, "Dummy Dummy Dummy Hello world, greetings from outer space!"),
            (DOC2, "Dummy LessDummy Hello world, greetings from outer space!"),
        ],
        tokenizer.as_ref(),
    )
    .unwrap();
    ExtractorDeps {
        tokenizer,
        index: Arc::new(index),
        cache: None,
    }
}

/// Deterministic 8-d vectors for most toy terms; "lessdummy" stays unknown.
pub fn embeddings() -> StaticEmbeddings {
    let mut emb = StaticEmbeddings::empty("toy", 8);
    let terms = ["dummy", "doc", "hello", "world", "greetings", "from", "outer", "space"];
    for (i, term) in terms.iter().enumerate() {
        let vector = (0..8)
            .map(|j| if j == i { 1.0 } else { 0.1 * ((i + j) % 3) as f32 })
            .collect();
        emb.insert(*term, vector).unwrap();
    }
    emb
}

fn ids() -> (Vec<String>, Vec<String>) {
    (vec![QID.to_string()], vec![DOC1.to_string(), DOC2.to_string()])
}

pub fn unbuilt_embedtext(config: EmbedTextConfig) -> Arc<EmbedText> {
    Arc::new(EmbedText::new(config, deps(), Arc::new(embeddings()), 123))
}

pub fn embedtext(config: EmbedTextConfig) -> Arc<EmbedText> {
    let mut ext = EmbedText::new(config, deps(), Arc::new(embeddings()), 123);
    let (qids, docids) = ids();
    ext.create(&qids, &docids, &topics()).unwrap();
    Arc::new(ext)
}

pub fn unbuilt_bagofwords(config: BagOfWordsConfig) -> Arc<BagOfWords> {
    Arc::new(BagOfWords::new(config, deps()))
}

pub fn bagofwords(config: BagOfWordsConfig) -> Arc<BagOfWords> {
    let mut ext = BagOfWords::new(config, deps());
    let (qids, docids) = ids();
    ext.create(&qids, &docids, &topics()).unwrap();
    Arc::new(ext)
}

/// One training pair: DOC1 positive, DOC2 negative.
pub fn pair_batch(ext: &dyn Extractor) -> Batch {
    let sample = ext.id2vec(QID, DOC1, Some(DOC2), None).unwrap();
    collate(&[sample], &Device::Cpu).unwrap()
}
