//! Feature cache behavior across extractor builds.

mod common;

use std::sync::Arc;

use common::{embeddings, DOC1, DOC2, QID};
use neurank_core::cache::{FeatureCache, MemoryCache};
use neurank_core::config::{BagOfWordsConfig, EmbedTextConfig, ExtractorConfig, RerankConfig};
use neurank_core::index::InMemoryIndex;
use neurank_core::{Components, CreateOutcome, Topics};
use tempfile::TempDir;

fn topics() -> Topics {
    let mut t = Topics::new();
    t.insert(QID.to_string(), "dummy doc".to_string());
    t
}

fn components(dir: &TempDir, extractor: ExtractorConfig) -> Components {
    let mut config = RerankConfig {
        extractor,
        ..Default::default()
    };
    if let ExtractorConfig::BagOfWords(_) = config.extractor {
        config.reranker = neurank_core::config::RerankerConfig::Dssm(Default::default());
    }
    config.cache.root = dir.path().to_path_buf();
    Components::from_config(config).unwrap()
}

fn index(components: &Components) -> Arc<InMemoryIndex> {
    Arc::new(
        InMemoryIndex::build(
            vec![
                (DOC1, "Dummy Dummy Dummy Hello world, greetings from outer space!"),
                (DOC2, "Dummy LessDummy Hello world, greetings from outer space!"),
            ],
            components.tokenizer.as_ref(),
        )
        .unwrap(),
    )
}

fn ids() -> (Vec<String>, Vec<String>) {
    (vec![QID.to_string()], vec![DOC1.to_string(), DOC2.to_string()])
}

#[test]
fn test_embedtext_second_create_hits_disk_cache() {
    let dir = TempDir::new().unwrap();
    let config = ExtractorConfig::EmbedText(EmbedTextConfig {
        embedding_dim: 8,
        maxqlen: 4,
        maxdoclen: 10,
        usecache: true,
        ..Default::default()
    });
    let comps = components(&dir, config);
    let (qids, docids) = ids();

    let (first, outcome) = comps
        .extractor(index(&comps), Some(embeddings()), &qids, &docids, &topics())
        .unwrap();
    assert_eq!(outcome, CreateOutcome::Built);

    let (second, outcome) = comps
        .extractor(index(&comps), Some(embeddings()), &qids, &docids, &topics())
        .unwrap();
    assert_eq!(outcome, CreateOutcome::LoadedFromCache);
    assert!(comps.cache.as_ref().unwrap().stats().hits() > 0);

    for doc in [DOC1, DOC2] {
        assert_eq!(
            first.id2vec(QID, doc, None, None).unwrap(),
            second.id2vec(QID, doc, None, None).unwrap()
        );
    }
    assert!(dir.path().join("embedtext").exists());
}

#[test]
fn test_different_ids_use_different_entries() {
    let cache = Arc::new(MemoryCache::new());
    let dir = TempDir::new().unwrap();
    let config = ExtractorConfig::BagOfWords(BagOfWordsConfig {
        usecache: true,
        ..Default::default()
    });
    let comps = components(&dir, config).with_cache(Some(cache.clone() as Arc<dyn FeatureCache>));

    let (qids, docids) = ids();
    let (_, a) = comps
        .extractor(index(&comps), None, &qids, &docids, &topics())
        .unwrap();
    let (_, b) = comps
        .extractor(index(&comps), None, &qids, &docids[..1], &topics())
        .unwrap();
    assert_eq!(a, CreateOutcome::Built);
    assert_eq!(b, CreateOutcome::Built);

    let (_, c) = comps
        .extractor(index(&comps), None, &qids, &docids[..1], &topics())
        .unwrap();
    assert_eq!(c, CreateOutcome::LoadedFromCache);
}

#[test]
fn test_usecache_false_always_builds() {
    let dir = TempDir::new().unwrap();
    let config = ExtractorConfig::BagOfWords(BagOfWordsConfig::default());
    let comps = components(&dir, config);
    let (qids, docids) = ids();
    for _ in 0..2 {
        let (_, outcome) = comps
            .extractor(index(&comps), None, &qids, &docids, &topics())
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Built);
    }
}
