//! Feature extraction: raw text to fixed-shape model inputs.
//!
//! An extractor is built once for an explicit set of qids and docids
//! ([`Extractor::create`]); afterwards [`Extractor::id2vec`] turns a sample
//! key into a [`FeatureMap`] whose vectors always have the configured
//! lengths. Builds are cached under a key derived from the configuration and
//! the id sets, so a second `create` with the same inputs loads instead of
//! recomputing.
//!
//! # Flavors
//!
//! | Extractor | Features | Consumers |
//! |-----------|----------|-----------|
//! | [`EmbedText`] | `query`, `posdoc`, `negdoc` ids; `query_idf` | PACRR, TK |
//! | [`BagOfWords`] | `query`, `posdoc`, `negdoc` count vectors | DSSM |

mod bagofwords;
mod embeddings;
mod embedtext;
mod vocab;

pub use bagofwords::BagOfWords;
pub use embeddings::{PretrainedEmbeddings, StaticEmbeddings};
pub use embedtext::EmbedText;
pub use vocab::{Vocabulary, PAD_ID, PAD_TOKEN, UNK_ID, UNK_TOKEN};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::benchmark::Topics;
use crate::cache::{CacheKey, FeatureCache};
use crate::config::ExtractorConfig;
use crate::error::{IdKind, RerankError, RerankResult};
use crate::index::DocumentIndex;
use crate::tokenizer::Tokenizer;

/// Feature name of the query vector.
pub const QUERY: &str = "query";
/// Feature name of the positive (or only) document vector.
pub const POSDOC: &str = "posdoc";
/// Feature name of the negative document vector.
pub const NEGDOC: &str = "negdoc";
/// Feature name of the per-position query IDF.
pub const QUERY_IDF: &str = "query_idf";

// ============================================================================
// FEATURES
// ============================================================================

/// One named feature vector.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureVec {
    /// Vocabulary ids.
    Ids(Vec<u32>),
    /// Real values.
    Dense(Vec<f32>),
}

impl FeatureVec {
    pub fn len(&self) -> usize {
        match self {
            FeatureVec::Ids(v) => v.len(),
            FeatureVec::Dense(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Features of one sample plus its identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    pub qid: String,
    pub posdocid: String,
    pub negdocid: Option<String>,
    pub label: Option<f32>,
    pub features: BTreeMap<String, FeatureVec>,
}

impl FeatureMap {
    fn new(qid: &str, posdocid: &str, negdocid: Option<&str>, label: Option<f32>) -> Self {
        Self {
            qid: qid.to_string(),
            posdocid: posdocid.to_string(),
            negdocid: negdocid.map(str::to_string),
            label,
            features: BTreeMap::new(),
        }
    }

    /// Feature by name.
    pub fn get(&self, name: &str) -> Option<&FeatureVec> {
        self.features.get(name)
    }

    fn insert(&mut self, name: &str, value: FeatureVec) {
        self.features.insert(name.to_string(), value);
    }
}

/// How `create` obtained its artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Computed from the index and published to the cache (if enabled).
    Built,
    /// Loaded from an existing cache entry.
    LoadedFromCache,
}

// ============================================================================
// EXTRACTOR TRAIT
// ============================================================================

/// Turns (qid, docid) keys into fixed-shape features.
pub trait Extractor: Send + Sync {
    /// Flavor name, also the cache namespace.
    fn name(&self) -> &'static str;

    /// Build vocabulary and backing data for exactly these ids.
    ///
    /// # Errors
    /// - `UnknownId` for a qid missing from `topics`
    /// - `DocumentNotFound` for a docid missing from the index
    /// - `EmptyTokenization` for text that tokenizes to nothing
    /// - `CacheMismatch` if the cached manifest disagrees with the configuration
    fn create(
        &mut self,
        qids: &[String],
        docids: &[String],
        topics: &Topics,
    ) -> RerankResult<CreateOutcome>;

    /// Features of one sample. `negdocid` is absent for prediction.
    ///
    /// # Errors
    /// - `NotBuilt` before `create`
    /// - `UnknownId` for ids outside the `create` call
    fn id2vec(
        &self,
        qid: &str,
        posdocid: &str,
        negdocid: Option<&str>,
        label: Option<f32>,
    ) -> RerankResult<FeatureMap>;

    fn is_built(&self) -> bool;

    fn maxqlen(&self) -> usize;

    fn maxdoclen(&self) -> usize;
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Collaborators injected into every extractor.
#[derive(Clone)]
pub struct ExtractorDeps {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub index: Arc<dyn DocumentIndex>,
    /// `None` disables caching regardless of `usecache`.
    pub cache: Option<Arc<dyn FeatureCache>>,
}

/// Closed set of extractors, before `create`.
pub enum AnyExtractor {
    EmbedText(EmbedText),
    BagOfWords(BagOfWords),
}

impl AnyExtractor {
    /// Construct the configured extractor.
    ///
    /// `embeddings` is required by `embedtext`; `seed` drives the unknown-token vector.
    pub fn from_config(
        config: &ExtractorConfig,
        deps: ExtractorDeps,
        embeddings: Option<Arc<dyn PretrainedEmbeddings>>,
        seed: u64,
    ) -> RerankResult<Self> {
        config.validate()?;
        match config {
            ExtractorConfig::EmbedText(c) => {
                let embeddings = match embeddings {
                    Some(e) => e,
                    None => Arc::new(StaticEmbeddings::from_config(c)?),
                };
                Ok(Self::EmbedText(EmbedText::new(c.clone(), deps, embeddings, seed)))
            }
            ExtractorConfig::BagOfWords(c) => Ok(Self::BagOfWords(BagOfWords::new(c.clone(), deps))),
        }
    }

    /// Borrow as a trait object.
    pub fn as_extractor_mut(&mut self) -> &mut dyn Extractor {
        match self {
            Self::EmbedText(e) => e,
            Self::BagOfWords(e) => e,
        }
    }

    /// Build the wrapped extractor.
    pub fn create(
        &mut self,
        qids: &[String],
        docids: &[String],
        topics: &Topics,
    ) -> RerankResult<CreateOutcome> {
        self.as_extractor_mut().create(qids, docids, topics)
    }

    /// Freeze a built extractor for sharing.
    ///
    /// # Errors
    /// - `NotBuilt` if `create` has not succeeded
    pub fn into_handle(self) -> RerankResult<ExtractorHandle> {
        let built = match &self {
            Self::EmbedText(e) => e.is_built(),
            Self::BagOfWords(e) => e.is_built(),
        };
        if !built {
            return Err(RerankError::NotBuilt {
                component: "extractor",
                message: "call create() before sharing the extractor".to_string(),
            });
        }
        Ok(match self {
            Self::EmbedText(e) => ExtractorHandle::EmbedText(Arc::new(e)),
            Self::BagOfWords(e) => ExtractorHandle::BagOfWords(Arc::new(e)),
        })
    }
}

/// Built, shared extractor.
#[derive(Clone)]
pub enum ExtractorHandle {
    EmbedText(Arc<EmbedText>),
    BagOfWords(Arc<BagOfWords>),
}

impl ExtractorHandle {
    pub fn as_extractor(&self) -> &dyn Extractor {
        match self {
            Self::EmbedText(e) => e.as_ref(),
            Self::BagOfWords(e) => e.as_ref(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.as_extractor().name()
    }

    /// See [`Extractor::id2vec`].
    pub fn id2vec(
        &self,
        qid: &str,
        posdocid: &str,
        negdocid: Option<&str>,
        label: Option<f32>,
    ) -> RerankResult<FeatureMap> {
        self.as_extractor().id2vec(qid, posdocid, negdocid, label)
    }
}

// ============================================================================
// SHARED BUILD STEPS
// ============================================================================

/// Full token sequences of the declared ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TokenMaps {
    pub qid2toks: BTreeMap<String, Vec<String>>,
    pub docid2toks: BTreeMap<String, Vec<String>>,
}

impl TokenMaps {
    /// Tokenize topics and documents; fails on any unknown or empty id.
    pub fn build(
        qids: &[String],
        docids: &[String],
        topics: &Topics,
        deps: &ExtractorDeps,
    ) -> RerankResult<Self> {
        let mut maps = Self::default();
        for qid in qids {
            if maps.qid2toks.contains_key(qid) {
                continue;
            }
            let text = topics.get(qid).ok_or_else(|| RerankError::UnknownId {
                kind: IdKind::Query,
                id: qid.clone(),
            })?;
            let toks = deps.tokenizer.tokenize(text)?;
            if toks.is_empty() {
                return Err(RerankError::EmptyTokenization {
                    kind: IdKind::Query,
                    id: qid.clone(),
                });
            }
            maps.qid2toks.insert(qid.clone(), toks);
        }
        for docid in docids {
            if maps.docid2toks.contains_key(docid) {
                continue;
            }
            let text = deps.index.get_doc(docid)?;
            let toks = deps.tokenizer.tokenize(&text)?;
            if toks.is_empty() {
                return Err(RerankError::EmptyTokenization {
                    kind: IdKind::Document,
                    id: docid.clone(),
                });
            }
            maps.docid2toks.insert(docid.clone(), toks);
        }
        Ok(maps)
    }

    pub fn query(&self, qid: &str) -> RerankResult<&[String]> {
        self.qid2toks
            .get(qid)
            .map(Vec::as_slice)
            .ok_or_else(|| RerankError::UnknownId {
                kind: IdKind::Query,
                id: qid.to_string(),
            })
    }

    pub fn doc(&self, docid: &str) -> RerankResult<&[String]> {
        self.docid2toks
            .get(docid)
            .map(Vec::as_slice)
            .ok_or_else(|| RerankError::UnknownId {
                kind: IdKind::Document,
                id: docid.to_string(),
            })
    }

    /// Term sequences in vocabulary order: sorted qids, then sorted docids.
    pub fn in_vocab_order(&self) -> impl Iterator<Item = &[String]> {
        self.qid2toks
            .values()
            .chain(self.docid2toks.values())
            .map(Vec::as_slice)
    }
}

/// Summary written last to a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub extractor: String,
    pub fingerprint: String,
    pub num_qids: usize,
    pub num_docids: usize,
    pub vocab_size: usize,
}

pub(crate) const MANIFEST: &str = "manifest";
pub(crate) const VOCAB: &str = "vocab";
pub(crate) const QID2TOKS: &str = "qid2toks";
pub(crate) const DOCID2TOKS: &str = "docid2toks";

/// Cache handle bound to one key.
pub(crate) struct CacheSlot<'a> {
    pub cache: &'a dyn FeatureCache,
    pub key: CacheKey,
}

impl<'a> CacheSlot<'a> {
    /// Slot for this build, or `None` when caching is off.
    pub fn open(
        deps: &'a ExtractorDeps,
        usecache: bool,
        name: &str,
        fingerprint: &str,
        qids: &[String],
        docids: &[String],
    ) -> Option<Self> {
        if !usecache {
            return None;
        }
        let cache = deps.cache.as_deref()?;
        let key = CacheKey::compute(
            name,
            fingerprint,
            qids.iter().map(String::as_str),
            docids.iter().map(String::as_str),
        );
        Some(Self { cache, key })
    }

    /// Read the manifest and check it against the requested fingerprint.
    pub fn manifest(&self, fingerprint: &str) -> RerankResult<Option<Manifest>> {
        let Some(manifest) = self.get_json::<Manifest>(MANIFEST)? else {
            return Ok(None);
        };
        if manifest.fingerprint != fingerprint {
            return Err(RerankError::CacheMismatch {
                artifact: format!("{}/{}", self.key, MANIFEST),
                cached: manifest.fingerprint,
                requested: fingerprint.to_string(),
            });
        }
        Ok(Some(manifest))
    }

    pub fn get_bytes(&self, artifact: &str) -> RerankResult<Vec<u8>> {
        self.cache.get(&self.key, artifact)?.ok_or_else(|| RerankError::CacheError {
            message: format!("entry {} has a manifest but no '{}' artifact", self.key, artifact),
        })
    }

    pub fn get_json<T: DeserializeOwned>(&self, artifact: &str) -> RerankResult<Option<T>> {
        match self.cache.get(&self.key, artifact)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RerankError::CacheError {
                    message: format!("corrupt artifact {}/{}: {}", self.key, artifact, e),
                }),
            None => Ok(None),
        }
    }

    pub fn require_json<T: DeserializeOwned>(&self, artifact: &str) -> RerankResult<T> {
        self.get_json(artifact)?.ok_or_else(|| RerankError::CacheError {
            message: format!("entry {} has a manifest but no '{}' artifact", self.key, artifact),
        })
    }

    pub fn put_json<T: Serialize>(&self, artifact: &str, value: &T) -> RerankResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| RerankError::SerializationError {
            message: format!("Failed to encode {}: {}", artifact, e),
        })?;
        debug!(key = %self.key, artifact, "Caching extractor artifact");
        self.cache.put(&self.key, artifact, &bytes)
    }
}

/// Map tokens to ids, keep the first `len`, pad with [`PAD_ID`].
pub(crate) fn pad_ids(tokens: &[String], vocab: &Vocabulary, len: usize) -> Vec<u32> {
    let mut ids: Vec<u32> = tokens.iter().take(len).map(|t| vocab.id(t)).collect();
    ids.resize(len, PAD_ID);
    ids
}
