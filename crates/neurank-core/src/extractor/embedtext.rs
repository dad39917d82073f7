//! Embedding-based extractor: token ids, embedding matrix and query IDF.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::info;

use super::{
    pad_ids, CacheSlot, CreateOutcome, Extractor, ExtractorDeps, FeatureMap, FeatureVec, Manifest,
    PretrainedEmbeddings, TokenMaps, Vocabulary, DOCID2TOKS, MANIFEST, NEGDOC, POSDOC, QID2TOKS,
    QUERY, QUERY_IDF, UNK_ID, VOCAB,
};
use crate::benchmark::Topics;
use crate::config::EmbedTextConfig;
use crate::error::{RerankError, RerankResult};
use crate::tensorio::{self, NamedArray};

const EMBEDDING_MATRIX: &str = "embedding-matrix";
const IDF: &str = "idf";
const MATRIX_TENSOR: &str = "embedding";
const UNK_STD: f64 = 0.5;

/// Extractor producing token-id windows over a frozen vocabulary.
pub struct EmbedText {
    config: EmbedTextConfig,
    deps: ExtractorDeps,
    embeddings: Arc<dyn PretrainedEmbeddings>,
    seed: u64,
    state: Option<Built>,
}

struct Built {
    vocab: Vocabulary,
    tokens: TokenMaps,
    matrix: Vec<f32>,
    dim: usize,
    idf: HashMap<String, f32>,
}

impl EmbedText {
    pub fn new(
        config: EmbedTextConfig,
        deps: ExtractorDeps,
        embeddings: Arc<dyn PretrainedEmbeddings>,
        seed: u64,
    ) -> Self {
        Self {
            config,
            deps,
            embeddings,
            seed,
            state: None,
        }
    }

    pub fn config(&self) -> &EmbedTextConfig {
        &self.config
    }

    /// Everything the cached artifacts depend on besides the id sets.
    pub fn fingerprint(&self) -> String {
        format!(
            "embedtext|tokenizer={}|embeddings={}|zerounk={}|calcidf={}|seed={}",
            self.deps.tokenizer.fingerprint(),
            self.embeddings.fingerprint(),
            self.config.zerounk,
            self.config.calcidf,
            self.seed
        )
    }

    fn built(&self) -> RerankResult<&Built> {
        self.state.as_ref().ok_or_else(|| RerankError::NotBuilt {
            component: "embedtext",
            message: "call create() before extracting features".to_string(),
        })
    }

    /// Frozen vocabulary.
    pub fn vocab(&self) -> RerankResult<&Vocabulary> {
        Ok(&self.built()?.vocab)
    }

    /// Embedding width.
    pub fn embedding_dim(&self) -> usize {
        self.state
            .as_ref()
            .map(|s| s.dim)
            .unwrap_or_else(|| self.embeddings.dim())
    }

    /// Row-major `[vocab_size, dim]` embedding matrix.
    pub fn embedding_matrix(&self) -> RerankResult<&[f32]> {
        Ok(&self.built()?.matrix)
    }

    /// Embedding matrix as a tensor on `device`.
    pub fn embedding_tensor(&self, device: &Device) -> RerankResult<Tensor> {
        let built = self.built()?;
        Tensor::from_slice(&built.matrix, (built.vocab.len(), built.dim), device).map_err(map_candle)
    }

    /// IDF of a query term, 0 for terms outside the queries.
    pub fn idf(&self, term: &str) -> RerankResult<f32> {
        Ok(self.built()?.idf.get(term).copied().unwrap_or(0.0))
    }

    fn build_matrix(&self, vocab: &Vocabulary) -> RerankResult<Vec<f32>> {
        let dim = self.embeddings.dim();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let normal = Normal::new(0.0, UNK_STD).map_err(|e| RerankError::config(e.to_string()))?;
        let unk: Vec<f32> = (0..dim).map(|_| normal.sample(&mut rng) as f32).collect();

        let mut matrix = vec![0.0f32; vocab.len() * dim];
        matrix[UNK_ID as usize * dim..(UNK_ID as usize + 1) * dim].copy_from_slice(&unk);

        let mut missing = 0usize;
        for (id, token) in vocab.tokens().iter().enumerate().skip(UNK_ID as usize + 1) {
            let row = &mut matrix[id * dim..(id + 1) * dim];
            match self.embeddings.lookup(token) {
                Some(vector) => row.copy_from_slice(vector),
                None => {
                    missing += 1;
                    if !self.config.zerounk {
                        row.copy_from_slice(&unk);
                    }
                }
            }
        }
        info!(
            vocab_size = vocab.len(),
            dim, missing, "Built embedding matrix"
        );
        Ok(matrix)
    }

    fn build_idf(&self, tokens: &TokenMaps) -> HashMap<String, f32> {
        if !self.config.calcidf {
            return HashMap::new();
        }
        let n = self.deps.index.num_docs() as f64;
        let mut idf = HashMap::new();
        for term in tokens.qid2toks.values().flatten() {
            idf.entry(term.clone()).or_insert_with(|| {
                let df = self.deps.index.document_frequency(term) as f64;
                (1.0 + (n - df + 0.5) / (df + 0.5)).ln() as f32
            });
        }
        idf
    }

    fn load(&self, slot: &CacheSlot<'_>) -> RerankResult<Built> {
        let vocab: Vocabulary = slot.require_json(VOCAB)?;
        let tokens = TokenMaps {
            qid2toks: slot.require_json(QID2TOKS)?,
            docid2toks: slot.require_json(DOCID2TOKS)?,
        };
        let idf: HashMap<String, f32> = slot.require_json(IDF)?;

        let mut arrays = tensorio::decode(&slot.get_bytes(EMBEDDING_MATRIX)?)?;
        let matrix = arrays.remove(MATRIX_TENSOR).ok_or_else(|| RerankError::CacheError {
            message: format!("embedding matrix artifact of {} is empty", slot.key),
        })?;
        let dim = matrix.shape.get(1).copied().unwrap_or(0);
        if matrix.shape.first().copied() != Some(vocab.len()) || dim != self.embeddings.dim() {
            return Err(RerankError::CacheMismatch {
                artifact: format!("{}/{}", slot.key, EMBEDDING_MATRIX),
                cached: format!("{:?}", matrix.shape),
                requested: format!("[{}, {}]", vocab.len(), self.embeddings.dim()),
            });
        }
        Ok(Built {
            vocab,
            tokens,
            matrix: matrix.data,
            dim,
            idf,
        })
    }

    fn store(&self, slot: &CacheSlot<'_>, built: &Built) -> RerankResult<()> {
        slot.put_json(VOCAB, &built.vocab)?;
        slot.put_json(QID2TOKS, &built.tokens.qid2toks)?;
        slot.put_json(DOCID2TOKS, &built.tokens.docid2toks)?;
        slot.put_json(IDF, &built.idf)?;

        let mut arrays = BTreeMap::new();
        arrays.insert(
            MATRIX_TENSOR.to_string(),
            NamedArray::new(vec![built.vocab.len(), built.dim], built.matrix.clone()),
        );
        slot.cache.put(&slot.key, EMBEDDING_MATRIX, &tensorio::encode(&arrays)?)?;

        slot.put_json(
            MANIFEST,
            &Manifest {
                extractor: self.name().to_string(),
                fingerprint: self.fingerprint(),
                num_qids: built.tokens.qid2toks.len(),
                num_docids: built.tokens.docid2toks.len(),
                vocab_size: built.vocab.len(),
            },
        )
    }
}

impl Extractor for EmbedText {
    fn name(&self) -> &'static str {
        "embedtext"
    }

    fn create(
        &mut self,
        qids: &[String],
        docids: &[String],
        topics: &Topics,
    ) -> RerankResult<CreateOutcome> {
        let fingerprint = self.fingerprint();
        let slot = CacheSlot::open(
            &self.deps,
            self.config.usecache,
            self.name(),
            &fingerprint,
            qids,
            docids,
        );

        if let Some(slot) = &slot {
            if slot.manifest(&fingerprint)?.is_some() {
                let built = self.load(slot)?;
                info!(key = %slot.key, vocab_size = built.vocab.len(), "Loaded embedtext features from cache");
                self.state = Some(built);
                return Ok(CreateOutcome::LoadedFromCache);
            }
        }

        let tokens = TokenMaps::build(qids, docids, topics, &self.deps)?;
        let mut vocab = Vocabulary::new();
        for seq in tokens.in_vocab_order() {
            vocab.extend(seq.iter().map(String::as_str))?;
        }
        vocab.freeze();

        let built = Built {
            matrix: self.build_matrix(&vocab)?,
            idf: self.build_idf(&tokens),
            dim: self.embeddings.dim(),
            vocab,
            tokens,
        };

        if let Some(slot) = &slot {
            self.store(slot, &built)?;
        }
        info!(
            qids = built.tokens.qid2toks.len(),
            docids = built.tokens.docid2toks.len(),
            vocab_size = built.vocab.len(),
            "Built embedtext features"
        );
        self.state = Some(built);
        Ok(CreateOutcome::Built)
    }

    fn id2vec(
        &self,
        qid: &str,
        posdocid: &str,
        negdocid: Option<&str>,
        label: Option<f32>,
    ) -> RerankResult<FeatureMap> {
        let built = self.built()?;
        let maxqlen = self.config.maxqlen;
        let maxdoclen = self.config.maxdoclen;

        let mut map = FeatureMap::new(qid, posdocid, negdocid, label);
        let query = built.tokens.query(qid)?;
        map.insert(QUERY, FeatureVec::Ids(pad_ids(query, &built.vocab, maxqlen)));
        map.insert(
            POSDOC,
            FeatureVec::Ids(pad_ids(built.tokens.doc(posdocid)?, &built.vocab, maxdoclen)),
        );
        if let Some(negdocid) = negdocid {
            map.insert(
                NEGDOC,
                FeatureVec::Ids(pad_ids(built.tokens.doc(negdocid)?, &built.vocab, maxdoclen)),
            );
        }
        if self.config.calcidf {
            let mut idf: Vec<f32> = query
                .iter()
                .take(maxqlen)
                .map(|t| built.idf.get(t).copied().unwrap_or(0.0))
                .collect();
            idf.resize(maxqlen, 0.0);
            map.insert(QUERY_IDF, FeatureVec::Dense(idf));
        }
        Ok(map)
    }

    fn is_built(&self) -> bool {
        self.state.is_some()
    }

    fn maxqlen(&self) -> usize {
        self.config.maxqlen
    }

    fn maxdoclen(&self) -> usize {
        self.config.maxdoclen
    }
}

/// Map candle errors to RerankError.
fn map_candle(e: candle_core::Error) -> RerankError {
    RerankError::TensorError {
        message: format!("Embedding matrix error: {}", e),
    }
}
