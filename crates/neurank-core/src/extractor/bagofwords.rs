//! Bag-of-words extractor: term count vectors over the build vocabulary.

use tracing::info;

use super::{
    CacheSlot, CreateOutcome, Extractor, ExtractorDeps, FeatureMap, FeatureVec, Manifest,
    TokenMaps, Vocabulary, DOCID2TOKS, MANIFEST, NEGDOC, POSDOC, QID2TOKS, QUERY, VOCAB,
};
use crate::benchmark::Topics;
use crate::config::{BagOfWordsConfig, BowMode};
use crate::error::{RerankError, RerankResult};

/// Extractor producing dense count vectors of vocabulary length.
pub struct BagOfWords {
    config: BagOfWordsConfig,
    deps: ExtractorDeps,
    state: Option<Built>,
}

struct Built {
    vocab: Vocabulary,
    tokens: TokenMaps,
}

impl BagOfWords {
    pub fn new(config: BagOfWordsConfig, deps: ExtractorDeps) -> Self {
        Self {
            config,
            deps,
            state: None,
        }
    }

    pub fn config(&self) -> &BagOfWordsConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> String {
        format!(
            "bagofwords|tokenizer={}|datamode={}",
            self.deps.tokenizer.fingerprint(),
            self.config.datamode.as_str()
        )
    }

    fn built(&self) -> RerankResult<&Built> {
        self.state.as_ref().ok_or_else(|| RerankError::NotBuilt {
            component: "bagofwords",
            message: "call create() before extracting features".to_string(),
        })
    }

    pub fn vocab(&self) -> RerankResult<&Vocabulary> {
        Ok(&self.built()?.vocab)
    }

    /// Length of every feature vector.
    pub fn vocab_size(&self) -> RerankResult<usize> {
        Ok(self.vocab()?.len())
    }

    /// Unigrams, followed by space-joined bigrams in `unigrambigram` mode.
    fn terms(&self, tokens: &[String]) -> Vec<String> {
        let mut terms = tokens.to_vec();
        if self.config.datamode == BowMode::UnigramBigram {
            terms.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));
        }
        terms
    }

    fn counts(&self, vocab: &Vocabulary, tokens: &[String], len: usize) -> Vec<f32> {
        let mut counts = vec![0.0f32; vocab.len()];
        let window = &tokens[..len.min(tokens.len())];
        for term in self.terms(window) {
            counts[vocab.id(&term) as usize] += 1.0;
        }
        counts
    }
}

impl Extractor for BagOfWords {
    fn name(&self) -> &'static str {
        "bagofwords"
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
                let built = Built {
                    vocab: slot.require_json(VOCAB)?,
                    tokens: TokenMaps {
                        qid2toks: slot.require_json(QID2TOKS)?,
                        docid2toks: slot.require_json(DOCID2TOKS)?,
                    },
                };
                info!(key = %slot.key, vocab_size = built.vocab.len(), "Loaded bagofwords features from cache");
                self.state = Some(built);
                return Ok(CreateOutcome::LoadedFromCache);
            }
        }

        let tokens = TokenMaps::build(qids, docids, topics, &self.deps)?;
        let mut vocab = Vocabulary::new();
        for seq in tokens.in_vocab_order() {
            for term in self.terms(seq) {
                vocab.add(&term)?;
            }
        }
        vocab.freeze();

        if let Some(slot) = &slot {
            slot.put_json(VOCAB, &vocab)?;
            slot.put_json(QID2TOKS, &tokens.qid2toks)?;
            slot.put_json(DOCID2TOKS, &tokens.docid2toks)?;
            slot.put_json(
                MANIFEST,
                &Manifest {
                    extractor: self.name().to_string(),
                    fingerprint: fingerprint.clone(),
                    num_qids: tokens.qid2toks.len(),
                    num_docids: tokens.docid2toks.len(),
                    vocab_size: vocab.len(),
                },
            )?;
        }

        info!(
            datamode = self.config.datamode.as_str(),
            vocab_size = vocab.len(),
            "Built bagofwords features"
        );
        self.state = Some(Built { vocab, tokens });
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
        let mut map = FeatureMap::new(qid, posdocid, negdocid, label);

        map.insert(
            QUERY,
            FeatureVec::Dense(self.counts(&built.vocab, built.tokens.query(qid)?, self.config.maxqlen)),
        );
        map.insert(
            POSDOC,
            FeatureVec::Dense(self.counts(
                &built.vocab,
                built.tokens.doc(posdocid)?,
                self.config.maxdoclen,
            )),
        );
        if let Some(negdocid) = negdocid {
            map.insert(
                NEGDOC,
                FeatureVec::Dense(self.counts(
                    &built.vocab,
                    built.tokens.doc(negdocid)?,
                    self.config.maxdoclen,
                )),
            );
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
