//! Training and prediction sample streams.
//!
//! Datasets only produce id keys. Features are built per sample through
//! [`Extractor::id2vec`] when a minibatch is assembled.

use std::collections::{BTreeMap, HashSet};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::benchmark::Qrels;
use crate::error::{RerankError, RerankResult};
use crate::extractor::{Extractor, FeatureMap};

/// Key of one training sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainPair {
    pub qid: String,
    pub posdocid: String,
    pub negdocid: String,
}

impl TrainPair {
    pub fn features(&self, extractor: &dyn Extractor) -> RerankResult<FeatureMap> {
        extractor.id2vec(&self.qid, &self.posdocid, Some(&self.negdocid), None)
    }
}

/// Key of one prediction sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredPair {
    pub qid: String,
    pub docid: String,
}

impl PredPair {
    pub fn features(&self, extractor: &dyn Extractor) -> RerankResult<FeatureMap> {
        extractor.id2vec(&self.qid, &self.docid, None, None)
    }
}

// ============================================================================
// TRAINING
// ============================================================================

/// Sampling pool of one query.
#[derive(Debug, Clone)]
struct QueryPool {
    qid: String,
    /// Candidates sorted by docid, with grades (unjudged = 0).
    candidates: Vec<(String, i32)>,
    /// Indices into `candidates` of positives that have at least one lower-graded candidate.
    positives: Vec<usize>,
}

impl QueryPool {
    fn sample(&self, rng: &mut ChaCha8Rng) -> Option<TrainPair> {
        let &pos = self.positives.choose(rng)?;
        let (posdocid, grade) = &self.candidates[pos];
        let negatives: Vec<&String> = self
            .candidates
            .iter()
            .filter(|(_, g)| g < grade)
            .map(|(d, _)| d)
            .collect();
        let negdocid = *negatives.choose(rng)?;
        Some(TrainPair {
            qid: self.qid.clone(),
            posdocid: posdocid.clone(),
            negdocid: negdocid.clone(),
        })
    }
}

/// Graded pairwise sampler over first-stage candidates.
///
/// A positive with grade `g` is paired with a negative drawn uniformly from
/// the candidates graded below `g`. Documents of equal grade are never
/// paired.
#[derive(Debug, Clone)]
pub struct TrainDataset {
    pools: Vec<QueryPool>,
    seed: u64,
}

impl TrainDataset {
    /// Build from qid → ranked candidate docids.
    ///
    /// # Errors
    /// - `EmptyDataset` if no query has a valid pair
    pub fn new(
        candidates: &BTreeMap<String, Vec<String>>,
        qrels: &Qrels,
        seed: u64,
    ) -> RerankResult<Self> {
        let mut pools = Vec::new();
        for (qid, docids) in candidates {
            let mut seen = HashSet::new();
            let mut graded: Vec<(String, i32)> = docids
                .iter()
                .filter(|d| seen.insert(d.as_str()))
                .map(|d| (d.clone(), qrels.grade(qid, d).unwrap_or(0)))
                .collect();
            graded.sort_by(|a, b| a.0.cmp(&b.0));

            let lowest = graded.iter().map(|(_, g)| *g).min();
            let positives: Vec<usize> = graded
                .iter()
                .enumerate()
                .filter(|(_, (_, g))| *g > 0 && lowest.is_some_and(|low| low < *g))
                .map(|(i, _)| i)
                .collect();

            if positives.is_empty() {
                warn!(qid = %qid, candidates = graded.len(), "Skipping query without a valid training pair");
                continue;
            }
            pools.push(QueryPool {
                qid: qid.clone(),
                candidates: graded,
                positives,
            });
        }

        if pools.is_empty() {
            return Err(RerankError::EmptyDataset {
                message: format!(
                    "none of {} training queries has a positive and a lower-graded candidate",
                    candidates.len()
                ),
            });
        }
        debug!(queries = pools.len(), "Training dataset ready");
        Ok(Self { pools, seed })
    }

    /// Queries that take part in sampling.
    pub fn qids(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|p| p.qid.as_str())
    }

    pub fn num_queries(&self) -> usize {
        self.pools.len()
    }

    /// Infinite pair stream from the beginning of the seeded order.
    pub fn pairs(&self) -> PairStream<'_> {
        PairStream {
            pools: &self.pools,
            rng: ChaCha8Rng::seed_from_u64(self.seed),
            order: Vec::new(),
            cursor: 0,
            consumed: 0,
        }
    }

    /// Pair stream positioned after `consumed` samples.
    pub fn pairs_from(&self, consumed: u64) -> PairStream<'_> {
        let mut stream = self.pairs();
        for _ in 0..consumed {
            stream.next();
        }
        stream
    }
}

/// Endless sequence of training pairs.
///
/// Each pass over the queries shuffles their order, then draws one pair per
/// query.
pub struct PairStream<'a> {
    pools: &'a [QueryPool],
    rng: ChaCha8Rng,
    order: Vec<usize>,
    cursor: usize,
    consumed: u64,
}

impl PairStream<'_> {
    /// Samples drawn so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Iterator for PairStream<'_> {
    type Item = TrainPair;

    fn next(&mut self) -> Option<TrainPair> {
        if self.cursor >= self.order.len() {
            self.order = (0..self.pools.len()).collect();
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let pool = self.pools.get(*self.order.get(self.cursor)?)?;
        self.cursor += 1;
        let pair = pool.sample(&mut self.rng)?;
        self.consumed += 1;
        Some(pair)
    }
}

// ============================================================================
// PREDICTION
// ============================================================================

/// Every candidate of every query once, qids sorted, documents in rank order.
#[derive(Debug, Clone, Default)]
pub struct PredDataset {
    pairs: Vec<PredPair>,
}

impl PredDataset {
    pub fn new(candidates: &BTreeMap<String, Vec<String>>) -> Self {
        let mut pairs = Vec::new();
        for (qid, docids) in candidates {
            let mut seen = HashSet::new();
            for docid in docids.iter().filter(|d| seen.insert(d.as_str())) {
                pairs.push(PredPair {
                    qid: qid.clone(),
                    docid: docid.clone(),
                });
            }
        }
        Self { pairs }
    }

    pub fn pairs(&self) -> impl Iterator<Item = &PredPair> {
        self.pairs.iter()
    }

    /// Consecutive chunks of at most `size` pairs.
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = &[PredPair]> {
        self.pairs.chunks(size.max(1))
    }

    /// Docids per qid.
    pub fn candidates(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pair in &self.pairs {
            out.entry(pair.qid.clone()).or_default().push(pair.docid.clone());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
