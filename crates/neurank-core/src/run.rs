//! TREC run files.
//!
//! A [`Run`] maps each qid to its documents ordered by descending score,
//! ties broken by ascending docid. Written as `qid Q0 docid rank score tag`.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use crate::error::{RerankError, RerankResult};

/// Ranked documents per query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Run {
    rankings: BTreeMap<String, Vec<(String, f64)>>,
}

impl Run {
    /// Empty run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the score of a document.
    pub fn insert(&mut self, qid: impl Into<String>, docid: impl Into<String>, score: f64) {
        self.extend_scores(std::iter::once((qid.into(), docid.into(), score)));
    }

    /// Add or replace many `(qid, docid, score)` entries, re-ranking each
    /// touched query once. Later duplicates win.
    pub fn extend_scores<Q, D>(&mut self, scores: impl IntoIterator<Item = (Q, D, f64)>)
    where
        Q: Into<String>,
        D: Into<String>,
    {
        let mut grouped: BTreeMap<String, HashMap<String, f64>> = BTreeMap::new();
        for (qid, docid, score) in scores {
            grouped.entry(qid.into()).or_default().insert(docid.into(), score);
        }
        for (qid, mut docs) in grouped {
            let ranking = self.rankings.entry(qid).or_default();
            for entry in ranking.iter_mut() {
                if let Some(score) = docs.remove(&entry.0) {
                    entry.1 = score;
                }
            }
            ranking.extend(docs);
            sort_ranking(ranking);
        }
    }

    /// Ranked `(docid, score)` list of a query.
    pub fn ranking(&self, qid: &str) -> Option<&[(String, f64)]> {
        self.rankings.get(qid).map(Vec::as_slice)
    }

    /// qids in sorted order.
    pub fn qids(&self) -> impl Iterator<Item = &str> {
        self.rankings.keys().map(String::as_str)
    }

    /// Iterate `(qid, ranking)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[(String, f64)])> {
        self.rankings.iter().map(|(q, d)| (q.as_str(), d.as_slice()))
    }

    /// Number of queries.
    pub fn len(&self) -> usize {
        self.rankings.len()
    }

    /// Whether the run has no queries.
    pub fn is_empty(&self) -> bool {
        self.rankings.is_empty()
    }

    /// Ranked docids for the given qids, cut to `depth` per query.
    ///
    /// qids absent from the run are skipped.
    pub fn candidates<'a>(
        &self,
        qids: impl IntoIterator<Item = &'a str>,
        depth: Option<usize>,
    ) -> BTreeMap<String, Vec<String>> {
        qids.into_iter()
            .filter_map(|qid| {
                self.rankings.get(qid).map(|docs| {
                    let limit = depth.unwrap_or(docs.len());
                    let ids = docs.iter().take(limit).map(|(d, _)| d.clone()).collect();
                    (qid.to_string(), ids)
                })
            })
            .collect()
    }

    /// Render in TREC format.
    pub fn to_trec_string(&self, tag: &str) -> String {
        let mut out = String::new();
        for (qid, docs) in &self.rankings {
            for (rank, (docid, score)) in docs.iter().enumerate() {
                out.push_str(&format!("{} Q0 {} {} {} {}\n", qid, docid, rank + 1, score, tag));
            }
        }
        out
    }

    /// Write a TREC run file, publishing it atomically.
    pub fn write_trec(&self, path: impl AsRef<Path>, tag: &str) -> RerankResult<()> {
        let path = path.as_ref();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(self.to_trec_string(tag).as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| RerankError::IoError(e.error))?;
        Ok(())
    }

    /// Parse TREC run text.
    pub fn parse_trec(text: &str, source_name: &str) -> RerankResult<Self> {
        let mut run = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return Err(RerankError::ParseError {
                    source_name: source_name.to_string(),
                    line: lineno + 1,
                    message: format!("expected at least 5 fields, found {}", fields.len()),
                });
            }
            let score = fields[4].parse::<f64>().map_err(|e| RerankError::ParseError {
                source_name: source_name.to_string(),
                line: lineno + 1,
                message: format!("invalid score '{}': {}", fields[4], e),
            })?;
            run.rankings
                .entry(fields[0].to_string())
                .or_default()
                .push((fields[2].to_string(), score));
        }
        for docs in run.rankings.values_mut() {
            sort_ranking(docs);
        }
        Ok(run)
    }

    /// Read a TREC run file.
    pub fn read_trec(path: impl AsRef<Path>) -> RerankResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::parse_trec(&text, &path.display().to_string())
    }
}

fn sort_ranking(docs: &mut [(String, f64)]) {
    docs.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}
