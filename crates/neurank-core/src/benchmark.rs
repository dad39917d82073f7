//! Topics, relevance judgments and folds.
//!
//! File formats:
//!
//! - topics: `qid<TAB>query text`, one per line
//! - qrels: TREC format `qid iter docid grade`
//! - folds: JSON object `{"s1": {"train_qids": [...], "dev_qids": [...], "test_qids": [...]}}`

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{IdKind, RerankError, RerankResult};

/// qid → query text.
pub type Topics = BTreeMap<String, String>;

/// Relevance judgments: qid → docid → grade.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Qrels {
    judgments: BTreeMap<String, BTreeMap<String, i32>>,
}

impl Qrels {
    /// Empty judgment set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a judgment, replacing any earlier grade.
    pub fn insert(&mut self, qid: impl Into<String>, docid: impl Into<String>, grade: i32) {
        self.judgments
            .entry(qid.into())
            .or_default()
            .insert(docid.into(), grade);
    }

    /// Grade of a pair, `None` if unjudged.
    pub fn grade(&self, qid: &str, docid: &str) -> Option<i32> {
        self.judgments.get(qid).and_then(|docs| docs.get(docid)).copied()
    }

    /// All judgments of one query.
    pub fn for_query(&self, qid: &str) -> Option<&BTreeMap<String, i32>> {
        self.judgments.get(qid)
    }

    /// Judged qids in sorted order.
    pub fn qids(&self) -> impl Iterator<Item = &str> {
        self.judgments.keys().map(String::as_str)
    }

    /// Number of judged queries.
    pub fn len(&self) -> usize {
        self.judgments.len()
    }

    /// Whether there are no judgments.
    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty()
    }

    /// Parse TREC qrels text.
    pub fn parse_trec(text: &str, source_name: &str) -> RerankResult<Self> {
        let mut qrels = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                return Err(RerankError::ParseError {
                    source_name: source_name.to_string(),
                    line: lineno + 1,
                    message: format!("expected 4 fields, found {}", fields.len()),
                });
            }
            let grade = fields[3].parse::<i32>().map_err(|e| RerankError::ParseError {
                source_name: source_name.to_string(),
                line: lineno + 1,
                message: format!("invalid grade '{}': {}", fields[3], e),
            })?;
            qrels.insert(fields[0], fields[2], grade);
        }
        Ok(qrels)
    }

    /// Load a TREC qrels file.
    pub fn from_trec_file(path: impl AsRef<Path>) -> RerankResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let qrels = Self::parse_trec(&text, &path.display().to_string())?;
        info!(path = %path.display(), queries = qrels.len(), "Loaded qrels");
        Ok(qrels)
    }
}

/// Parse `qid<TAB>text` topics.
pub fn parse_topics_tsv(text: &str, source_name: &str) -> RerankResult<Topics> {
    let mut topics = Topics::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (qid, query) = line.split_once('\t').ok_or_else(|| RerankError::ParseError {
            source_name: source_name.to_string(),
            line: lineno + 1,
            message: "expected 'qid<TAB>text'".to_string(),
        })?;
        topics.insert(qid.trim().to_string(), query.trim().to_string());
    }
    Ok(topics)
}

/// Load a topics TSV file.
pub fn load_topics_tsv(path: impl AsRef<Path>) -> RerankResult<Topics> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    parse_topics_tsv(&text, &path.display().to_string())
}

/// Query split for one cross-validation fold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub train_qids: Vec<String>,
    pub dev_qids: Vec<String>,
    #[serde(default)]
    pub test_qids: Vec<String>,
}

/// Topics, judgments and named folds of one collection.
#[derive(Debug, Clone, Default)]
pub struct Benchmark {
    pub topics: Topics,
    pub qrels: Qrels,
    pub folds: BTreeMap<String, Fold>,
}

impl Benchmark {
    /// Load folds from a JSON file and attach them.
    pub fn with_folds_file(mut self, path: impl AsRef<Path>) -> RerankResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        self.folds = serde_json::from_str(&text).map_err(|e| RerankError::ParseError {
            source_name: path.display().to_string(),
            line: e.line(),
            message: e.to_string(),
        })?;
        Ok(self)
    }

    /// Look up a fold by name.
    pub fn fold(&self, name: &str) -> RerankResult<&Fold> {
        self.folds
            .get(name)
            .ok_or_else(|| RerankError::config(format!("unknown fold '{}'", name)))
    }

    /// Query text by qid.
    pub fn topic(&self, qid: &str) -> RerankResult<&str> {
        self.topics
            .get(qid)
            .map(String::as_str)
            .ok_or_else(|| RerankError::UnknownId {
                kind: IdKind::Query,
                id: qid.to_string(),
            })
    }
}
