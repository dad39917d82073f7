//! Document index interface and an in-memory implementation.
//!
//! The extractor only needs raw document text and collection statistics
//! (document frequency, collection size) from the index. [`InMemoryIndex`]
//! computes both from `(docid, text)` pairs using the same tokenizer the
//! extractor uses, so IDF values line up with extracted tokens.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{RerankError, RerankResult};
use crate::tokenizer::Tokenizer;

/// Read access to a document collection.
pub trait DocumentIndex: Send + Sync {
    /// Raw text of a document.
    ///
    /// # Errors
    /// - `RerankError::DocumentNotFound` if the docid is absent
    fn get_doc(&self, docid: &str) -> RerankResult<String>;

    /// Number of documents containing `term`.
    fn document_frequency(&self, term: &str) -> u64;

    /// Number of documents in the collection.
    fn num_docs(&self) -> u64;
}

/// Index held fully in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    docs: HashMap<String, String>,
    df: HashMap<String, u64>,
}

#[derive(Debug, Deserialize)]
struct JsonDoc {
    docid: String,
    text: String,
}

impl InMemoryIndex {
    /// Build from `(docid, text)` pairs. Later duplicates replace earlier ones.
    pub fn build<I, S, T>(docs: I, tokenizer: &dyn Tokenizer) -> RerankResult<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let docs: HashMap<String, String> = docs
            .into_iter()
            .map(|(id, text)| (id.into(), text.into()))
            .collect();

        let mut df: HashMap<String, u64> = HashMap::new();
        for text in docs.values() {
            let unique: HashSet<String> = tokenizer.tokenize(text)?.into_iter().collect();
            for term in unique {
                *df.entry(term).or_insert(0) += 1;
            }
        }

        debug!(num_docs = docs.len(), num_terms = df.len(), "Built in-memory index");
        Ok(Self { docs, df })
    }

    /// Load a JSONL file where each line is `{"docid": ..., "text": ...}`.
    ///
    /// # Errors
    /// - `RerankError::IoError` if the file cannot be read
    /// - `RerankError::ParseError` for a malformed line
    pub fn from_jsonl(path: impl AsRef<Path>, tokenizer: &dyn Tokenizer) -> RerankResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(std::fs::File::open(path)?);

        let mut docs = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: JsonDoc = serde_json::from_str(&line).map_err(|e| RerankError::ParseError {
                source_name: path.display().to_string(),
                line: lineno + 1,
                message: e.to_string(),
            })?;
            docs.push((doc.docid, doc.text));
        }

        let index = Self::build(docs, tokenizer)?;
        info!(path = %path.display(), num_docs = index.docs.len(), "Loaded document collection");
        Ok(index)
    }

    /// Whether a docid is present.
    pub fn contains(&self, docid: &str) -> bool {
        self.docs.contains_key(docid)
    }
}

impl DocumentIndex for InMemoryIndex {
    fn get_doc(&self, docid: &str) -> RerankResult<String> {
        self.docs
            .get(docid)
            .cloned()
            .ok_or_else(|| RerankError::DocumentNotFound {
                docid: docid.to_string(),
            })
    }

    fn document_frequency(&self, term: &str) -> u64 {
        self.df.get(term).copied().unwrap_or(0)
    }

    fn num_docs(&self) -> u64 {
        self.docs.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::AnalyzerTokenizer;
    use std::io::Write;

    fn toy_index() -> InMemoryIndex {
        InMemoryIndex::build(
            vec![
                ("LA010189-0001", "Dummy Dummy Dummy Hello world, greetings from outer space!"),
                ("LA010189-0002", "Dummy LessDummy Hello world, greetings from outer space!"),
            ],
            &AnalyzerTokenizer::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_get_doc() {
        let index = toy_index();
        assert!(index.get_doc("LA010189-0001").unwrap().starts_with("Dummy"));
        assert!(matches!(
            index.get_doc("missing"),
            Err(RerankError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn test_document_frequency_counts_documents_once() {
        let index = toy_index();
        assert_eq!(index.num_docs(), 2);
        assert_eq!(index.document_frequency("dummy"), 2);
        assert_eq!(index.document_frequency("lessdummy"), 1);
        assert_eq!(index.document_frequency("absent"), 0);
    }

    #[test]
    fn test_from_jsonl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"docid": "d1", "text": "alpha beta"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"docid": "d2", "text": "beta gamma"}}"#).unwrap();

        let index = InMemoryIndex::from_jsonl(file.path(), &AnalyzerTokenizer::default()).unwrap();
        assert_eq!(index.num_docs(), 2);
        assert_eq!(index.document_frequency("beta"), 2);
        assert!(index.contains("d2"));
    }

    #[test]
    fn test_from_jsonl_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"docid": "d1", "text": "alpha"}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = InMemoryIndex::from_jsonl(file.path(), &AnalyzerTokenizer::default()).unwrap_err();
        assert!(matches!(err, RerankError::ParseError { line: 2, .. }));
    }
}
