//! Tokenizer adapters.
//!
//! Two backends sit behind the [`Tokenizer`] trait:
//!
//! - [`AnalyzerTokenizer`]: Lucene-style analyzer. Lowercases, strips
//!   combining marks, splits on non-alphanumerics, optionally removes the
//!   Lucene English stopword set and applies Snowball (Porter2) stemming.
//! - [`HfTokenizer`]: word-piece/BPE vocabularies loaded through the
//!   `tokenizers` crate (e.g. a BERT `tokenizer.json`).
//!
//! Both are deterministic for a given configuration, and expose a
//! fingerprint that becomes part of every feature cache key.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rust_stemmers::{Algorithm, Stemmer};
use unicode_normalization::UnicodeNormalization;

use crate::config::{StemmerKind, TokenizerConfig};
use crate::error::{RerankError, RerankResult};

/// Lucene's default English stopword set (sorted for binary search).
const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Text to token sequence conversion.
pub trait Tokenizer: Send + Sync {
    /// Backend name.
    fn name(&self) -> &'static str;

    /// Stable description of the configuration, used in cache keys.
    fn fingerprint(&self) -> String;

    /// Tokenize one text. Empty text yields an empty sequence.
    fn tokenize(&self, text: &str) -> RerankResult<Vec<String>>;

    /// Tokenize several texts.
    fn tokenize_many(&self, texts: &[&str]) -> RerankResult<Vec<Vec<String>>> {
        texts.iter().map(|t| self.tokenize(t)).collect()
    }

    /// Vocabulary id of a token, for backends that own a vocabulary.
    fn token_to_id(&self, _token: &str) -> Option<u32> {
        None
    }

    /// Token for a vocabulary id, for backends that own a vocabulary.
    fn id_to_token(&self, _id: u32) -> Option<String> {
        None
    }
}

/// Build a tokenizer from its configuration section.
pub fn tokenizer_from_config(config: &TokenizerConfig) -> RerankResult<Arc<dyn Tokenizer>> {
    match config {
        TokenizerConfig::Analyzer { keepstops, stemmer } => {
            Ok(Arc::new(AnalyzerTokenizer::new(*keepstops, *stemmer)))
        }
        TokenizerConfig::Pretrained { path } => Ok(Arc::new(HfTokenizer::from_file(path)?)),
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

/// Lucene-style analyzer tokenizer.
#[derive(Debug, Clone)]
pub struct AnalyzerTokenizer {
    keepstops: bool,
    stemmer: StemmerKind,
}

impl Default for AnalyzerTokenizer {
    fn default() -> Self {
        Self::new(true, StemmerKind::None)
    }
}

impl AnalyzerTokenizer {
    /// Create an analyzer.
    pub fn new(keepstops: bool, stemmer: StemmerKind) -> Self {
        Self { keepstops, stemmer }
    }

    fn is_stop_word(word: &str) -> bool {
        ENGLISH_STOP_WORDS.binary_search(&word).is_ok()
    }

    fn algorithm(&self) -> Option<Algorithm> {
        match self.stemmer {
            StemmerKind::None => None,
            StemmerKind::Porter => Some(Algorithm::English),
        }
    }
}

impl Tokenizer for AnalyzerTokenizer {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    fn fingerprint(&self) -> String {
        format!(
            "analyzer:keepstops={}:stemmer={}",
            self.keepstops,
            self.stemmer.as_str()
        )
    }

    fn tokenize(&self, text: &str) -> RerankResult<Vec<String>> {
        let normalized: String = text
            .to_lowercase()
            .nfkd()
            .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
            .collect();

        let tokens = normalized
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .filter(|s| self.keepstops || !Self::is_stop_word(s));

        let stemmed = match self.algorithm() {
            Some(algorithm) => {
                let stemmer = Stemmer::create(algorithm);
                tokens.map(|t| stemmer.stem(t).into_owned()).collect()
            }
            None => tokens.map(str::to_string).collect(),
        };
        Ok(stemmed)
    }
}

// ============================================================================
// PRETRAINED VOCABULARY
// ============================================================================

/// Tokenizer backed by a `tokenizers` vocabulary file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    path: PathBuf,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> RerankResult<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| RerankError::ConfigError {
            message: format!("Failed to load tokenizer '{}': {}", path.display(), e),
        })?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }
}

impl Tokenizer for HfTokenizer {
    fn name(&self) -> &'static str {
        "pretrained"
    }

    fn fingerprint(&self) -> String {
        format!(
            "pretrained:{}:vocab={}",
            self.path.display(),
            self.inner.get_vocab_size(true)
        )
    }

    fn tokenize(&self, text: &str) -> RerankResult<Vec<String>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RerankError::SerializationError {
                message: format!("Tokenization failed: {}", e),
            })?;
        Ok(encoding.get_tokens().to_vec())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopword_list_sorted() {
        let mut sorted = ENGLISH_STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, ENGLISH_STOP_WORDS);
    }

    #[test]
    fn test_analyzer_keeps_stops() {
        let tok = AnalyzerTokenizer::new(true, StemmerKind::None);
        let tokens = tok.tokenize("The Dummy doc, about Agricultural subsidies!").unwrap();
        assert_eq!(
            tokens,
            vec!["the", "dummy", "doc", "about", "agricultural", "subsidies"]
        );
    }

    #[test]
    fn test_analyzer_removes_stops_and_stems() {
        let tok = AnalyzerTokenizer::new(false, StemmerKind::Porter);
        let tokens = tok.tokenize("the running of the dogs").unwrap();
        assert_eq!(tokens, vec!["run", "dog"]);
    }

    #[test]
    fn test_analyzer_strips_accents() {
        let tok = AnalyzerTokenizer::default();
        assert_eq!(tok.tokenize("Café").unwrap(), vec!["cafe"]);
    }

    #[test]
    fn test_empty_text() {
        let tok = AnalyzerTokenizer::default();
        assert!(tok.tokenize("").unwrap().is_empty());
        assert!(tok.tokenize(" ,;. ").unwrap().is_empty());
    }

    #[test]
    fn test_fingerprint_reflects_config() {
        let a = AnalyzerTokenizer::new(true, StemmerKind::None);
        let b = AnalyzerTokenizer::new(false, StemmerKind::None);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert!(a.token_to_id("x").is_none());
    }

    #[test]
    fn test_tokenize_many() {
        let tok = AnalyzerTokenizer::default();
        let out = tok.tokenize_many(&["a b", "c"]).unwrap();
        assert_eq!(out, vec![vec!["a", "b"], vec!["c"]]);
    }
}
