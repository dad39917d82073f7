//! Error type for every failure in the reranking pipeline.
//!
//! # Error Categories
//!
//! | Category | Variants | Policy |
//! |----------|----------|--------|
//! | Configuration | ConfigError, NotBuilt, CacheMismatch, FeatureShape | Fatal, surfaced immediately |
//! | Data | UnknownId, DocumentNotFound, EmptyTokenization, EmptyDataset, ParseError | Fatal at extraction time |
//! | Numeric | NumericInstability | Converted to a logged skip by the trainer |
//! | Resource | CacheError, CheckpointError, IoError, SerializationError | Fatal, never retried |
//! | Tensor | TensorError | Fatal |
//!
//! Lower layers (extractor, dataset) raise on invalid input instead of
//! returning sentinel values. The trainer is the only layer that converts a
//! per-step numeric failure into a skip.

use thiserror::Error;

/// Which identifier space an unknown id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// Query identifier.
    Query,
    /// Document identifier.
    Document,
}

impl std::fmt::Display for IdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdKind::Query => write!(f, "qid"),
            IdKind::Document => write!(f, "docid"),
        }
    }
}

/// Error type for the reranking pipeline.
#[derive(Debug, Error)]
pub enum RerankError {
    // === Configuration Errors ===
    /// Invalid option value or incompatible module wiring.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// A component was used before it was built (e.g. scoring before `build()`).
    #[error("{component} used before it was built: {message}")]
    NotBuilt {
        component: &'static str,
        message: String,
    },

    /// A cached artifact was produced under a different configuration.
    #[error("Cache mismatch for {artifact}: cached {cached}, requested {requested}")]
    CacheMismatch {
        artifact: String,
        cached: String,
        requested: String,
    },

    /// Feature vectors in a batch disagree in shape or are missing.
    #[error("Feature shape error for '{feature}': {message}")]
    FeatureShape { feature: String, message: String },

    // === Data Errors ===
    /// Id was not part of the `create` call or the topic set.
    #[error("Unknown {kind}: {id}")]
    UnknownId { kind: IdKind, id: String },

    /// Document missing from the index.
    #[error("Document not found in index: {docid}")]
    DocumentNotFound { docid: String },

    /// Text tokenized to nothing.
    #[error("Empty tokenization for {kind} {id}")]
    EmptyTokenization { kind: IdKind, id: String },

    /// No sample can be produced from the supplied candidates and judgments.
    #[error("Empty dataset: {message}")]
    EmptyDataset { message: String },

    /// A line-oriented input file (qrels, run, topics) is malformed.
    #[error("Parse error in {source_name} line {line}: {message}")]
    ParseError {
        source_name: String,
        line: usize,
        message: String,
    },

    // === Numeric Errors ===
    /// NaN or infinite loss or gradient.
    #[error("Numeric instability at {stage}: {value}")]
    NumericInstability { stage: String, value: f64 },

    // === Resource Errors ===
    /// Feature cache read/write failed.
    #[error("Cache error: {message}")]
    CacheError { message: String },

    /// Checkpoint load/save failed.
    #[error("Checkpoint error: {message}")]
    CheckpointError { message: String },

    /// File I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON/TOML/safetensors encoding failed.
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    // === Tensor Errors ===
    /// Candle operation failed.
    #[error("Tensor error: {message}")]
    TensorError { message: String },
}

impl RerankError {
    /// Shorthand for a [`RerankError::ConfigError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the error belongs to the numeric category.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::NumericInstability { .. })
    }
}

/// Result type alias for reranking operations.
pub type RerankResult<T> = Result<T, RerankError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_unknown_id_message() {
        let err = RerankError::UnknownId {
            kind: IdKind::Document,
            id: "LA010189-0003".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("docid"));
        assert!(msg.contains("LA010189-0003"));
    }

    #[test]
    fn test_io_error_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "weights missing");
        let err: RerankError = io.into();
        assert!(err.to_string().contains("weights missing"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_numeric_category() {
        let err = RerankError::NumericInstability {
            stage: "loss".to_string(),
            value: f64::NAN,
        };
        assert!(err.is_numeric());
        assert!(!RerankError::config("x").is_numeric());
    }

    #[test]
    fn test_not_built_message() {
        let err = RerankError::NotBuilt {
            component: "extractor",
            message: "call create() first".to_string(),
        };
        assert!(err.to_string().starts_with("extractor used before it was built"));
    }
}
