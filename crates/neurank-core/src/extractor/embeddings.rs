//! Pretrained word vectors.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::info;

use crate::config::EmbedTextConfig;
use crate::error::{RerankError, RerankResult};

/// Source of pretrained token vectors.
pub trait PretrainedEmbeddings: Send + Sync {
    /// Vector width.
    fn dim(&self) -> usize;

    /// Vector of a token, if known.
    fn lookup(&self, token: &str) -> Option<&[f32]>;

    /// Stable identity of the vector set, used in cache keys.
    fn fingerprint(&self) -> String;
}

/// Vectors held in a hash map.
#[derive(Debug, Clone)]
pub struct StaticEmbeddings {
    name: String,
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl StaticEmbeddings {
    /// Set without any vectors; every token falls back to the unknown row.
    pub fn empty(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
            vectors: HashMap::new(),
        }
    }

    /// Add or replace a vector.
    ///
    /// # Errors
    /// - `RerankError::FeatureShape` if the width differs from `dim`
    pub fn insert(&mut self, token: impl Into<String>, vector: Vec<f32>) -> RerankResult<()> {
        let token = token.into();
        if vector.len() != self.dim {
            return Err(RerankError::FeatureShape {
                feature: format!("embedding '{}'", token),
                message: format!("expected width {}, got {}", self.dim, vector.len()),
            });
        }
        self.vectors.insert(token, vector);
        Ok(())
    }

    /// Load GloVe text format: `token v1 v2 ... vd` per line.
    ///
    /// The width is taken from the first line; later lines must agree.
    pub fn from_glove_file(name: impl Into<String>, path: impl AsRef<Path>) -> RerankResult<Self> {
        let path = path.as_ref();
        let source_name = path.display().to_string();
        let reader = BufReader::new(std::fs::File::open(path)?);

        let mut embeddings: Option<Self> = None;
        let name = name.into();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(token) = parts.next() else {
                continue;
            };
            let vector = parts
                .map(str::parse::<f32>)
                .collect::<Result<Vec<f32>, _>>()
                .map_err(|e| RerankError::ParseError {
                    source_name: source_name.clone(),
                    line: lineno + 1,
                    message: e.to_string(),
                })?;

            let set = embeddings.get_or_insert_with(|| Self::empty(name.clone(), vector.len()));
            set.insert(token, vector).map_err(|e| RerankError::ParseError {
                source_name: source_name.clone(),
                line: lineno + 1,
                message: e.to_string(),
            })?;
        }

        let embeddings = embeddings.ok_or_else(|| RerankError::ParseError {
            source_name: source_name.clone(),
            line: 0,
            message: "no vectors found".to_string(),
        })?;
        info!(path = %source_name, vectors = embeddings.len(), dim = embeddings.dim, "Loaded embeddings");
        Ok(embeddings)
    }

    /// Vectors named in an extractor config: the file when given, else an empty set.
    pub fn from_config(config: &EmbedTextConfig) -> RerankResult<Self> {
        match &config.embedding_path {
            Some(path) => Self::from_glove_file(&config.embeddings, path),
            None => Ok(Self::empty(&config.embeddings, config.embedding_dim)),
        }
    }

    /// Number of vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl PretrainedEmbeddings for StaticEmbeddings {
    fn dim(&self) -> usize {
        self.dim
    }

    fn lookup(&self, token: &str) -> Option<&[f32]> {
        self.vectors.get(token).map(Vec::as_slice)
    }

    fn fingerprint(&self) -> String {
        format!("{}:dim={}:n={}", self.name, self.dim, self.vectors.len())
    }
}
