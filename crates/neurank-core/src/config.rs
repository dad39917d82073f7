//! Configuration for the reranking pipeline.
//!
//! `RerankConfig` is the root struct aggregating one section per component.
//! Every section enumerates its recognized options with defaults and is
//! validated before use.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use neurank_core::RerankConfig;
//!
//! let config = RerankConfig::from_file("pacrr.toml")?.with_env_overrides();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! device = "cpu"
//! seed = 123
//!
//! [tokenizer]
//! name = "analyzer"
//! keepstops = true
//!
//! [extractor]
//! name = "embedtext"
//! maxqlen = 4
//! maxdoclen = 800
//! calcidf = true
//!
//! [reranker]
//! name = "pacrr"
//! mingram = 1
//! maxgram = 3
//!
//! [trainer]
//! batch = 32
//! niters = 20
//! itersize = 512
//!
//! [cache]
//! root = "./cache"
//! ```
//!
//! # Design Principles
//!
//! - **FAIL FAST**: invalid values return `ConfigError`, never silently clamp
//! - **SECTION PREFIXES**: root validation reports `[section] message`

use std::env;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{RerankError, RerankResult};

// ============================================================================
// TOKENIZER CONFIG
// ============================================================================

/// Stemming applied by the analyzer tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StemmerKind {
    /// No stemming.
    #[default]
    None,
    /// Snowball English (Porter2).
    Porter,
}

impl StemmerKind {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Porter => "porter",
        }
    }
}

/// Tokenizer selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum TokenizerConfig {
    /// Lucene-style analyzer.
    #[serde(alias = "anserini")]
    Analyzer {
        #[serde(default = "default_true")]
        keepstops: bool,
        #[serde(default)]
        stemmer: StemmerKind,
    },
    /// Pretrained `tokenizer.json` vocabulary.
    #[serde(alias = "berttokenizer")]
    Pretrained { path: PathBuf },
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self::Analyzer {
            keepstops: true,
            stemmer: StemmerKind::None,
        }
    }
}

impl TokenizerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        if let Self::Pretrained { path } = self {
            if path.as_os_str().is_empty() {
                return Err(RerankError::config("pretrained tokenizer path cannot be empty"));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// EXTRACTOR CONFIG
// ============================================================================

/// Options for the embedding-based extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedTextConfig {
    /// Name of the pretrained embedding set (part of the cache key).
    pub embeddings: String,
    /// Optional GloVe-format text file with the vectors.
    pub embedding_path: Option<PathBuf>,
    /// Vector width used when no file is given.
    pub embedding_dim: usize,
    /// Use a zero vector for tokens without a pretrained vector.
    pub zerounk: bool,
    /// Produce `query_idf` features.
    pub calcidf: bool,
    /// Fixed query length.
    pub maxqlen: usize,
    /// Fixed document length.
    pub maxdoclen: usize,
    /// Consult and populate the feature cache.
    pub usecache: bool,
}

impl Default for EmbedTextConfig {
    fn default() -> Self {
        Self {
            embeddings: "glove6b".to_string(),
            embedding_path: None,
            embedding_dim: 50,
            zerounk: false,
            calcidf: true,
            maxqlen: 4,
            maxdoclen: 800,
            usecache: false,
        }
    }
}

impl EmbedTextConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        validate_lengths(self.maxqlen, self.maxdoclen)?;
        if self.embeddings.is_empty() {
            return Err(RerankError::config("embeddings name cannot be empty"));
        }
        if self.embedding_path.is_none() && self.embedding_dim == 0 {
            return Err(RerankError::config(
                "embedding_dim must be > 0 when no embedding_path is given",
            ));
        }
        Ok(())
    }
}

/// Term units counted by the bag-of-words extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BowMode {
    /// Single tokens.
    #[default]
    Unigram,
    /// Single tokens plus adjacent token pairs.
    #[serde(alias = "unigram+bigram")]
    UnigramBigram,
}

impl BowMode {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unigram => "unigram",
            Self::UnigramBigram => "unigrambigram",
        }
    }
}

/// Options for the bag-of-words extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BagOfWordsConfig {
    /// Unigram or unigram+bigram features.
    pub datamode: BowMode,
    /// Number of query tokens counted.
    pub maxqlen: usize,
    /// Number of document tokens counted.
    pub maxdoclen: usize,
    /// Consult and populate the feature cache.
    pub usecache: bool,
}

impl Default for BagOfWordsConfig {
    fn default() -> Self {
        Self {
            datamode: BowMode::Unigram,
            maxqlen: 4,
            maxdoclen: 800,
            usecache: false,
        }
    }
}

impl BagOfWordsConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        validate_lengths(self.maxqlen, self.maxdoclen)
    }
}

fn validate_lengths(maxqlen: usize, maxdoclen: usize) -> RerankResult<()> {
    if maxqlen == 0 {
        return Err(RerankError::config("maxqlen must be > 0"));
    }
    if maxdoclen == 0 {
        return Err(RerankError::config("maxdoclen must be > 0"));
    }
    Ok(())
}

/// Extractor selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ExtractorConfig {
    /// Token ids + embedding matrix + IDF.
    EmbedText(EmbedTextConfig),
    /// Count vectors over a vocabulary.
    BagOfWords(BagOfWordsConfig),
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self::EmbedText(EmbedTextConfig::default())
    }
}

impl ExtractorConfig {
    /// Validate the selected variant.
    pub fn validate(&self) -> RerankResult<()> {
        match self {
            Self::EmbedText(c) => c.validate(),
            Self::BagOfWords(c) => c.validate(),
        }
    }

    /// Fixed query length.
    pub fn maxqlen(&self) -> usize {
        match self {
            Self::EmbedText(c) => c.maxqlen,
            Self::BagOfWords(c) => c.maxqlen,
        }
    }

    /// Fixed document length.
    pub fn maxdoclen(&self) -> usize {
        match self {
            Self::EmbedText(c) => c.maxdoclen,
            Self::BagOfWords(c) => c.maxdoclen,
        }
    }
}

// ============================================================================
// RERANKER CONFIG
// ============================================================================

/// Activation used by the PACRR combining layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Nonlinearity {
    /// max(0, x)
    #[default]
    Relu,
    /// tanh(x)
    Tanh,
}

/// PACRR options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacrrConfig {
    /// Smallest convolution size.
    pub mingram: usize,
    /// Largest convolution size.
    pub maxgram: usize,
    /// Filters per convolution size.
    pub nfilters: usize,
    /// Append the softmax-normalized query IDF as a feature.
    pub idf: bool,
    /// Values kept per query row by k-max pooling.
    pub kmax: usize,
    /// Width of the combining layers.
    pub combine: usize,
    /// Combining activation.
    pub nonlinearity: Nonlinearity,
    /// Parameter initialization seed.
    pub seed: u64,
}

impl Default for PacrrConfig {
    fn default() -> Self {
        Self {
            mingram: 1,
            maxgram: 3,
            nfilters: 32,
            idf: true,
            kmax: 2,
            combine: 32,
            nonlinearity: Nonlinearity::Relu,
            seed: 123,
        }
    }
}

impl PacrrConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        if self.mingram == 0 || self.mingram > self.maxgram {
            return Err(RerankError::config(format!(
                "need 0 < mingram <= maxgram, got mingram={} maxgram={}",
                self.mingram, self.maxgram
            )));
        }
        if self.nfilters == 0 || self.kmax == 0 || self.combine == 0 {
            return Err(RerankError::config("nfilters, kmax and combine must be > 0"));
        }
        Ok(())
    }
}

/// Similarity used by DSSM between projected vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    /// Cosine similarity.
    #[default]
    Cosine,
    /// Dot product.
    Dot,
}

/// DSSM options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DssmConfig {
    /// Hidden layer widths.
    pub nhiddens: Vec<usize>,
    /// Score between projected query and document.
    pub similarity: Similarity,
    /// Parameter initialization seed.
    pub seed: u64,
}

impl Default for DssmConfig {
    fn default() -> Self {
        Self {
            nhiddens: vec![56],
            similarity: Similarity::Cosine,
            seed: 123,
        }
    }
}

impl DssmConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        if self.nhiddens.is_empty() || self.nhiddens.contains(&0) {
            return Err(RerankError::config("nhiddens must be a non-empty list of positive widths"));
        }
        Ok(())
    }
}

/// TK options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TkConfig {
    /// Learn kernel means and widths.
    pub gradkernels: bool,
    /// Apply tanh to the final score.
    pub scoretanh: bool,
    /// Single dense layer over log-sum kernel features.
    pub singlefc: bool,
    /// Attention width (split across heads).
    pub projdim: usize,
    /// Feed-forward hidden width.
    pub ffdim: usize,
    /// Number of transformer blocks.
    pub numlayers: usize,
    /// Attention heads per block.
    pub numattheads: usize,
    /// Initial mixer weight of the raw embeddings.
    pub alpha: f64,
    /// Mask padding positions inside attention.
    pub usemask: bool,
    /// Mix contextual and raw embeddings.
    pub usemixer: bool,
    /// Train the embedding matrix.
    pub finetune: bool,
    /// Parameter initialization seed.
    pub seed: u64,
}

impl Default for TkConfig {
    fn default() -> Self {
        Self {
            gradkernels: true,
            scoretanh: false,
            singlefc: true,
            projdim: 32,
            ffdim: 100,
            numlayers: 2,
            numattheads: 4,
            alpha: 0.5,
            usemask: false,
            usemixer: true,
            finetune: false,
            seed: 123,
        }
    }
}

impl TkConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        if self.numattheads == 0 || self.projdim == 0 || self.projdim % self.numattheads != 0 {
            return Err(RerankError::config(format!(
                "projdim ({}) must be a positive multiple of numattheads ({})",
                self.projdim, self.numattheads
            )));
        }
        if self.ffdim == 0 {
            return Err(RerankError::config("ffdim must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(RerankError::config(format!("alpha must be in [0, 1], got {}", self.alpha)));
        }
        Ok(())
    }
}

/// Reranker selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum RerankerConfig {
    /// Interaction matrix + convolutional pooling.
    Pacrr(PacrrConfig),
    /// Bag-of-words projection.
    Dssm(DssmConfig),
    /// Transformer kernel.
    Tk(TkConfig),
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self::Pacrr(PacrrConfig::default())
    }
}

impl RerankerConfig {
    /// Validate the selected variant.
    pub fn validate(&self) -> RerankResult<()> {
        match self {
            Self::Pacrr(c) => c.validate(),
            Self::Dssm(c) => c.validate(),
            Self::Tk(c) => c.validate(),
        }
    }

    /// Variant name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pacrr(_) => "pacrr",
            Self::Dssm(_) => "dssm",
            Self::Tk(_) => "tk",
        }
    }
}

// ============================================================================
// TRAINER CONFIG
// ============================================================================

/// Learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Fixed learning rate.
    #[default]
    Constant,
    /// Linear warmup followed by cosine decay.
    WarmupCosine,
}

/// Trainer options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Samples per minibatch.
    pub batch: usize,
    /// Training iterations.
    pub niters: usize,
    /// Samples consumed per iteration.
    pub itersize: usize,
    /// Minibatches accumulated per optimizer step.
    pub gradacc: usize,
    /// Base learning rate.
    pub lr: f64,
    /// Pairwise softmax loss instead of margin ranking loss.
    pub softmaxloss: bool,
    /// Margin of the ranking loss.
    pub margin: f64,
    /// Resume from the latest checkpoint when present.
    pub fastforward: bool,
    /// Validate every N iterations.
    pub validatefreq: usize,
    /// Sampling seed.
    pub seed: u64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// Global gradient norm limit.
    pub max_grad_norm: Option<f64>,
    /// Learning-rate schedule.
    pub schedule: LrSchedule,
    /// Warmup share of all steps (for `warmup_cosine`).
    pub warmup_fraction: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch: 32,
            niters: 20,
            itersize: 512,
            gradacc: 1,
            lr: 0.001,
            softmaxloss: true,
            margin: 1.0,
            fastforward: false,
            validatefreq: 1,
            seed: 42,
            weight_decay: 0.0,
            max_grad_norm: None,
            schedule: LrSchedule::Constant,
            warmup_fraction: 0.1,
        }
    }
}

impl TrainerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        if self.batch == 0 || self.niters == 0 || self.itersize == 0 {
            return Err(RerankError::config("batch, niters and itersize must be > 0"));
        }
        if self.gradacc == 0 {
            return Err(RerankError::config("gradacc must be > 0"));
        }
        if self.validatefreq == 0 {
            return Err(RerankError::config("validatefreq must be > 0"));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(RerankError::config(format!("lr must be positive, got {}", self.lr)));
        }
        if self.weight_decay < 0.0 {
            return Err(RerankError::config("weight_decay cannot be negative"));
        }
        if let Some(norm) = self.max_grad_norm {
            if norm <= 0.0 {
                return Err(RerankError::config("max_grad_norm must be > 0"));
            }
        }
        if !(0.0..1.0).contains(&self.warmup_fraction) {
            return Err(RerankError::config("warmup_fraction must be in [0, 1)"));
        }
        Ok(())
    }

    /// Minibatches per iteration.
    pub fn batches_per_iter(&self) -> usize {
        self.itersize.div_ceil(self.batch)
    }

    /// Optimizer steps over the whole run (for schedules).
    pub fn total_steps(&self) -> usize {
        self.niters * self.batches_per_iter().div_ceil(self.gradacc)
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Feature cache options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the on-disk cache.
    pub root: PathBuf,
    /// Global switch; extractors also need `usecache`.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cache"),
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> RerankResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(RerankError::config("cache root cannot be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// ROOT CONFIG
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankConfig {
    /// `cpu`, `cuda` or `cuda:N`.
    #[serde(default = "default_device")]
    pub device: String,

    /// Seed of the extractor's unknown-token vector.
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub reranker: RerankerConfig,

    #[serde(default)]
    pub trainer: TrainerConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_seed() -> u64 {
    123
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            seed: default_seed(),
            tokenizer: TokenizerConfig::default(),
            extractor: ExtractorConfig::default(),
            reranker: RerankerConfig::default(),
            trainer: TrainerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl RerankConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `RerankError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> RerankResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| RerankError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        toml::from_str(&contents).map_err(|e| RerankError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> RerankResult<Self> {
        toml::from_str(toml).map_err(|e| RerankError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> RerankResult<String> {
        toml::to_string_pretty(self).map_err(|e| RerankError::SerializationError {
            message: format!("Failed to serialize config: {}", e),
        })
    }

    /// Validate every section, returning the first error.
    pub fn validate(&self) -> RerankResult<()> {
        self.device()?;

        self.tokenizer.validate().map_err(|e| RerankError::ConfigError {
            message: format!("[tokenizer] {}", e),
        })?;
        self.extractor.validate().map_err(|e| RerankError::ConfigError {
            message: format!("[extractor] {}", e),
        })?;
        self.reranker.validate().map_err(|e| RerankError::ConfigError {
            message: format!("[reranker] {}", e),
        })?;
        self.trainer.validate().map_err(|e| RerankError::ConfigError {
            message: format!("[trainer] {}", e),
        })?;
        self.cache.validate().map_err(|e| RerankError::ConfigError {
            message: format!("[cache] {}", e),
        })?;

        match (&self.extractor, &self.reranker) {
            (ExtractorConfig::BagOfWords(_), RerankerConfig::Dssm(_)) => Ok(()),
            (ExtractorConfig::EmbedText(_), RerankerConfig::Pacrr(_) | RerankerConfig::Tk(_)) => {
                Ok(())
            }
            (extractor, reranker) => Err(RerankError::ConfigError {
                message: format!(
                    "reranker '{}' cannot consume features of extractor '{}'",
                    reranker.name(),
                    match extractor {
                        ExtractorConfig::EmbedText(_) => "embedtext",
                        ExtractorConfig::BagOfWords(_) => "bagofwords",
                    }
                ),
            }),
        }
    }

    /// Resolve the configured device.
    pub fn device(&self) -> RerankResult<Device> {
        parse_device(&self.device)
    }

    /// Apply environment variable overrides. Prefix: `NEURANK_`
    ///
    /// | Variable | Config Path | Type |
    /// |----------|-------------|------|
    /// | `NEURANK_DEVICE` | `device` | String |
    /// | `NEURANK_CACHE_DIR` | `cache.root` | Path |
    /// | `NEURANK_CACHE_ENABLED` | `cache.enabled` | bool |
    /// | `NEURANK_TRAINER_NITERS` | `trainer.niters` | usize |
    /// | `NEURANK_TRAINER_BATCH` | `trainer.batch` | usize |
    /// | `NEURANK_TRAINER_LR` | `trainer.lr` | f64 |
    /// | `NEURANK_SEED` | `seed` | u64 |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("NEURANK_DEVICE") {
            self.device = val;
        }
        if let Ok(val) = env::var("NEURANK_CACHE_DIR") {
            self.cache.root = PathBuf::from(val);
        }
        if let Ok(val) = env::var("NEURANK_CACHE_ENABLED") {
            self.cache.enabled = val.to_lowercase() == "true" || val == "1";
        }
        if let Ok(val) = env::var("NEURANK_TRAINER_NITERS") {
            if let Ok(n) = val.parse::<usize>() {
                self.trainer.niters = n;
            }
        }
        if let Ok(val) = env::var("NEURANK_TRAINER_BATCH") {
            if let Ok(n) = val.parse::<usize>() {
                self.trainer.batch = n;
            }
        }
        if let Ok(val) = env::var("NEURANK_TRAINER_LR") {
            if let Ok(lr) = val.parse::<f64>() {
                self.trainer.lr = lr;
            }
        }
        if let Ok(val) = env::var("NEURANK_SEED") {
            if let Ok(seed) = val.parse::<u64>() {
                self.seed = seed;
            }
        }
        self
    }
}

/// Parse `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(spec: &str) -> RerankResult<Device> {
    let spec = spec.trim().to_lowercase();
    if spec == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match spec.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .strip_prefix(':')
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| RerankError::config(format!("invalid device '{}'", spec)))?,
        None => return Err(RerankError::config(format!("invalid device '{}'", spec))),
    };
    Device::new_cuda(ordinal).map_err(|e| RerankError::ConfigError {
        message: format!("CUDA device {} unavailable: {}", ordinal, e),
    })
}
