//! Neural document re-ranking: feature extraction, rerankers and training.
//!
//! # Architecture
//!
//! - **Extractor**: turns (qid, docid) keys into fixed-shape features, with a
//!   content-addressed [`cache::FeatureCache`] in front of every build
//! - **Reranker**: PACRR, DSSM and TK models over candle tensors
//! - **Dataset**: graded pair sampling for training, rank-ordered pairs for prediction
//! - **Trainer**: AdamW minibatch training, validation, `best`/`latest`
//!   checkpoints and fastforward resume
//!
//! External collaborators sit behind narrow traits ([`index::DocumentIndex`],
//! [`tokenizer::Tokenizer`], [`extractor::PretrainedEmbeddings`]) with small
//! in-memory implementations.
//!
//! # Example
//!
//! ```rust
//! use neurank_core::config::RerankConfig;
//! use neurank_core::metrics::Metric;
//!
//! let config = RerankConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.reranker.name(), "pacrr");
//! assert_eq!("ndcg_cut_20".parse::<Metric>().unwrap(), Metric::NdcgCut(20));
//! ```

pub mod batch;
pub mod benchmark;
pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod extractor;
pub mod index;
pub mod metrics;
pub mod pipeline;
pub mod reranker;
pub mod run;
pub mod tensorio;
pub mod tokenizer;
pub mod trainer;

#[cfg(test)]
pub(crate) mod testutil;

pub use batch::{collate, Batch};
pub use benchmark::{Benchmark, Fold, Qrels, Topics};
pub use config::RerankConfig;
pub use dataset::{PredDataset, PredPair, TrainDataset, TrainPair};
pub use error::{IdKind, RerankError, RerankResult};
pub use extractor::{AnyExtractor, CreateOutcome, Extractor, ExtractorHandle, FeatureMap};
pub use metrics::Metric;
pub use pipeline::Components;
pub use reranker::{create_reranker, Reranker};
pub use run::Run;
pub use trainer::{Trainer, TrainingSummary};
