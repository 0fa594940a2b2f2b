//! Withdrawal Anomaly Pipeline Library
//!
//! Batch detection of anomalous cash-withdrawal behavior: accounts are
//! described by trailing-window withdrawal features, clustered into
//! behavioral cohorts, and each cohort gets its own isolation forest.
//! New accounts are scored against the model of the cohort they resolve to.

pub mod cohort;
pub mod config;
pub mod error;
pub mod feature_extractor;
pub mod metrics;
pub mod models;
pub mod partitioner;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod trainer;
pub mod types;

pub use config::AppConfig;
pub use error::{PipelineError, Result};
pub use feature_extractor::FeatureExtractor;
pub use models::inference::CohortScorer;
pub use partitioner::{Partition, Partitioner};
pub use pipeline::{Pipeline, TrainingSummary};
pub use store::{ArtifactKey, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use types::{AccountFeatureVector, AnomalyLabel, ScoringResult, TransactionRecord};
