//! Error taxonomy for the withdrawal anomaly pipeline

use crate::types::{AccountId, CohortId};
use thiserror::Error;

/// Errors raised by pipeline components.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Required columns are absent from an input table. Fatal for the run.
    #[error("Schema error in {table}: missing required column(s) {missing:?}")]
    Schema { table: String, missing: Vec<String> },

    /// A row could not be parsed into a typed record.
    #[error("Invalid record in {table}: {reason}")]
    InvalidRecord { table: String, reason: String },

    /// Scoring resolved a cohort that has no persisted model.
    #[error("No model persisted for cohort {cohort_id}")]
    ModelNotFound { cohort_id: CohortId },

    /// Scoring could not place an account in any cohort.
    #[error("Account {account_id} could not be resolved to a cohort")]
    CohortUnresolved { account_id: AccountId },

    /// Reading or writing an artifact failed. Retried before it surfaces.
    #[error("Artifact I/O failed for {key}: {source}")]
    ArtifactIo {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {key}")]
    ArtifactNotFound { key: String },

    /// An artifact exists but its contents cannot be decoded.
    #[error("Malformed artifact {key}: {reason}")]
    ArtifactFormat { key: String, reason: String },

    #[error("Invalid parameter: {name} - {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Cohort {cohort_id} timed out after {timeout_ms} ms")]
    Timeout { cohort_id: CohortId, timeout_ms: u64 },

    /// A per-cohort worker task panicked or was cancelled.
    #[error("Cohort {cohort_id} task failed: {reason}")]
    Task { cohort_id: CohortId, reason: String },
}

impl PipelineError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::ArtifactIo { .. })
    }

    pub(crate) fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::ArtifactIo {
            key: key.into(),
            source,
        }
    }

    pub(crate) fn format(key: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::ArtifactFormat {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for pipeline components.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_display() {
        let error = PipelineError::Schema {
            table: "transactions".to_string(),
            missing: vec!["amount".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "Schema error in transactions: missing required column(s) [\"amount\"]"
        );
    }

    #[test]
    fn test_model_not_found_display() {
        let error = PipelineError::ModelNotFound { cohort_id: 7 };
        assert_eq!(error.to_string(), "No model persisted for cohort 7");
    }

    #[test]
    fn test_only_io_errors_are_transient() {
        let io = PipelineError::io(
            "models/iforest_model_1.json",
            std::io::Error::new(std::io::ErrorKind::Other, "disk busy"),
        );
        assert!(io.is_transient());
        assert!(!PipelineError::ModelNotFound { cohort_id: 1 }.is_transient());
        assert!(!PipelineError::format("partition/partition.json", "bad json").is_transient());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
    }
}
