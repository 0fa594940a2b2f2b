//! Cohort model and partition persistence

use crate::error::{PipelineError, Result};
use crate::models::isolation_forest::IsolationForest;
use crate::partitioner::Partition;
use crate::store::{get_json, put_json, ArtifactKey, ArtifactStore, RetryPolicy};
use crate::types::CohortId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Isolation forest bound to one cohort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortModel {
    pub cohort_id: CohortId,
    /// Fresh id per training run; models are overwritten, not versioned
    pub model_id: String,
    pub trained_at: DateTime<Utc>,
    pub forest: IsolationForest,
}

impl CohortModel {
    pub fn new(cohort_id: CohortId, forest: IsolationForest) -> Self {
        Self {
            cohort_id,
            model_id: Uuid::new_v4().to_string(),
            trained_at: Utc::now(),
            forest,
        }
    }
}

/// Reads and writes cohort models and the partition through an artifact store
#[derive(Clone)]
pub struct ModelLoader {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
}

impl ModelLoader {
    pub fn new(store: Arc<dyn ArtifactStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn save_model(&self, model: &CohortModel) -> Result<()> {
        let key = ArtifactKey::cohort_model(model.cohort_id);
        put_json(self.store.as_ref(), &self.retry, &key, model)?;
        info!(
            cohort_id = model.cohort_id,
            model_id = %model.model_id,
            trees = model.forest.n_trees(),
            key = %key,
            "Cohort model saved"
        );
        Ok(())
    }

    /// Load the model of `cohort_id`; `ModelNotFound` when none is persisted.
    pub fn load_model(&self, cohort_id: CohortId) -> Result<CohortModel> {
        let key = ArtifactKey::cohort_model(cohort_id);
        let model: CohortModel = get_json(self.store.as_ref(), &self.retry, &key)?
            .ok_or(PipelineError::ModelNotFound { cohort_id })?;

        if model.cohort_id != cohort_id {
            return Err(PipelineError::format(
                key.as_str(),
                format!("model is bound to cohort {}", model.cohort_id),
            ));
        }

        debug!(cohort_id = cohort_id, model_id = %model.model_id, "Cohort model loaded");
        Ok(model)
    }

    pub fn save_partition(&self, partition: &Partition) -> Result<()> {
        let key = ArtifactKey::partition();
        put_json(self.store.as_ref(), &self.retry, &key, partition)?;
        info!(
            accounts = partition.account_count(),
            n_clusters = partition.n_clusters,
            key = %key,
            "Partition saved"
        );
        Ok(())
    }

    pub fn load_partition(&self) -> Result<Partition> {
        let key = ArtifactKey::partition();
        get_json(self.store.as_ref(), &self.retry, &key)?.ok_or(PipelineError::ArtifactNotFound {
            key: key.to_string(),
        })
    }
}
