//! Cohort-routed scoring of new account feature rows

use crate::error::{PipelineError, Result};
use crate::models::loader::ModelLoader;
use crate::partitioner::Partition;
use crate::store::{put_csv_rows, ArtifactKey, ArtifactStore, RetryPolicy};
use crate::types::{AccountFeatureVector, AccountId, CohortId, ScoringResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scoring rows that share a cohort, each with its position in the input batch.
#[derive(Debug, Clone, Default)]
pub struct CohortBatch {
    pub cohort_id: CohortId,
    pub rows: Vec<(usize, AccountFeatureVector)>,
}

/// A row that produced no label.
#[derive(Debug, Clone)]
pub struct ScoringFailure {
    pub index: usize,
    pub account_id: AccountId,
    pub cohort_id: Option<CohortId>,
    /// Shared when a whole cohort fails for the same reason
    pub error: Arc<PipelineError>,
}

/// Outcome of one scoring batch.
#[derive(Debug, Default)]
pub struct ScoringReport {
    /// Successful predictions in input order
    pub results: Vec<ScoringResult>,
    /// Failed rows in input order
    pub failures: Vec<ScoringFailure>,
    labeled: Vec<(usize, ScoringResult)>,
}

impl ScoringReport {
    pub fn record(&mut self, index: usize, result: ScoringResult) {
        self.labeled.push((index, result));
    }

    pub fn fail(&mut self, failure: ScoringFailure) {
        self.failures.push(failure);
    }

    /// Fail every row of `batch` with the same error.
    pub fn fail_batch(&mut self, batch: &CohortBatch, error: PipelineError) {
        let error = Arc::new(error);
        for (index, row) in &batch.rows {
            self.fail(ScoringFailure {
                index: *index,
                account_id: row.account_id,
                cohort_id: Some(batch.cohort_id),
                error: Arc::clone(&error),
            });
        }
    }

    /// Fold in a cohort's unfinished report.
    pub fn merge(&mut self, other: ScoringReport) {
        self.labeled.extend(other.labeled);
        self.failures.extend(other.failures);
    }

    /// Restore input order once every cohort has reported.
    pub fn finish(mut self) -> Self {
        self.labeled.sort_by_key(|(index, _)| *index);
        self.results
            .extend(self.labeled.drain(..).map(|(_, result)| result));
        self.failures.sort_by_key(|f| f.index);
        self
    }

    pub fn anomalies(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.anomaly_label.is_anomaly())
            .count()
    }

    pub fn model_not_found(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(*f.error, PipelineError::ModelNotFound { .. }))
            .count()
    }
}

/// Scores accounts with the model of the cohort they resolve to.
pub struct CohortScorer {
    loader: ModelLoader,
    partition: Partition,
}

impl CohortScorer {
    pub fn new(loader: ModelLoader, partition: Partition) -> Self {
        Self { loader, partition }
    }

    /// Build a scorer from the partition persisted by the last training run.
    pub fn from_store(store: Arc<dyn ArtifactStore>, retry: RetryPolicy) -> Result<Self> {
        let loader = ModelLoader::new(store, retry);
        let partition = loader.load_partition()?;
        info!(
            accounts = partition.account_count(),
            n_clusters = partition.n_clusters,
            "Scoring partition loaded"
        );
        Ok(Self::new(loader, partition))
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Group rows by owning cohort. Rows that cannot be placed are returned as failures.
    pub fn route(&self, rows: &[AccountFeatureVector]) -> (Vec<CohortBatch>, Vec<ScoringFailure>) {
        let mut batches: BTreeMap<CohortId, CohortBatch> = BTreeMap::new();
        let mut failures = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            match self.partition.resolve(row) {
                Ok(cohort_id) => batches
                    .entry(cohort_id)
                    .or_insert_with(|| CohortBatch {
                        cohort_id,
                        rows: Vec::new(),
                    })
                    .rows
                    .push((index, row.clone())),
                Err(e) => {
                    warn!(account_id = row.account_id, error = %e, "Scoring row not routed");
                    failures.push(ScoringFailure {
                        index,
                        account_id: row.account_id,
                        cohort_id: None,
                        error: Arc::new(e),
                    });
                }
            }
        }

        (batches.into_values().collect(), failures)
    }

    /// Score one cohort's rows, loading its model once.
    pub fn score_batch(&self, batch: &CohortBatch) -> ScoringReport {
        let mut report = ScoringReport::default();

        let model = match self.loader.load_model(batch.cohort_id) {
            Ok(model) => model,
            Err(e) => {
                warn!(
                    cohort_id = batch.cohort_id,
                    rows = batch.rows.len(),
                    error = %e,
                    "No usable model for cohort, rows left unscored"
                );
                report.fail_batch(batch, e);
                return report;
            }
        };

        for (index, row) in &batch.rows {
            match model.forest.predict(&row.features()) {
                Ok(anomaly_label) => report.record(
                    *index,
                    ScoringResult {
                        account_id: row.account_id,
                        anomaly_label,
                    },
                ),
                Err(e) => report.fail(ScoringFailure {
                    index: *index,
                    account_id: row.account_id,
                    cohort_id: Some(batch.cohort_id),
                    error: Arc::new(e),
                }),
            }
        }

        debug!(
            cohort_id = batch.cohort_id,
            model_id = %model.model_id,
            scored = report.labeled.len(),
            "Cohort batch scored"
        );
        report
    }

    /// Score a whole batch sequentially.
    pub fn score(&self, rows: &[AccountFeatureVector]) -> ScoringReport {
        let (batches, failures) = self.route(rows);
        let mut report = ScoringReport::default();
        for failure in failures {
            report.fail(failure);
        }
        for batch in &batches {
            report.merge(self.score_batch(batch));
        }
        report.finish()
    }
}

/// Persist the consolidated scoring table.
pub fn write_results(
    store: &dyn ArtifactStore,
    retry: &RetryPolicy,
    results: &[ScoringResult],
) -> Result<()> {
    let key = ArtifactKey::scoring_results();
    put_csv_rows(store, retry, &key, results)?;
    info!(rows = results.len(), key = %key, "Scoring results written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::isolation_forest::{IsolationForest, IsolationForestParams};
    use crate::models::loader::CohortModel;
    use crate::models::scaler::StandardScaler;
    use crate::store::MemoryArtifactStore;
    use crate::types::AnomalyLabel;
    use ndarray::array;

    /// Two cohorts split on total magnitude; only cohort 0 has a model.
    fn scorer() -> (CohortScorer, Arc<MemoryArtifactStore>) {
        let store = Arc::new(MemoryArtifactStore::new());
        let loader = ModelLoader::new(store.clone(), RetryPolicy::none());

        let training = array![
            [3.0, 1000.0],
            [3.0, 1000.0],
            [3.0, 1000.0],
            [3.0, 1000.0],
            [3.0, 1000.0],
            [3.0, 100000.0],
        ];
        let forest = IsolationForest::fit(training.view(), IsolationForestParams::default()).unwrap();
        loader.save_model(&CohortModel::new(0, forest)).unwrap();

        let raw = array![[3.0, 1000.0], [3.0, 2000.0], [3.0, 900000.0]];
        let partition = Partition {
            n_clusters: 2,
            seed: 42,
            scaler: StandardScaler::fit(raw.view()),
            centroids: vec![vec![0.0, -0.7], vec![0.0, 1.4]],
            assignments: BTreeMap::from([(1, 0), (2, 0), (3, 1)]),
        };
        (CohortScorer::new(loader, partition), store)
    }

    #[test]
    fn test_scores_known_accounts_with_their_cohort_model() {
        let (scorer, _) = scorer();
        let rows = vec![
            AccountFeatureVector::new(1, 3.0, 1000.0),
            AccountFeatureVector::new(2, 3.0, 100000.0),
        ];
        let report = scorer.score(&rows);

        assert!(report.failures.is_empty());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].account_id, 1);
        assert_eq!(report.results[0].anomaly_label, AnomalyLabel::Normal);
        assert_eq!(report.results[1].anomaly_label, AnomalyLabel::Anomaly);
    }

    #[test]
    fn test_cohort_without_model_fails_only_its_rows() {
        let (scorer, _) = scorer();
        let rows = vec![
            AccountFeatureVector::new(3, 3.0, 900000.0),
            AccountFeatureVector::new(1, 3.0, 1000.0),
        ];
        let report = scorer.score(&rows);

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].account_id, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].account_id, 3);
        assert!(matches!(
            *report.failures[0].error,
            PipelineError::ModelNotFound { cohort_id: 1 }
        ));
        assert_eq!(report.model_not_found(), 1);
    }

    #[test]
    fn test_unseen_account_routes_to_nearest_centroid() {
        let (scorer, _) = scorer();
        let unseen = AccountFeatureVector::new(50, 3.0, 1500.0);
        let (batches, failures) = scorer.route(std::slice::from_ref(&unseen));

        assert!(failures.is_empty());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].cohort_id, 0);
        let report = scorer.score(std::slice::from_ref(&unseen));
        assert_eq!(report.results[0].anomaly_label, AnomalyLabel::Normal);

        let far = AccountFeatureVector::new(51, 3.0, 850000.0);
        let report = scorer.score(&[far]);
        assert!(report.results.is_empty());
        assert!(matches!(
            *report.failures[0].error,
            PipelineError::ModelNotFound { cohort_id: 1 }
        ));
    }

    #[test]
    fn test_rows_grouped_once_per_cohort() {
        let (scorer, _) = scorer();
        let rows: Vec<_> = (0..6)
            .map(|i| AccountFeatureVector::new(if i % 2 == 0 { 1 } else { 3 }, 3.0, 1000.0))
            .collect();
        let (batches, _) = scorer.route(&rows);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].rows.len(), 3);
        assert_eq!(batches[1].rows.len(), 3);
    }

    #[test]
    fn test_write_results_csv() {
        let (_, store) = scorer();
        let results = vec![
            ScoringResult {
                account_id: 1,
                anomaly_label: AnomalyLabel::Normal,
            },
            ScoringResult {
                account_id: 2,
                anomaly_label: AnomalyLabel::Anomaly,
            },
        ];
        write_results(store.as_ref(), &RetryPolicy::none(), &results).unwrap();

        let bytes = store.get(&ArtifactKey::scoring_results()).unwrap().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "account_id,anomaly_label\n1,normal\n2,anomaly\n");
    }
}
