//! Training and scoring orchestration
//!
//! Per-cohort units run on the blocking pool, at most `pipeline.workers` at a
//! time, each bounded by `pipeline.cohort_timeout_ms`. A failed or timed-out
//! cohort is recorded in the run summary and never stops its siblings.

use crate::cohort::CohortMaterializer;
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::feature_extractor::FeatureExtractor;
use crate::metrics::PipelineMetrics;
use crate::models::inference::{write_results, CohortScorer, ScoringReport};
use crate::models::loader::ModelLoader;
use crate::partitioner::Partitioner;
use crate::store::ArtifactStore;
use crate::trainer::{AnomalyTrainer, CohortOutcome, PublishGate};
use crate::types::{AccountFeatureVector, CohortId, TransactionRecord};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Outcome of a training run.
#[derive(Debug, Default)]
pub struct TrainingSummary {
    pub accounts: usize,
    pub withdrawals: usize,
    /// Cohorts with a dataset written this run
    pub cohorts_materialized: usize,
    /// Empty cohorts whose stale artifacts were removed
    pub cohorts_cleared: usize,
    pub outcomes: Vec<CohortOutcome>,
    pub failures: Vec<(CohortId, PipelineError)>,
}

impl TrainingSummary {
    pub fn trained(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, CohortOutcome::Trained { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.trained()
    }

    pub fn anomalies(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                CohortOutcome::Trained { anomalies, .. } => *anomalies,
                CohortOutcome::Skipped { .. } => 0,
            })
            .sum()
    }
}

/// Batch pipeline over an injected artifact store
pub struct Pipeline {
    config: Arc<AppConfig>,
    store: Arc<dyn ArtifactStore>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(config: AppConfig, store: Arc<dyn ArtifactStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Features → partition → cohort datasets → one model per cohort.
    pub async fn train(&self, records: Vec<TransactionRecord>) -> Result<TrainingSummary> {
        let config = Arc::clone(&self.config);
        let store = Arc::clone(&self.store);
        let retry = config.pipeline.retry_policy();

        info!(
            records = records.len(),
            n_clusters = config.clustering.n_clusters,
            "Starting training run"
        );

        let (mut summary, partition_accounts, cohorts) = tokio::task::spawn_blocking(move || {
            let features = FeatureExtractor::with_window_days(config.features.window_days)
                .extract(&records)
                .context("Feature extraction failed")?;
            if features.is_empty() {
                warn!("No accounts with withdrawals, every cohort will be empty");
            }

            let partition = Partitioner::new(config.clustering.params())
                .partition(&features)
                .context("Partitioning failed")?;
            ModelLoader::new(Arc::clone(&store), retry)
                .save_partition(&partition)
                .context("Failed to persist partition")?;

            let report =
                CohortMaterializer::new(store, retry).materialize(&partition, &features.withdrawals);
            for (cohort_id, e) in &report.failed {
                error!(cohort_id = *cohort_id, error = %e, "Cohort not materialized");
            }

            // Only datasets written this run match the new partition
            let cohorts: Vec<CohortId> = report.written.iter().map(|(id, _)| *id).collect();
            let summary = TrainingSummary {
                accounts: features.accounts.len(),
                withdrawals: features.withdrawals.len(),
                cohorts_materialized: report.written.len(),
                cohorts_cleared: report.cleared.len(),
                outcomes: Vec::new(),
                failures: report.failed,
            };
            Ok::<_, anyhow::Error>((summary, partition.account_count(), cohorts))
        })
        .await
        .context("Training preparation task failed")??;

        self.metrics.record_partition(partition_accounts);

        let trainer = AnomalyTrainer::new(
            Arc::clone(&self.store),
            self.config.pipeline.retry_policy(),
            self.config.detection.params(),
        )?;

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.workers));
        let timeout = self.config.pipeline.cohort_timeout();
        let mut handles: Vec<(
            CohortId,
            PublishGate,
            JoinHandle<Result<CohortOutcome, PipelineError>>,
        )> = Vec::with_capacity(cohorts.len());

        for cohort_id in cohorts {
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let trainer = trainer.clone();
            let gate = PublishGate::new();
            let unit_gate = gate.clone();
            let handle = tokio::spawn(async move {
                let result = run_cohort_unit(cohort_id, timeout, move || {
                    trainer.train_cohort(cohort_id, &unit_gate)
                })
                .await;
                drop(permit);
                result
            });
            handles.push((cohort_id, gate, handle));
        }

        for (cohort_id, gate, handle) in handles {
            match join_unit(cohort_id, handle).await {
                Ok(outcome) => {
                    match &outcome {
                        CohortOutcome::Trained {
                            rows,
                            anomalies,
                            elapsed,
                            ..
                        } => self.metrics.record_cohort_trained(*rows, *anomalies, *elapsed),
                        CohortOutcome::Skipped { .. } => {
                            self.metrics.record_cohort_skipped();
                            self.retract_cohort(cohort_id, gate).await;
                        }
                    }
                    summary.outcomes.push(outcome);
                }
                Err(e) => {
                    error!(cohort_id = cohort_id, error = %e, "Cohort training failed");
                    self.metrics.record_cohort_failed();
                    self.retract_cohort(cohort_id, gate).await;
                    summary.failures.push((cohort_id, e));
                }
            }
        }

        info!(
            accounts = summary.accounts,
            withdrawals = summary.withdrawals,
            trained = summary.trained(),
            skipped = summary.skipped(),
            failed = summary.failures.len(),
            anomalies = summary.anomalies(),
            "Training run complete"
        );
        Ok(summary)
    }

    /// Stop a cohort unit from publishing and remove whatever model it left behind.
    async fn retract_cohort(&self, cohort_id: CohortId, gate: PublishGate) {
        let materializer =
            CohortMaterializer::new(Arc::clone(&self.store), self.config.pipeline.retry_policy());
        let retracted = tokio::task::spawn_blocking(move || {
            gate.close();
            materializer.retract(cohort_id)
        })
        .await;
        match retracted {
            Ok(Ok(())) => warn!(cohort_id = cohort_id, "Cohort model withdrawn"),
            Ok(Err(e)) => {
                error!(cohort_id = cohort_id, error = %e, "Withdrawing cohort model failed")
            }
            Err(e) => {
                error!(cohort_id = cohort_id, error = %e, "Withdrawing cohort model task failed")
            }
        }
    }

    /// Label each row with the model of its cohort and persist the result table.
    pub async fn score(&self, rows: Vec<AccountFeatureVector>) -> Result<ScoringReport> {
        let store = Arc::clone(&self.store);
        let retry = self.config.pipeline.retry_policy();

        info!(rows = rows.len(), "Starting scoring run");

        let scorer = Arc::new(
            tokio::task::spawn_blocking(move || CohortScorer::from_store(store, retry))
                .await
                .context("Loading scoring partition failed")?
                .context("No usable partition, run training first")?,
        );

        let (batches, unrouted) = scorer.route(&rows);
        let mut report = ScoringReport::default();
        for failure in unrouted {
            report.fail(failure);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.workers));
        let timeout = self.config.pipeline.cohort_timeout();
        let mut handles = Vec::with_capacity(batches.len());

        for batch in batches {
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let scorer = Arc::clone(&scorer);
            let unit = batch.clone();
            let cohort_id = batch.cohort_id;
            let handle = tokio::spawn(async move {
                let result =
                    run_cohort_unit(cohort_id, timeout, move || Ok(scorer.score_batch(&unit))).await;
                drop(permit);
                result
            });
            handles.push((batch, handle));
        }

        for (batch, handle) in handles {
            match join_unit(batch.cohort_id, handle).await {
                Ok(cohort_report) => report.merge(cohort_report),
                Err(e) => {
                    error!(cohort_id = batch.cohort_id, error = %e, "Cohort scoring failed");
                    report.fail_batch(&batch, e);
                }
            }
        }

        let report = report.finish();
        self.metrics
            .record_scoring(report.results.len(), report.anomalies(), report.failures.len());

        let store = Arc::clone(&self.store);
        let results = report.results.clone();
        tokio::task::spawn_blocking(move || write_results(store.as_ref(), &retry, &results))
            .await
            .context("Writing scoring results failed")?
            .context("Failed to persist scoring results")?;

        info!(
            scored = report.results.len(),
            anomalies = report.anomalies(),
            failed = report.failures.len(),
            model_not_found = report.model_not_found(),
            "Scoring run complete"
        );
        Ok(report)
    }
}

/// Run blocking cohort work on the blocking pool under a timeout.
///
/// A unit that times out keeps running on its thread; its result is discarded.
fn run_cohort_unit<T, F>(
    cohort_id: CohortId,
    timeout: Duration,
    work: F,
) -> impl Future<Output = Result<T, PipelineError>>
where
    T: Send + 'static,
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
{
    async move {
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(PipelineError::Task {
                cohort_id,
                reason: join.to_string(),
            }),
            Err(_) => Err(PipelineError::Timeout {
                cohort_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

async fn join_unit<T>(
    cohort_id: CohortId,
    handle: JoinHandle<Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    handle.await.unwrap_or_else(|join| {
        Err(PipelineError::Task {
            cohort_id,
            reason: join.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.workers = 0;
        let err = Pipeline::new(config, Arc::new(MemoryArtifactStore::new()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("pipeline.workers"));
    }

    #[tokio::test]
    async fn test_unit_timeout_is_reported() {
        let result = run_cohort_unit(3, Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(PipelineError::Timeout {
                cohort_id: 3,
                timeout_ms: 20
            })
        ));
    }

    #[tokio::test]
    async fn test_unit_panic_is_a_task_error() {
        let result: Result<(), PipelineError> =
            run_cohort_unit(1, Duration::from_secs(5), || panic!("boom")).await;
        assert!(matches!(result, Err(PipelineError::Task { cohort_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_unit_error_passes_through() {
        let result: Result<(), PipelineError> = run_cohort_unit(2, Duration::from_secs(5), || {
            Err(PipelineError::ModelNotFound { cohort_id: 2 })
        })
        .await;
        assert!(matches!(result, Err(PipelineError::ModelNotFound { cohort_id: 2 })));
    }
}
