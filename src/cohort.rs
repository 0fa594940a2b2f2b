//! Per-cohort dataset materialization

use crate::error::PipelineError;
use crate::partitioner::Partition;
use crate::store::{put_csv_rows, ArtifactKey, ArtifactStore, RetryPolicy};
use crate::types::{CohortId, WithdrawalRow};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a materialization pass wrote and removed.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    /// Cohorts with a fresh dataset, and its row count
    pub written: Vec<(CohortId, usize)>,
    /// Empty cohorts whose stale artifacts were removed
    pub cleared: Vec<CohortId>,
    pub failed: Vec<(CohortId, PipelineError)>,
}

impl MaterializeReport {
    pub fn rows_written(&self) -> usize {
        self.written.iter().map(|(_, rows)| rows).sum()
    }
}

/// Splits withdrawal rows into one dataset per cohort.
pub struct CohortMaterializer {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
}

impl CohortMaterializer {
    pub fn new(store: Arc<dyn ArtifactStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Group rows by their account's cohort, each group ordered by date (stable).
    pub fn split(
        partition: &Partition,
        rows: &[WithdrawalRow],
    ) -> BTreeMap<CohortId, Vec<WithdrawalRow>> {
        let mut groups: BTreeMap<CohortId, Vec<WithdrawalRow>> = BTreeMap::new();
        for row in rows {
            match partition.cohort_of(row.account_id) {
                Some(cohort_id) => groups.entry(cohort_id).or_default().push(row.clone()),
                None => warn!(
                    account_id = row.account_id,
                    "Withdrawal row for unpartitioned account dropped"
                ),
            }
        }
        for group in groups.values_mut() {
            group.sort_by(|a, b| a.trans_date.cmp(&b.trans_date));
        }
        groups
    }

    /// Write every non-empty cohort's dataset and clear artifacts of empty ones.
    pub fn materialize(&self, partition: &Partition, rows: &[WithdrawalRow]) -> MaterializeReport {
        let mut groups = Self::split(partition, rows);
        let mut report = MaterializeReport::default();

        for cohort in partition.cohorts() {
            let cohort_id = cohort.cohort_id;
            match groups.remove(&cohort_id) {
                Some(group) if !group.is_empty() => {
                    let key = ArtifactKey::cohort_dataset(cohort_id);
                    match put_csv_rows(self.store.as_ref(), &self.retry, &key, &group) {
                        Ok(()) => {
                            debug!(
                                cohort_id = cohort_id,
                                accounts = cohort.members.len(),
                                rows = group.len(),
                                "Cohort dataset written"
                            );
                            report.written.push((cohort_id, group.len()));
                        }
                        Err(e) => {
                            error!(cohort_id = cohort_id, error = %e, "Cohort dataset write failed");
                            // The previous run's artifacts no longer match the partition
                            if let Err(clear) = self.clear(cohort_id) {
                                error!(cohort_id = cohort_id, error = %clear, "Clearing stale cohort artifacts failed");
                            }
                            report.failed.push((cohort_id, e));
                        }
                    }
                }
                _ => match self.clear(cohort_id) {
                    Ok(()) => report.cleared.push(cohort_id),
                    Err(e) => {
                        error!(cohort_id = cohort_id, error = %e, "Clearing stale cohort artifacts failed");
                        report.failed.push((cohort_id, e));
                    }
                },
            }
        }

        // Datasets left from a run with a larger cohort count
        if let Err(e) = self.clear_beyond(partition.n_clusters) {
            warn!(error = %e, "Could not list stale cohort datasets");
        }

        info!(
            cohorts_written = report.written.len(),
            rows = report.rows_written(),
            cohorts_cleared = report.cleared.len(),
            failures = report.failed.len(),
            "Cohort datasets materialized"
        );
        report
    }

    fn clear(&self, cohort_id: CohortId) -> crate::error::Result<()> {
        self.delete(&[
            ArtifactKey::cohort_dataset(cohort_id),
            ArtifactKey::cohort_model(cohort_id),
            ArtifactKey::cohort_result(cohort_id),
        ])
    }

    /// Remove a cohort's model and labeled dataset after its training unit failed.
    pub fn retract(&self, cohort_id: CohortId) -> crate::error::Result<()> {
        self.delete(&[
            ArtifactKey::cohort_model(cohort_id),
            ArtifactKey::cohort_result(cohort_id),
        ])
    }

    fn delete(&self, keys: &[ArtifactKey]) -> crate::error::Result<()> {
        for key in keys {
            self.retry.run(key.as_str(), || self.store.delete(key))?;
        }
        Ok(())
    }

    fn clear_beyond(&self, n_clusters: usize) -> crate::error::Result<()> {
        let prefix = ArtifactKey::cohort_dataset_prefix();
        let keys = self.retry.run(prefix, || self.store.list(prefix))?;
        for cohort_id in keys.iter().filter_map(ArtifactKey::dataset_cohort_id) {
            if cohort_id >= n_clusters {
                self.clear(cohort_id)?;
            }
        }
        Ok(())
    }
}
