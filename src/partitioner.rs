//! Cohort partitioning of accounts by behavioral similarity

use crate::error::{PipelineError, Result};
use crate::feature_extractor::FeatureSet;
use crate::models::kmeans::{nearest_centroid, KMeans, KMeansParams};
use crate::models::scaler::StandardScaler;
use crate::types::{AccountFeatureVector, AccountId, Cohort, CohortId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Account → cohort assignment produced by one training run.
///
/// Persisted next to the cohort models so scoring resolves each account to
/// the cohort it was trained in, and places unseen accounts by centroid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Configured cohort count; ids are always below this
    pub n_clusters: usize,
    pub seed: u64,
    /// Training-time standardization statistics
    pub scaler: StandardScaler,
    /// Centroids in standardized space, indexed by cohort id
    pub centroids: Vec<Vec<f64>>,
    pub assignments: BTreeMap<AccountId, CohortId>,
}

impl Partition {
    pub fn cohort_of(&self, account_id: AccountId) -> Option<CohortId> {
        self.assignments.get(&account_id).copied()
    }

    /// Nearest centroid for a raw (unstandardized) feature vector.
    pub fn nearest_cohort(&self, features: &[f64]) -> Result<Option<CohortId>> {
        let scaled = self.scaler.transform_row(features)?;
        Ok(nearest_centroid(&self.centroids, &scaled))
    }

    /// Cohort for a scoring row: the training-time assignment when the
    /// account was seen, otherwise the nearest centroid.
    pub fn resolve(&self, row: &AccountFeatureVector) -> Result<CohortId> {
        if let Some(cohort_id) = self.cohort_of(row.account_id) {
            return Ok(cohort_id);
        }
        self.nearest_cohort(&row.features())?
            .ok_or(PipelineError::CohortUnresolved {
                account_id: row.account_id,
            })
    }

    /// Every cohort id in `[0, n_clusters)` with its members, empty ones included.
    pub fn cohorts(&self) -> Vec<Cohort> {
        let mut cohorts: Vec<Cohort> = (0..self.n_clusters)
            .map(|cohort_id| Cohort {
                cohort_id,
                members: Vec::new(),
            })
            .collect();
        for (&account_id, &cohort_id) in &self.assignments {
            cohorts[cohort_id].members.push(account_id);
        }
        cohorts
    }

    pub fn account_count(&self) -> usize {
        self.assignments.len()
    }
}

/// Clusters standardized account features into cohorts.
pub struct Partitioner {
    params: KMeansParams,
}

impl Partitioner {
    pub fn new(params: KMeansParams) -> Self {
        Self { params }
    }

    pub fn n_clusters(&self) -> usize {
        self.params.n_clusters
    }

    /// Assign every account in `features` to exactly one cohort.
    pub fn partition(&self, features: &FeatureSet) -> Result<Partition> {
        let (model, labels) = KMeans::fit(features.scaled.view(), &self.params)?;

        let assignments: BTreeMap<AccountId, CohortId> = features
            .accounts
            .iter()
            .zip(labels)
            .map(|(account, label)| (account.account_id, label))
            .collect();

        let partition = Partition {
            n_clusters: self.params.n_clusters,
            seed: self.params.seed,
            scaler: features.scaler.clone(),
            centroids: model.centroids,
            assignments,
        };

        let populated = partition.cohorts().iter().filter(|c| !c.is_empty()).count();
        info!(
            accounts = partition.account_count(),
            n_clusters = partition.n_clusters,
            populated_cohorts = populated,
            iterations = model.iterations,
            inertia = model.inertia,
            "Accounts partitioned into cohorts"
        );
        debug!(centroids = ?partition.centroids, "Cohort centroids");

        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_extractor::FeatureExtractor;
    use crate::types::{TransactionRecord, TransactionType};
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn records(accounts: &[(AccountId, f64)]) -> Vec<TransactionRecord> {
        let date = NaiveDate::from_ymd_opt(1998, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        accounts
            .iter()
            .map(|&(id, amount)| TransactionRecord::new(date, id, TransactionType::Withdrawal, amount))
            .collect()
    }

    fn features(accounts: &[(AccountId, f64)]) -> FeatureSet {
        FeatureExtractor::new().extract(&records(accounts)).unwrap()
    }

    #[test]
    fn test_fewer_accounts_than_cohorts() {
        let set = features(&[(1, -10.0), (2, -20.0), (3, -5000.0)]);
        let partition = Partitioner::new(KMeansParams::new(10)).partition(&set).unwrap();

        assert_eq!(partition.account_count(), 3);
        assert!(partition.assignments.values().all(|&c| c < 10));
        assert_eq!(partition.cohorts().len(), 10);
    }

    #[test]
    fn test_partition_is_total_and_disjoint() {
        let accounts: Vec<(AccountId, f64)> =
            (1..=40).map(|i| (i, -(i as f64) * 3.5 - (i % 7) as f64 * 100.0)).collect();
        let set = features(&accounts);
        let partition = Partitioner::new(KMeansParams::new(4)).partition(&set).unwrap();

        let mut seen = HashSet::new();
        for cohort in partition.cohorts() {
            for member in cohort.members {
                assert!(seen.insert(member), "account {member} in two cohorts");
            }
        }
        let expected: HashSet<AccountId> = (1..=40).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_assignment_is_stable_across_runs() {
        let accounts: Vec<(AccountId, f64)> = (1..=25).map(|i| (i, -((i * i) as f64))).collect();
        let set = features(&accounts);
        let partitioner = Partitioner::new(KMeansParams::new(5));

        let a = partitioner.partition(&set).unwrap();
        let b = partitioner.partition(&set).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_features_give_empty_partition() {
        let set = features(&[]);
        let partition = Partitioner::new(KMeansParams::new(10)).partition(&set).unwrap();

        assert_eq!(partition.account_count(), 0);
        assert!(partition.centroids.is_empty());
        assert!(partition.cohorts().iter().all(|c| c.is_empty()));
    }

    #[test]
    fn test_resolve_prefers_training_assignment() {
        let set = features(&[(1, -10.0), (2, -12.0), (3, -9000.0)]);
        let partition = Partitioner::new(KMeansParams::new(2)).partition(&set).unwrap();

        // Features far from account 1's cohort still resolve to its assignment
        let known = AccountFeatureVector::new(1, 1.0, 90_000.0);
        assert_eq!(partition.resolve(&known).unwrap(), partition.cohort_of(1).unwrap());

        // Unseen accounts land with the nearest centroid
        let unseen_small = AccountFeatureVector::new(99, 1.0, 110.0);
        assert_eq!(
            partition.resolve(&unseen_small).unwrap(),
            partition.cohort_of(1).unwrap()
        );
        let unseen_large = AccountFeatureVector::new(100, 1.0, 89_000.0);
        assert_eq!(
            partition.resolve(&unseen_large).unwrap(),
            partition.cohort_of(3).unwrap()
        );
    }

    #[test]
    fn test_unseen_account_without_centroids_is_unresolved() {
        let set = features(&[]);
        let partition = Partitioner::new(KMeansParams::new(3)).partition(&set).unwrap();

        let err = partition
            .resolve(&AccountFeatureVector::new(5, 1.0, 10.0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::CohortUnresolved { account_id: 5 }));
    }

    #[test]
    fn test_partition_survives_persistence() {
        let set = features(&[(1, -10.0), (2, -20.0)]);
        let partition = Partitioner::new(KMeansParams::new(10)).partition(&set).unwrap();

        let json = serde_json::to_string(&partition).unwrap();
        let restored: Partition = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, partition);
    }
}
