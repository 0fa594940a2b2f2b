//! Per-cohort isolation forest training and labeling

use crate::error::{PipelineError, Result};
use crate::models::isolation_forest::{IsolationForest, IsolationForestParams};
use crate::models::loader::{CohortModel, ModelLoader};
use crate::store::{ArtifactKey, ArtifactStore, RetryPolicy};
use crate::types::{CohortId, NUM_WITHDRAWALS_COLUMN, TOTAL_WITHDRAWALS_COLUMN};
use ndarray::Array2;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Column appended to every labeled cohort dataset.
pub const ANOMALY_LABEL_COLUMN: &str = "anomaly_label";

/// Result of one cohort's training unit.
#[derive(Debug, Clone, PartialEq)]
pub enum CohortOutcome {
    Trained {
        cohort_id: CohortId,
        rows: usize,
        anomalies: usize,
        elapsed: Duration,
    },
    Skipped {
        cohort_id: CohortId,
        reason: String,
    },
}

impl CohortOutcome {
    pub fn cohort_id(&self) -> CohortId {
        match self {
            CohortOutcome::Trained { cohort_id, .. } | CohortOutcome::Skipped { cohort_id, .. } => {
                *cohort_id
            }
        }
    }
}

/// Shared between a training unit and its supervisor. Once closed, the unit
/// publishes no artifacts.
#[derive(Debug, Clone, Default)]
pub struct PublishGate(Arc<Mutex<bool>>);

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate, waiting out a publish already in progress.
    pub fn close(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn publish<T>(&self, cohort_id: CohortId, publish: impl FnOnce() -> Result<T>) -> Result<T> {
        let closed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(PipelineError::Task {
                cohort_id,
                reason: "abandoned before publishing".to_string(),
            });
        }
        publish()
    }
}

/// A cohort dataset parsed for training.
struct CohortDataset {
    headers: csv::StringRecord,
    records: Vec<csv::StringRecord>,
    features: Array2<f64>,
}

/// Fits, applies and persists one isolation forest per cohort dataset.
#[derive(Clone)]
pub struct AnomalyTrainer {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
    loader: ModelLoader,
    params: IsolationForestParams,
}

impl AnomalyTrainer {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
        params: IsolationForestParams,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            loader: ModelLoader::new(Arc::clone(&store), retry),
            store,
            retry,
            params,
        })
    }

    /// Train, label and persist one cohort. Nothing is written once `gate` is closed.
    pub fn train_cohort(&self, cohort_id: CohortId, gate: &PublishGate) -> Result<CohortOutcome> {
        let started = Instant::now();
        let key = ArtifactKey::cohort_dataset(cohort_id);
        let bytes = self
            .retry
            .run(key.as_str(), || self.store.get(&key))?
            .ok_or_else(|| PipelineError::ArtifactNotFound {
                key: key.to_string(),
            })?;

        let dataset = match parse_dataset(&key, &bytes)? {
            Ok(dataset) => dataset,
            Err(reason) => {
                warn!(cohort_id = cohort_id, reason = %reason, "Cohort dataset skipped");
                return Ok(CohortOutcome::Skipped { cohort_id, reason });
            }
        };

        let forest = IsolationForest::fit(dataset.features.view(), self.params)?;
        let labels = forest.predict_batch(dataset.features.view())?;
        let anomalies = labels.iter().filter(|l| l.is_anomaly()).count();

        debug!(
            cohort_id = cohort_id,
            threshold = forest.threshold,
            sample_size = forest.sample_size,
            "Cohort forest fitted"
        );

        let result_key = ArtifactKey::cohort_result(cohort_id);
        let mut wtr = csv::Writer::from_writer(Vec::new());
        let mut header = dataset.headers.clone();
        header.push_field(ANOMALY_LABEL_COLUMN);
        wtr.write_record(&header)
            .map_err(|e| PipelineError::format(result_key.as_str(), e))?;
        for (record, label) in dataset.records.iter().zip(&labels) {
            let mut labeled = record.clone();
            labeled.push_field(label.as_str());
            wtr.write_record(&labeled)
                .map_err(|e| PipelineError::format(result_key.as_str(), e))?;
        }
        let out = wtr
            .into_inner()
            .map_err(|e| PipelineError::io(result_key.as_str(), e.into_error()))?;
        gate.publish(cohort_id, || {
            self.retry
                .run(result_key.as_str(), || self.store.put(&result_key, &out))?;
            self.loader.save_model(&CohortModel::new(cohort_id, forest))
        })?;

        let rows = dataset.records.len();
        let elapsed = started.elapsed();
        info!(
            cohort_id = cohort_id,
            rows = rows,
            anomalies = anomalies,
            elapsed_ms = elapsed.as_millis() as u64,
            "Cohort trained"
        );

        Ok(CohortOutcome::Trained {
            cohort_id,
            rows,
            anomalies,
            elapsed,
        })
    }
}

/// Parse a cohort CSV. The inner `Err` carries the reason to skip the cohort.
fn parse_dataset(
    key: &ArtifactKey,
    bytes: &[u8],
) -> Result<std::result::Result<CohortDataset, String>> {
    let mut rdr = csv::Reader::from_reader(bytes);
    let headers = rdr
        .headers()
        .map_err(|e| PipelineError::format(key.as_str(), e))?
        .clone();

    let position = |name: &str| headers.iter().position(|h| h == name);
    let (num_idx, total_idx) = match (
        position(NUM_WITHDRAWALS_COLUMN),
        position(TOTAL_WITHDRAWALS_COLUMN),
    ) {
        (Some(num), Some(total)) => (num, total),
        _ => return Ok(Err("missing feature column".to_string())),
    };

    let mut records = Vec::new();
    for record in rdr.records() {
        records.push(record.map_err(|e| PipelineError::format(key.as_str(), e))?);
    }
    if records.is_empty() {
        return Ok(Err("no rows".to_string()));
    }

    let mut features = Array2::zeros((records.len(), 2));
    for (i, record) in records.iter().enumerate() {
        for (j, idx) in [num_idx, total_idx].into_iter().enumerate() {
            let raw = record.get(idx).unwrap_or_default();
            features[[i, j]] = raw.trim().parse::<f64>().map_err(|e| {
                PipelineError::InvalidRecord {
                    table: key.to_string(),
                    reason: format!("row {}: {:?} is not a number: {}", i + 1, raw, e),
                }
            })?;
        }
    }

    Ok(Ok(CohortDataset {
        headers,
        records,
        features,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryArtifactStore;

    fn trainer() -> (AnomalyTrainer, Arc<MemoryArtifactStore>) {
        let store = Arc::new(MemoryArtifactStore::new());
        let trainer =
            AnomalyTrainer::new(store.clone(), RetryPolicy::none(), IsolationForestParams::default())
                .unwrap();
        (trainer, store)
    }

    fn dataset(rows: &[(f64, f64)]) -> Vec<u8> {
        let mut csv = String::from("trans_date,account_id,num_withdrawals_5d,total_withdrawals_5d\n");
        for (i, (num, total)) in rows.iter().enumerate() {
            csv.push_str(&format!("1997-01-{:02}T00:00:00,{},{},{}\n", i + 1, i + 1, num, total));
        }
        csv.into_bytes()
    }

    #[test]
    fn test_trains_labels_and_persists() {
        let (trainer, store) = trainer();
        let mut rows = vec![(1.0, 1000.0); 12];
        rows.push((1.0, 100000.0));
        store.put(&ArtifactKey::cohort_dataset(0), &dataset(&rows)).unwrap();

        let outcome = trainer.train_cohort(0, &PublishGate::new()).unwrap();
        match outcome {
            CohortOutcome::Trained { rows, anomalies, .. } => {
                assert_eq!(rows, 13);
                assert_eq!(anomalies, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let labeled = store.get(&ArtifactKey::cohort_result(0)).unwrap().unwrap();
        let text = String::from_utf8(labeled).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "trans_date,account_id,num_withdrawals_5d,total_withdrawals_5d,anomaly_label"
        );
        assert!(lines[1].ends_with(",normal"));
        assert!(lines[13].ends_with(",anomaly"));
        assert!(store.get(&ArtifactKey::cohort_model(0)).unwrap().is_some());
    }

    #[test]
    fn test_missing_feature_column_is_skipped() {
        let (trainer, store) = trainer();
        store
            .put(&ArtifactKey::cohort_dataset(1), b"account_id,num_withdrawals_5d\n1,1\n")
            .unwrap();

        let outcome = trainer.train_cohort(1, &PublishGate::new()).unwrap();
        assert!(matches!(outcome, CohortOutcome::Skipped { cohort_id: 1, .. }));
        assert!(store.get(&ArtifactKey::cohort_model(1)).unwrap().is_none());
    }

    #[test]
    fn test_empty_dataset_is_skipped() {
        let (trainer, store) = trainer();
        store.put(&ArtifactKey::cohort_dataset(2), &dataset(&[])).unwrap();

        let outcome = trainer.train_cohort(2, &PublishGate::new()).unwrap();
        assert!(matches!(outcome, CohortOutcome::Skipped { cohort_id: 2, .. }));
    }

    #[test]
    fn test_non_numeric_feature_is_invalid_record() {
        let (trainer, store) = trainer();
        store
            .put(
                &ArtifactKey::cohort_dataset(3),
                b"num_withdrawals_5d,total_withdrawals_5d\n1,lots\n",
            )
            .unwrap();

        let err = trainer.train_cohort(3, &PublishGate::new()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRecord { .. }));
    }

    #[test]
    fn test_labels_are_reproducible() {
        let rows: Vec<(f64, f64)> = (0..40)
            .map(|i| (1.0 + (i % 3) as f64, 500.0 + (i * 37 % 11) as f64 * 40.0))
            .collect();
        let (first, store_a) = trainer();
        let (second, store_b) = trainer();
        store_a.put(&ArtifactKey::cohort_dataset(0), &dataset(&rows)).unwrap();
        store_b.put(&ArtifactKey::cohort_dataset(0), &dataset(&rows)).unwrap();

        first.train_cohort(0, &PublishGate::new()).unwrap();
        second.train_cohort(0, &PublishGate::new()).unwrap();
        assert_eq!(
            store_a.get(&ArtifactKey::cohort_result(0)).unwrap(),
            store_b.get(&ArtifactKey::cohort_result(0)).unwrap()
        );
    }

    #[test]
    fn test_closed_gate_publishes_nothing() {
        let (trainer, store) = trainer();
        let mut rows = vec![(1.0, 1000.0); 12];
        rows.push((1.0, 100000.0));
        store.put(&ArtifactKey::cohort_dataset(0), &dataset(&rows)).unwrap();

        let gate = PublishGate::new();
        gate.close();

        let err = trainer.train_cohort(0, &gate).unwrap_err();
        assert!(matches!(err, PipelineError::Task { cohort_id: 0, .. }));
        assert!(store.get(&ArtifactKey::cohort_result(0)).unwrap().is_none());
        assert!(store.get(&ArtifactKey::cohort_model(0)).unwrap().is_none());
    }
}
