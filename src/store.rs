//! Key-based artifact persistence.
//!
//! Every component receives an [`ArtifactStore`] rather than locating
//! directories itself. [`FsArtifactStore`] publishes writes atomically
//! (stage to a temp file, then rename); [`MemoryArtifactStore`] backs tests.

use crate::error::{PipelineError, Result};
use crate::types::CohortId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

const COHORT_DATASET_PREFIX: &str = "cohorts/";
const MODEL_PREFIX: &str = "models/";
const RESULT_PREFIX: &str = "results/";

/// Location of one artifact inside a store, e.g. `models/iforest_model_3.json`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Account → cohort assignment, centroids and scaler statistics
    pub fn partition() -> Self {
        Self::new("partition/partition.json")
    }

    pub fn cohort_dataset(cohort_id: CohortId) -> Self {
        Self(format!("{COHORT_DATASET_PREFIX}cohort_{cohort_id}_withdrawals.csv"))
    }

    pub fn cohort_model(cohort_id: CohortId) -> Self {
        Self(format!("{MODEL_PREFIX}iforest_model_{cohort_id}.json"))
    }

    pub fn cohort_result(cohort_id: CohortId) -> Self {
        Self(format!(
            "{RESULT_PREFIX}anomaly_detection_cohort_{cohort_id}_withdrawals.csv"
        ))
    }

    pub fn scoring_results() -> Self {
        Self::new("results/withdrawals_test_results.csv")
    }

    pub fn cohort_dataset_prefix() -> &'static str {
        COHORT_DATASET_PREFIX
    }

    /// Cohort id encoded in a cohort dataset key.
    pub fn dataset_cohort_id(&self) -> Option<CohortId> {
        self.0
            .strip_prefix(COHORT_DATASET_PREFIX)?
            .strip_prefix("cohort_")?
            .strip_suffix("_withdrawals.csv")?
            .parse()
            .ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Abstract persistence for datasets, models and results.
///
/// Implementations must be safe to share across per-cohort worker threads.
pub trait ArtifactStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any previous artifact.
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()>;

    /// Read the artifact under `key`, or `None` when it does not exist.
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, in ascending order.
    fn list(&self, prefix: &str) -> Result<Vec<ArtifactKey>>;

    /// Remove the artifact under `key`. Removing a missing key is not an error.
    fn delete(&self, key: &ArtifactKey) -> Result<()>;
}

/// Filesystem-backed store rooted at a directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.as_str())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(key.as_str(), e))?;
        }

        // Readers never observe a partially written artifact
        let staged = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        std::fs::write(&staged, bytes).map_err(|e| PipelineError::io(key.as_str(), e))?;
        if let Err(e) = std::fs::rename(&staged, &path) {
            let _ = std::fs::remove_file(&staged);
            return Err(PipelineError::io(key.as_str(), e));
        }

        debug!(key = %key, bytes = bytes.len(), "Artifact published");
        Ok(())
    }

    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::io(key.as_str(), e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<ArtifactKey>> {
        let (dir, file_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };

        let entries = match std::fs::read_dir(self.root.join(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(prefix, e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(prefix, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| PipelineError::io(prefix, e))?
                .is_file();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_file || name.ends_with(".tmp") || !name.starts_with(file_prefix) {
                continue;
            }
            let key = if dir.is_empty() {
                name
            } else {
                format!("{dir}/{name}")
            };
            keys.push(ArtifactKey::new(key));
        }

        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &ArtifactKey) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::io(key.as_str(), e)),
        }
    }
}

/// In-memory store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<BTreeMap<ArtifactKey, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned(key: &str) -> PipelineError {
        PipelineError::io(key, std::io::Error::new(ErrorKind::Other, "store lock poisoned"))
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<()> {
        self.artifacts
            .write()
            .map_err(|_| Self::poisoned(key.as_str()))?
            .insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>> {
        Ok(self
            .artifacts
            .read()
            .map_err(|_| Self::poisoned(key.as_str()))?
            .get(key)
            .cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ArtifactKey>> {
        Ok(self
            .artifacts
            .read()
            .map_err(|_| Self::poisoned(prefix))?
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &ArtifactKey) -> Result<()> {
        self.artifacts
            .write()
            .map_err(|_| Self::poisoned(key.as_str()))?
            .remove(key);
        Ok(())
    }
}

/// Bounded retry for transient artifact I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Blocks the calling thread between attempts, so call it from a blocking context.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff.saturating_mul(1u32 << attempt.min(16));
                    attempt += 1;
                    warn!(
                        operation = what,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient artifact failure, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Serialize `value` as pretty JSON under `key`.
pub fn put_json<T: Serialize>(
    store: &dyn ArtifactStore,
    retry: &RetryPolicy,
    key: &ArtifactKey,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| PipelineError::format(key.as_str(), e))?;
    retry.run(key.as_str(), || store.put(key, &bytes))
}

/// Read and decode a JSON artifact, `None` when it does not exist.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    retry: &RetryPolicy,
    key: &ArtifactKey,
) -> Result<Option<T>> {
    match retry.run(key.as_str(), || store.get(key))? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PipelineError::format(key.as_str(), e)),
        None => Ok(None),
    }
}

/// Serialize rows as CSV (header taken from the row type) under `key`.
pub fn put_csv_rows<T: Serialize>(
    store: &dyn ArtifactStore,
    retry: &RetryPolicy,
    key: &ArtifactKey,
    rows: &[T],
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    for row in rows {
        wtr.serialize(row)
            .map_err(|e| PipelineError::format(key.as_str(), e))?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| PipelineError::io(key.as_str(), e.into_error()))?;
    retry.run(key.as_str(), || store.put(key, &bytes))
}
