//! Configuration management for the withdrawal anomaly pipeline

use crate::models::isolation_forest::IsolationForestParams;
use crate::models::kmeans::KMeansParams;
use crate::store::RetryPolicy;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Prefix of environment overrides, e.g. `PIPELINE__CLUSTERING__N_CLUSTERS=8`
const ENV_PREFIX: &str = "PIPELINE";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub input: InputConfig,
    pub features: FeaturesConfig,
    pub clustering: ClusteringConfig,
    pub detection: DetectionConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Artifact store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the filesystem artifact store
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
        }
    }
}

/// Input tables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Merged transaction table
    pub transactions: PathBuf,
    /// Districts whose transactions are excluded; optional
    pub banned_districts: Option<PathBuf>,
    /// Account feature rows to score
    pub scoring: PathBuf,
    /// Score only the first N rows
    pub scoring_limit: Option<usize>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            transactions: PathBuf::from("data/transactions.csv"),
            banned_districts: Some(PathBuf::from("data/banned_districts.csv")),
            scoring: PathBuf::from("data/withdrawals_test.csv"),
            scoring_limit: None,
        }
    }
}

/// Feature engineering configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Trailing window length in calendar days
    pub window_days: i64,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self { window_days: 5 }
    }
}

/// Cohort clustering configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub n_clusters: usize,
    pub seed: u64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            n_clusters: 10,
            seed: 42,
            max_iterations: 300,
            tolerance: 1e-4,
        }
    }
}

impl ClusteringConfig {
    pub fn params(&self) -> KMeansParams {
        KMeansParams::new(self.n_clusters)
            .with_seed(self.seed)
            .with_max_iterations(self.max_iterations)
            .with_tolerance(self.tolerance)
    }
}

/// Per-cohort outlier model configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Expected share of anomalous rows per cohort
    pub contamination: f64,
    pub n_estimators: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let params = IsolationForestParams::default();
        Self {
            contamination: params.contamination,
            n_estimators: params.n_estimators,
            max_samples: params.max_samples,
            seed: params.seed,
        }
    }
}

impl DetectionConfig {
    pub fn params(&self) -> IsolationForestParams {
        IsolationForestParams {
            n_estimators: self.n_estimators,
            max_samples: self.max_samples,
            contamination: self.contamination,
            seed: self.seed,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cohort units processed concurrently
    pub workers: usize,
    /// Per-cohort processing timeout in milliseconds
    pub cohort_timeout_ms: u64,
    /// Retries of transient artifact I/O
    pub max_retries: u32,
    /// First retry delay in milliseconds, doubled per retry
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            cohort_timeout_ms: 60_000,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
    }

    pub fn cohort_timeout(&self) -> Duration {
        Duration::from_millis(self.cohort_timeout_ms)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path, then apply `PIPELINE__*` overrides
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to build configuration from {:?}", path.as_ref()))?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations no run can succeed with
    pub fn validate(&self) -> Result<()> {
        if self.clustering.n_clusters == 0 {
            anyhow::bail!("clustering.n_clusters must be at least 1");
        }
        if self.clustering.max_iterations == 0 {
            anyhow::bail!("clustering.max_iterations must be at least 1");
        }
        if self.features.window_days <= 0 {
            anyhow::bail!("features.window_days must be positive");
        }
        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.cohort_timeout_ms == 0 {
            anyhow::bail!("pipeline.cohort_timeout_ms must be positive");
        }
        self.detection
            .params()
            .validate()
            .context("Invalid detection configuration")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.clustering.n_clusters, 10);
        assert_eq!(config.clustering.seed, 42);
        assert_eq!(config.detection.contamination, 0.001);
        assert_eq!(config.features.window_days, 5);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
[clustering]
n_clusters = 3

[logging]
format = "json"
"#,
        );
        let config = AppConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.clustering.n_clusters, 3);
        assert_eq!(config.clustering.seed, 42);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.pipeline.workers, 4);
    }

    #[test]
    fn test_invalid_contamination_rejected() {
        let file = write_config("[detection]\ncontamination = 0.9\n");
        assert!(AppConfig::load_from_path(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load_from_path("/nonexistent/config.toml").is_err());
    }

    #[test]
    fn test_params_follow_config() {
        let config = AppConfig::default();
        let kmeans = config.clustering.params();
        assert_eq!(kmeans.n_clusters, 10);
        assert_eq!(kmeans.max_iterations, 300);

        let forest = config.detection.params();
        assert_eq!(forest, IsolationForestParams::default());

        let retry = config.pipeline.retry_policy();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.backoff, Duration::from_millis(100));
    }
}
