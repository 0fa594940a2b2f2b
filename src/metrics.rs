//! Run statistics for training and scoring passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for one pipeline process
pub struct PipelineMetrics {
    /// Accounts partitioned in the last training run
    pub accounts_partitioned: AtomicU64,
    /// Cohorts with a fitted and persisted model
    pub cohorts_trained: AtomicU64,
    /// Cohorts left without a model (empty or malformed dataset)
    pub cohorts_skipped: AtomicU64,
    /// Cohorts whose unit errored, panicked or timed out
    pub cohorts_failed: AtomicU64,
    /// Training rows labeled by cohort models
    pub rows_labeled: AtomicU64,
    /// Training rows labeled `anomaly`
    pub anomalies_detected: AtomicU64,
    /// Scoring rows that received a label
    pub rows_scored: AtomicU64,
    /// Scoring rows labeled `anomaly`
    pub scoring_anomalies: AtomicU64,
    /// Scoring rows that produced no label
    pub scoring_failures: AtomicU64,
    /// Per-cohort training times (in microseconds)
    cohort_times: RwLock<Vec<u64>>,
    start_time: Instant,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            accounts_partitioned: AtomicU64::new(0),
            cohorts_trained: AtomicU64::new(0),
            cohorts_skipped: AtomicU64::new(0),
            cohorts_failed: AtomicU64::new(0),
            rows_labeled: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
            rows_scored: AtomicU64::new(0),
            scoring_anomalies: AtomicU64::new(0),
            scoring_failures: AtomicU64::new(0),
            cohort_times: RwLock::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_partition(&self, accounts: usize) {
        self.accounts_partitioned
            .store(accounts as u64, Ordering::Relaxed);
    }

    /// Record a trained cohort
    pub fn record_cohort_trained(&self, rows: usize, anomalies: usize, elapsed: Duration) {
        self.cohorts_trained.fetch_add(1, Ordering::Relaxed);
        self.rows_labeled.fetch_add(rows as u64, Ordering::Relaxed);
        self.anomalies_detected
            .fetch_add(anomalies as u64, Ordering::Relaxed);

        if let Ok(mut times) = self.cohort_times.write() {
            times.push(elapsed.as_micros() as u64);
        }
    }

    pub fn record_cohort_skipped(&self) {
        self.cohorts_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cohort_failed(&self) {
        self.cohorts_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a scoring batch
    pub fn record_scoring(&self, scored: usize, anomalies: usize, failures: usize) {
        self.rows_scored.fetch_add(scored as u64, Ordering::Relaxed);
        self.scoring_anomalies
            .fetch_add(anomalies as u64, Ordering::Relaxed);
        self.scoring_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    /// Get per-cohort training time statistics
    pub fn get_cohort_stats(&self) -> ProcessingStats {
        let sorted = match self.cohort_times.read() {
            Ok(times) if !times.is_empty() => {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                sorted
            }
            _ => return ProcessingStats::default(),
        };

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let labeled = load(&self.rows_labeled);
        let anomalies = load(&self.anomalies_detected);
        let anomaly_rate = if labeled > 0 {
            (anomalies as f64 / labeled as f64) * 100.0
        } else {
            0.0
        };
        let stats = self.get_cohort_stats();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║          WITHDRAWAL ANOMALY PIPELINE - RUN SUMMARY           ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Accounts Partitioned: {:>8}  │  Elapsed: {:>9.2} s      ║",
            load(&self.accounts_partitioned),
            self.elapsed().as_secs_f64()
        );
        info!(
            "║ Cohorts trained={:>4} skipped={:>4} failed={:>4}                ║",
            load(&self.cohorts_trained),
            load(&self.cohorts_skipped),
            load(&self.cohorts_failed)
        );
        info!(
            "║ Rows Labeled:   {:>8}  │  Anomalies: {:>6} ({:>5.2}%)      ║",
            labeled, anomalies, anomaly_rate
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Cohort Training (μs): mean={:>7} p50={:>7} max={:>7}       ║",
            stats.mean_us, stats.p50_us, stats.max_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Rows Scored:    {:>8}  │  Anomalies: {:>6}  Failed: {:>6} ║",
            load(&self.rows_scored),
            load(&self.scoring_anomalies),
            load(&self.scoring_failures)
        );
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_cohort_trained(120, 1, Duration::from_micros(300));
        metrics.record_cohort_trained(80, 0, Duration::from_micros(100));
        metrics.record_cohort_skipped();
        metrics.record_scoring(48, 2, 2);

        assert_eq!(metrics.cohorts_trained.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.rows_labeled.load(Ordering::Relaxed), 200);
        assert_eq!(metrics.anomalies_detected.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.cohorts_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.scoring_failures.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_cohort_stats() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.get_cohort_stats().count, 0);

        for us in [100, 400, 200, 300] {
            metrics.record_cohort_trained(1, 0, Duration::from_micros(us));
        }
        let stats = metrics.get_cohort_stats();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean_us, 250);
        assert_eq!(stats.max_us, 400);
        assert_eq!(stats.p50_us, 300);
    }
}
