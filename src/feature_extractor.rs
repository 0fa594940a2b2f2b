//! Feature extraction for withdrawal anomaly detection.
//!
//! Turns a filtered transaction stream into one behavioral feature vector
//! per account. Each withdrawal row first gets trailing-window aggregates
//! (magnitude sum and row count over the preceding window, inclusive of the
//! row itself); the account features are then the sums of those per-row
//! aggregates over all of the account's rows.

use crate::error::Result;
use crate::models::scaler::StandardScaler;
use crate::types::{
    AccountFeatureVector, AccountId, TransactionRecord, WithdrawalRow, NUM_WITHDRAWALS_COLUMN,
    TOTAL_WITHDRAWALS_COLUMN,
};
use chrono::{Duration, NaiveDateTime};
use ndarray::Array2;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Default trailing window, in calendar days.
pub const DEFAULT_WINDOW_DAYS: i64 = 5;

/// Rolling aggregates of one row's trailing window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingAggregate {
    /// Sum of magnitudes in the window
    pub total: f64,
    /// Number of rows in the window
    pub count: f64,
}

/// Compensated (Kahan) running sum that supports removal.
#[derive(Debug, Default, Clone, Copy)]
struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    fn remove(&mut self, value: f64) {
        self.add(-value);
    }

    fn value(&self) -> f64 {
        self.sum
    }
}

/// Trailing time-window aggregates for one account's time-ordered rows.
///
/// The window ending at row `i` holds row `i` and every earlier row whose
/// timestamp is strictly after `t_i - window`. Rows sharing a timestamp
/// are counted causally: a row never sees rows that follow it.
pub fn rolling_window(rows: &[(NaiveDateTime, f64)], window: Duration) -> Vec<RollingAggregate> {
    let mut queue: VecDeque<(NaiveDateTime, f64)> = VecDeque::with_capacity(rows.len());
    let mut total = CompensatedSum::default();
    let mut out = Vec::with_capacity(rows.len());

    for &(ts, magnitude) in rows {
        queue.push_back((ts, magnitude));
        total.add(magnitude);

        let cutoff = ts - window;
        while let Some(&(front_ts, front_magnitude)) = queue.front() {
            if front_ts > cutoff {
                break;
            }
            total.remove(front_magnitude);
            queue.pop_front();
        }

        out.push(RollingAggregate {
            total: total.value(),
            count: queue.len() as f64,
        });
    }

    out
}

/// Account features as the sum of each row's own rolling aggregates.
///
/// Not the account's total volume: a withdrawal that
/// sits inside several rows' windows contributes to each of them.
pub fn aggregate_account_features(
    account_id: AccountId,
    rows: &[WithdrawalRow],
) -> AccountFeatureVector {
    let mut num = CompensatedSum::default();
    let mut total = CompensatedSum::default();
    for row in rows {
        num.add(row.num_withdrawals_5d);
        total.add(row.total_withdrawals_5d);
    }
    AccountFeatureVector::new(account_id, num.value(), total.value())
}

/// Output of one feature extraction run.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    /// Unscaled account features, ascending by account id
    pub accounts: Vec<AccountFeatureVector>,
    /// Withdrawal rows with engineered fields, ordered by (account, time)
    pub withdrawals: Vec<WithdrawalRow>,
    /// Standardized features, row `i` belongs to `accounts[i]`
    pub scaled: Array2<f64>,
    /// Statistics used to produce `scaled`
    pub scaler: StandardScaler,
}

impl FeatureSet {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

fn feature_matrix(accounts: &[AccountFeatureVector]) -> Array2<f64> {
    let mut matrix = Array2::zeros((accounts.len(), 2));
    for (i, account) in accounts.iter().enumerate() {
        let [num, total] = account.features();
        matrix[[i, 0]] = num;
        matrix[[i, 1]] = total;
    }
    matrix
}

/// Feature extractor that transforms filtered transactions into account features.
pub struct FeatureExtractor {
    window: Duration,
}

impl FeatureExtractor {
    /// Create a new feature extractor with the default 5-day window.
    pub fn new() -> Self {
        Self::with_window_days(DEFAULT_WINDOW_DAYS)
    }

    pub fn with_window_days(days: i64) -> Self {
        Self {
            window: Duration::days(days),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Extract withdrawal rows, account features and the standardized matrix.
    ///
    /// Zero withdrawals yields an empty feature set rather than an error.
    pub fn extract(&self, records: &[TransactionRecord]) -> Result<FeatureSet> {
        let mut withdrawals: Vec<&TransactionRecord> =
            records.iter().filter(|r| r.is_withdrawal()).collect();
        withdrawals.sort_by(|a, b| a.account_id.cmp(&b.account_id).then(a.date.cmp(&b.date)));

        if withdrawals.is_empty() {
            warn!(
                input_rows = records.len(),
                "No withdrawal rows after filtering, producing empty features"
            );
        }

        let mut rows = Vec::with_capacity(withdrawals.len());
        let mut accounts = Vec::new();

        let mut start = 0;
        while start < withdrawals.len() {
            let account_id = withdrawals[start].account_id;
            let end = withdrawals[start..]
                .iter()
                .position(|r| r.account_id != account_id)
                .map_or(withdrawals.len(), |offset| start + offset);
            let group = &withdrawals[start..end];

            let series: Vec<(NaiveDateTime, f64)> =
                group.iter().map(|r| (r.date, r.magnitude())).collect();
            let windows = rolling_window(&series, self.window);

            let first_row = rows.len();
            for (record, agg) in group.iter().zip(windows) {
                rows.push(WithdrawalRow {
                    trans_date: record.date,
                    account_id,
                    trans_type: record.trans_type,
                    amount: record.amount,
                    magnitude: record.magnitude(),
                    total_withdrawals_5d: agg.total,
                    num_withdrawals_5d: agg.count,
                });
            }
            accounts.push(aggregate_account_features(account_id, &rows[first_row..]));
            start = end;
        }

        let raw = feature_matrix(&accounts);
        let scaler = StandardScaler::fit(raw.view());
        let scaled = scaler.transform(raw.view())?;

        debug!(
            withdrawals = rows.len(),
            accounts = accounts.len(),
            window_days = self.window.num_days(),
            "Features extracted"
        );

        Ok(FeatureSet {
            accounts,
            withdrawals: rows,
            scaled,
            scaler,
        })
    }

    /// Get the number of features produced per account.
    pub fn feature_count(&self) -> usize {
        2
    }

    /// Get feature names in matrix column order.
    pub fn feature_names(&self) -> Vec<&'static str> {
        vec![NUM_WITHDRAWALS_COLUMN, TOTAL_WITHDRAWALS_COLUMN]
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}
