//! Type definitions for the withdrawal anomaly pipeline

pub mod account;
pub mod label;
pub mod transaction;

pub use account::{
    AccountFeatureVector, AccountId, Cohort, CohortId, NUM_WITHDRAWALS_COLUMN,
    TOTAL_WITHDRAWALS_COLUMN,
};
pub use label::{AnomalyLabel, ScoringResult};
pub use transaction::{
    TransactionRecord, TransactionType, WithdrawalRow, WITHDRAWAL_MAGNITUDE_SCALE,
};
