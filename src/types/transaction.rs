//! Transaction and withdrawal row data structures

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Withdrawal magnitude is `abs(amount) * WITHDRAWAL_MAGNITUDE_SCALE`.
pub const WITHDRAWAL_MAGNITUDE_SCALE: f64 = 10.0;

/// Transaction category decoded from the raw `trans_type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Credit,
    Withdrawal,
    Other,
}

impl TransactionType {
    /// Decode a raw type code (`C` credit, `D` withdrawal, `P` other).
    ///
    /// Codes outside that set are treated as `Other`.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "C" => TransactionType::Credit,
            "D" => TransactionType::Withdrawal,
            _ => TransactionType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "CREDIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::Other => "OTHER",
        }
    }
}

/// A single filtered transaction, as delivered by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub date: NaiveDateTime,
    pub account_id: AccountId,
    pub trans_type: TransactionType,
    /// Signed amount as recorded by the bank
    pub amount: f64,
}

impl TransactionRecord {
    pub fn new(
        date: NaiveDateTime,
        account_id: AccountId,
        trans_type: TransactionType,
        amount: f64,
    ) -> Self {
        Self {
            date,
            account_id,
            trans_type,
            amount,
        }
    }

    pub fn is_withdrawal(&self) -> bool {
        self.trans_type == TransactionType::Withdrawal
    }

    /// Normalized withdrawal magnitude used by every engineered feature.
    pub fn magnitude(&self) -> f64 {
        self.amount.abs() * WITHDRAWAL_MAGNITUDE_SCALE
    }
}

/// A withdrawal row carrying its raw fields and its rolling-window features.
///
/// Field order is the column order of materialized cohort datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRow {
    pub trans_date: NaiveDateTime,
    pub account_id: AccountId,
    pub trans_type: TransactionType,
    pub amount: f64,
    pub magnitude: f64,
    /// Sum of magnitudes in the trailing window ending at this row
    pub total_withdrawals_5d: f64,
    /// Number of rows in the trailing window ending at this row
    pub num_withdrawals_5d: f64,
}
