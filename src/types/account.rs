//! Account-level features and cohorts

use serde::{Deserialize, Serialize};

pub type AccountId = u64;
pub type CohortId = usize;

/// Column names of the two behavioral features.
pub const NUM_WITHDRAWALS_COLUMN: &str = "num_withdrawals_5d";
pub const TOTAL_WITHDRAWALS_COLUMN: &str = "total_withdrawals_5d";

/// Per-account behavioral features, derived fresh each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountFeatureVector {
    pub account_id: AccountId,
    /// Sum over the account's withdrawal rows of each row's trailing-window count
    pub num_withdrawals_5d: f64,
    /// Sum over the account's withdrawal rows of each row's trailing-window magnitude sum
    pub total_withdrawals_5d: f64,
}

impl AccountFeatureVector {
    pub fn new(account_id: AccountId, num_withdrawals_5d: f64, total_withdrawals_5d: f64) -> Self {
        Self {
            account_id,
            num_withdrawals_5d,
            total_withdrawals_5d,
        }
    }

    /// Features in model column order.
    pub fn features(&self) -> [f64; 2] {
        [self.num_withdrawals_5d, self.total_withdrawals_5d]
    }
}

/// A group of accounts sharing a partition id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cohort {
    pub cohort_id: CohortId,
    pub members: Vec<AccountId>,
}

impl Cohort {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_order() {
        let fv = AccountFeatureVector::new(9, 3.0, 4500.0);
        assert_eq!(fv.features(), [3.0, 4500.0]);
    }

    #[test]
    fn test_csv_header_names_match_columns() {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.serialize(AccountFeatureVector::new(1, 1.0, 10.0)).unwrap();
        let out = String::from_utf8(wtr.into_inner().unwrap()).unwrap();
        let header = out.lines().next().unwrap();
        assert_eq!(
            header,
            format!("account_id,{},{}", NUM_WITHDRAWALS_COLUMN, TOTAL_WITHDRAWALS_COLUMN)
        );
    }
}
