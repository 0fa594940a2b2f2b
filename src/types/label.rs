//! Anomaly labels and scoring results

use serde::{Deserialize, Serialize};
use std::fmt;

use super::AccountId;

/// Binary outcome of an outlier model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyLabel {
    Normal,
    Anomaly,
}

impl AnomalyLabel {
    pub fn is_anomaly(&self) -> bool {
        matches!(self, AnomalyLabel::Anomaly)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyLabel::Normal => "normal",
            AnomalyLabel::Anomaly => "anomaly",
        }
    }
}

impl fmt::Display for AnomalyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label produced for one scored account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringResult {
    pub account_id: AccountId,
    pub anomaly_label: AnomalyLabel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_display() {
        assert_eq!(AnomalyLabel::Anomaly.to_string(), "anomaly");
        assert_eq!(AnomalyLabel::Normal.to_string(), "normal");
        assert!(AnomalyLabel::Anomaly.is_anomaly());
        assert!(!AnomalyLabel::Normal.is_anomaly());
    }

    #[test]
    fn test_scoring_result_serialization() {
        let result = ScoringResult {
            account_id: 11,
            anomaly_label: AnomalyLabel::Anomaly,
        };

        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"account_id":11,"anomaly_label":"anomaly"}"#);

        let deserialized: ScoringResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, deserialized);
    }
}
