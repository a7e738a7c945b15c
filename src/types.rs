// =============================================================================
// Shared types used across the fraud risk engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of positions in a feature vector.
pub const FEATURE_COUNT: usize = 18;

/// Kind of financial transaction flowing through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Payment,
    Transfer,
    Withdrawal,
    Deposit,
    Refund,
}

impl TransactionType {
    /// Numeric encoding consumed by the feature extractor and the logistic model.
    pub fn encoding(self) -> f64 {
        match self {
            Self::Payment => 1.0,
            Self::Transfer => 2.0,
            Self::Withdrawal => 3.0,
            Self::Deposit => 4.0,
            Self::Refund => 5.0,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Payment => write!(f, "payment"),
            Self::Transfer => write!(f, "transfer"),
            Self::Withdrawal => write!(f, "withdrawal"),
            Self::Deposit => write!(f, "deposit"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

/// An immutable inbound transaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub merchant_category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Open map of producer-supplied fields the engine does not interpret.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One entry retained in a per-entity history window. User windows keep the
/// transaction type too; merchant and IP windows only need the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub amount: f64,
    pub transaction_type: TransactionType,
}

impl From<&Transaction> for HistoryEntry {
    fn from(txn: &Transaction) -> Self {
        HistoryEntry {
            timestamp: txn.timestamp,
            user_id: txn.user_id.clone(),
            amount: txn.amount,
            transaction_type: txn.transaction_type,
        }
    }
}

/// Discrete risk category derived from a fraud probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskBand {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskBand {
    /// Closed on the lower side: low<0.30, medium<0.60, high<0.85, else critical.
    pub fn from_probability(p: f64) -> Self {
        if p < 0.30 {
            Self::Low
        } else if p < 0.60 {
            Self::Medium
        } else if p < 0.85 {
            Self::High
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for RiskBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Which branch of the scorer produced a probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTrace {
    RuleHighValueLowHistory,
    RuleVeryHighAmount,
    RuleVelocityAttack,
    Logistic,
}

impl std::fmt::Display for RuleTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RuleHighValueLowHistory => write!(f, "rule_high_value_low_history"),
            Self::RuleVeryHighAmount => write!(f, "rule_very_high_amount"),
            Self::RuleVelocityAttack => write!(f, "rule_velocity_attack"),
            Self::Logistic => write!(f, "logistic"),
        }
    }
}

/// Probability paired with which rule (or the logistic path) produced it.
#[derive(Debug, Clone, Copy)]
pub struct Score {
    pub probability: f64,
    pub trace: RuleTrace,
}

/// Fraud verdict for one transaction: probability, band, and the feature
/// vector that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudDecision {
    pub probability: f64,
    pub band: RiskBand,
    pub is_fraud: bool,
    pub model_used: String,
    pub features: std::collections::BTreeMap<String, f64>,
}

/// Narrative explanation attached to high-risk decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub narrative: String,
    pub risk_factors: Vec<String>,
    pub recommendations: Vec<String>,
}

/// The artifact published on the results channel, stored in the Recent Ring,
/// and persisted. Field order mirrors the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedResult {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub transaction_type: TransactionType,
    pub merchant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub fraud_probability: f64,
    pub risk_level: RiskBand,
    pub is_fraud: bool,
    pub features: std::collections::BTreeMap<String, f64>,
    pub model_used: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_factors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_band_partition_matches_closed_lower_bounds() {
        assert_eq!(RiskBand::from_probability(0.0), RiskBand::Low);
        assert_eq!(RiskBand::from_probability(0.29), RiskBand::Low);
        assert_eq!(RiskBand::from_probability(0.30), RiskBand::Medium);
        assert_eq!(RiskBand::from_probability(0.59), RiskBand::Medium);
        assert_eq!(RiskBand::from_probability(0.60), RiskBand::High);
        assert_eq!(RiskBand::from_probability(0.84), RiskBand::High);
        assert_eq!(RiskBand::from_probability(0.85), RiskBand::Critical);
        assert_eq!(RiskBand::from_probability(1.0), RiskBand::Critical);
    }

    #[test]
    fn transaction_type_encoding_matches_reference_mapping() {
        assert_eq!(TransactionType::Payment.encoding(), 1.0);
        assert_eq!(TransactionType::Transfer.encoding(), 2.0);
        assert_eq!(TransactionType::Withdrawal.encoding(), 3.0);
        assert_eq!(TransactionType::Deposit.encoding(), 4.0);
        assert_eq!(TransactionType::Refund.encoding(), 5.0);
    }

    #[test]
    fn transaction_deserializes_with_defaults() {
        let raw = r#"{
            "transaction_id": "t1",
            "user_id": "u1",
            "amount": 42.0,
            "transaction_type": "payment",
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let txn: Transaction = serde_json::from_str(raw).unwrap();
        assert_eq!(txn.currency, "USD");
        assert!(txn.merchant_id.is_none());
    }
}
