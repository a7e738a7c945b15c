// =============================================================================
// Feature Extractor -- deterministic (Transaction, history) -> FeatureVector
// =============================================================================

use std::collections::BTreeMap;

use chrono::Datelike;

use crate::history::HistoryStore;
use crate::types::Transaction;

/// Canonical field order. Every [`FeatureVector`] produced by [`extract`]
/// follows this order; `to_array` and `to_map` both honor it.
pub const FEATURE_NAMES: [&str; 18] = [
    "amount",
    "hour_of_day",
    "day_of_week",
    "is_weekend",
    "transaction_type",
    "user_avg_amount",
    "user_std_amount",
    "user_max_amount",
    "user_min_amount",
    "amount_vs_avg",
    "txns_last_hour",
    "txns_last_day",
    "time_since_last_txn",
    "merchant_avg_amount",
    "merchant_std_amount",
    "ip_txn_count",
    "ip_unique_users",
    "ip_user_ratio",
];

/// The 18-field feature vector, in fixed order, for one transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub amount: f64,
    pub hour_of_day: f64,
    pub day_of_week: f64,
    pub is_weekend: f64,
    pub transaction_type: f64,
    pub user_avg_amount: f64,
    pub user_std_amount: f64,
    pub user_max_amount: f64,
    pub user_min_amount: f64,
    pub amount_vs_avg: f64,
    pub txns_last_hour: f64,
    pub txns_last_day: f64,
    pub time_since_last_txn: f64,
    pub merchant_avg_amount: f64,
    pub merchant_std_amount: f64,
    pub ip_txn_count: f64,
    pub ip_unique_users: f64,
    pub ip_user_ratio: f64,
}

impl FeatureVector {
    /// Values in [`FEATURE_NAMES`] order, suitable for a dot product against
    /// the scorer's weight vector.
    pub fn to_array(&self) -> [f64; 18] {
        [
            self.amount,
            self.hour_of_day,
            self.day_of_week,
            self.is_weekend,
            self.transaction_type,
            self.user_avg_amount,
            self.user_std_amount,
            self.user_max_amount,
            self.user_min_amount,
            self.amount_vs_avg,
            self.txns_last_hour,
            self.txns_last_day,
            self.time_since_last_txn,
            self.merchant_avg_amount,
            self.merchant_std_amount,
            self.ip_txn_count,
            self.ip_unique_users,
            self.ip_user_ratio,
        ]
    }

    /// Ordered map view for the wire contract and persistence layer.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        FEATURE_NAMES
            .iter()
            .zip(self.to_array())
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation, 0.0 for fewer than two samples.
fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Extract the feature vector for `transaction` against the history store.
///
/// Reads a snapshot of each relevant window but never mutates the store --
/// callers must append the transaction's own [`crate::types::HistoryEntry`]
/// afterwards. That ordering is what gives "features-before-self": the
/// vector never reflects the transaction appearing in its own aggregates.
pub fn extract(transaction: &Transaction, history: &HistoryStore) -> FeatureVector {
    let amount = transaction.amount;
    let hour_of_day = transaction.timestamp.hour() as f64;
    let day_of_week = transaction.timestamp.weekday().num_days_from_monday() as f64;
    let is_weekend = if day_of_week >= 5.0 { 1.0 } else { 0.0 };
    let transaction_type = transaction.transaction_type.encoding();

    let (
        user_avg_amount,
        user_std_amount,
        user_max_amount,
        user_min_amount,
        amount_vs_avg,
        txns_last_hour,
        txns_last_day,
        time_since_last_txn,
    ) = history.user_snapshot(&transaction.user_id, |snapshot| {
        if snapshot.is_empty() {
            (amount, 0.0, amount, amount, 1.0, 0.0, 0.0, 24.0)
        } else {
            let amounts: Vec<f64> = snapshot.iter().map(|e| e.amount).collect();
            let avg = mean(&amounts);
            let std = population_std(&amounts);
            let max = amounts.iter().cloned().fold(f64::MIN, f64::max);
            let min = amounts.iter().cloned().fold(f64::MAX, f64::min);
            let vs_avg = amount / (avg + 1e-6);

            let last_hour = snapshot
                .iter()
                .filter(|e| (transaction.timestamp - e.timestamp).num_seconds() < 3600)
                .count() as f64;
            let last_day = snapshot
                .iter()
                .filter(|e| (transaction.timestamp - e.timestamp).num_seconds() < 86_400)
                .count() as f64;

            let since_last = snapshot.last().map_or(24.0, |e| {
                (transaction.timestamp - e.timestamp).num_seconds() as f64 / 3600.0
            });

            (avg, std, max, min, vs_avg, last_hour, last_day, since_last)
        }
    });

    let (merchant_avg_amount, merchant_std_amount) = match &transaction.merchant_id {
        Some(merchant_id) => history.merchant_snapshot(merchant_id, |snapshot| {
            if snapshot.is_empty() {
                (amount, 0.0)
            } else {
                let amounts: Vec<f64> = snapshot.iter().map(|e| e.amount).collect();
                (mean(&amounts), population_std(&amounts))
            }
        }),
        None => (0.0, 0.0),
    };

    let (ip_txn_count, ip_unique_users, ip_user_ratio) = match &transaction.ip_address {
        Some(ip) => history.ip_snapshot(ip, |snapshot| {
            let count = snapshot.len() as f64;
            let unique: std::collections::HashSet<&str> =
                snapshot.iter().map(|e| e.user_id.as_str()).collect();
            let unique_users = unique.len() as f64;
            let ratio = unique_users / (count + 1.0);
            (count, unique_users, ratio)
        }),
        None => (0.0, 0.0, 0.0),
    };

    FeatureVector {
        amount,
        hour_of_day,
        day_of_week,
        is_weekend,
        transaction_type,
        user_avg_amount,
        user_std_amount,
        user_max_amount,
        user_min_amount,
        amount_vs_avg,
        txns_last_hour,
        txns_last_day,
        time_since_last_txn,
        merchant_avg_amount,
        merchant_std_amount,
        ip_txn_count,
        ip_unique_users,
        ip_user_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HistoryEntry, TransactionType};
    use chrono::{TimeZone, Utc};

    fn txn(user_id: &str, amount: f64, ts: chrono::DateTime<Utc>) -> Transaction {
        Transaction {
            transaction_id: "t".into(),
            user_id: user_id.into(),
            amount,
            currency: "USD".into(),
            transaction_type: TransactionType::Payment,
            merchant_id: None,
            merchant_category: None,
            location: None,
            ip_address: None,
            device_id: None,
            timestamp: ts,
            metadata: None,
        }
    }

    #[test]
    fn first_transaction_uses_self_substitution() {
        let history = HistoryStore::new(100);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let t = txn("u1", 120.0, ts);
        let f = extract(&t, &history);
        assert_eq!(f.user_avg_amount, 120.0);
        assert_eq!(f.user_max_amount, 120.0);
        assert_eq!(f.user_min_amount, 120.0);
        assert!((f.amount_vs_avg - 1.0).abs() < 1e-9);
        assert_eq!(f.txns_last_hour, 0.0);
        assert_eq!(f.time_since_last_txn, 24.0);
    }

    #[test]
    fn empty_merchant_and_ip_yield_zeros_not_absence() {
        let history = HistoryStore::new(100);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let t = txn("u1", 50.0, ts);
        let f = extract(&t, &history);
        assert_eq!(f.merchant_avg_amount, 0.0);
        assert_eq!(f.merchant_std_amount, 0.0);
        assert_eq!(f.ip_txn_count, 0.0);
        assert_eq!(f.ip_unique_users, 0.0);
        assert_eq!(f.ip_user_ratio, 0.0);
    }

    #[test]
    fn amount_vs_avg_reflects_strictly_earlier_transactions() {
        let history = HistoryStore::new(100);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        history.append_user(
            "u1",
            HistoryEntry {
                timestamp: t0,
                user_id: "u1".into(),
                amount: 100.0,
                transaction_type: TransactionType::Payment,
            },
        );
        let t1 = t0 + chrono::Duration::minutes(30);
        let t = txn("u1", 300.0, t1);
        let f = extract(&t, &history);
        assert!((f.user_avg_amount - 100.0).abs() < 1e-9);
        assert!((f.amount_vs_avg - (300.0 / 100.000001)).abs() < 1e-6);
    }

    #[test]
    fn velocity_counts_respect_window_boundaries() {
        let history = HistoryStore::new(100);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for mins_ago in [10, 50, 120, 1500] {
            history.append_user(
                "u1",
                HistoryEntry {
                    timestamp: base,
                    user_id: "u1".into(),
                    amount: 10.0,
                    transaction_type: TransactionType::Payment,
                },
            );
            let _ = mins_ago;
        }
        // All four entries share `base`; observe at base + 59 minutes so all
        // are within the hour window, and at base + 25 hours so none are.
        let near = txn("u1", 10.0, base + chrono::Duration::minutes(59));
        let f_near = extract(&near, &history);
        assert_eq!(f_near.txns_last_hour, 4.0);

        let far = txn("u1", 10.0, base + chrono::Duration::hours(25));
        let f_far = extract(&far, &history);
        assert_eq!(f_far.txns_last_hour, 0.0);
        assert_eq!(f_far.txns_last_day, 0.0);
    }

    #[test]
    fn feature_vector_length_and_order_are_stable() {
        let history = HistoryStore::new(100);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t = txn("u1", 10.0, ts);
        let f = extract(&t, &history);
        let arr = f.to_array();
        assert_eq!(arr.len(), 18);
        assert!(arr.iter().all(|v| v.is_finite()));
        let map = f.to_map();
        assert_eq!(map.len(), 18);
        for name in FEATURE_NAMES {
            assert!(map.contains_key(name));
        }
    }

    #[test]
    fn ip_shared_across_users_computes_ratio() {
        let history = HistoryStore::new(100);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for uid in ["u1", "u2", "u3"] {
            history.append_ip(
                "1.2.3.4",
                HistoryEntry {
                    timestamp: base,
                    user_id: uid.into(),
                    amount: 10.0,
                    transaction_type: TransactionType::Payment,
                },
            );
        }
        let mut t = txn("u4", 10.0, base);
        t.ip_address = Some("1.2.3.4".into());
        let f = extract(&t, &history);
        assert_eq!(f.ip_txn_count, 3.0);
        assert_eq!(f.ip_unique_users, 3.0);
        assert!((f.ip_user_ratio - (3.0 / 4.0)).abs() < 1e-9);
    }
}
