// =============================================================================
// Persistence adapter -- Postgres storage behind a trait, off the hot path
// =============================================================================
//
// Schema mirrors the prior Python service's `transactions` table: one row per
// enriched result, `features`/`risk_factors`/`recommendations` as JSONB. Uses
// sqlx's runtime-checked query API (`query`/`query_as` with manual `FromRow`)
// rather than the `query!`/`query_as!` macros, since those require a live
// database or an offline query cache at build time.
//
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use thiserror::Error;
use tracing::{error, info};

use crate::types::{EnrichedResult, RiskBand, TransactionType};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("operation timed out")]
    Timeout,
}

/// Aggregate statistics computed from persisted storage.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub total_transactions: i64,
    pub fraud_detected: i64,
    pub avg_risk_score: f64,
}

/// Storage boundary the pipeline writes through. A trait so the hot path
/// never depends on `sqlx` directly and tests can substitute an in-memory
/// fake.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, result: &EnrichedResult) -> Result<(), PersistenceError>;
    async fn stats(&self) -> Result<StorageStats, PersistenceError>;
    async fn recent(&self, limit: i64) -> Result<Vec<EnrichedResult>, PersistenceError>;
}

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enriched_results (
                transaction_id    TEXT PRIMARY KEY,
                user_id           TEXT NOT NULL,
                amount            DOUBLE PRECISION NOT NULL,
                transaction_type  TEXT NOT NULL,
                merchant_id       TEXT,
                timestamp         TIMESTAMPTZ NOT NULL,
                fraud_probability DOUBLE PRECISION NOT NULL,
                risk_level        TEXT NOT NULL,
                is_fraud          BOOLEAN NOT NULL,
                model_used        TEXT NOT NULL,
                ai_explanation    TEXT,
                risk_factors      JSONB,
                recommendations   JSONB,
                features          JSONB,
                created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_enriched_results_is_fraud ON enriched_results (is_fraud)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_enriched_results_timestamp ON enriched_results (timestamp DESC)",
        )
        .execute(&pool)
        .await?;

        info!("postgres storage connected and schema ensured");
        Ok(Self { pool })
    }
}

#[derive(FromRow)]
struct EnrichedResultRow {
    transaction_id: String,
    user_id: String,
    amount: f64,
    transaction_type: String,
    merchant_id: Option<String>,
    timestamp: DateTime<Utc>,
    fraud_probability: f64,
    risk_level: String,
    is_fraud: bool,
    model_used: String,
    ai_explanation: Option<String>,
    risk_factors: Option<serde_json::Value>,
    recommendations: Option<serde_json::Value>,
    features: Option<serde_json::Value>,
}

fn parse_transaction_type(s: &str) -> TransactionType {
    match s {
        "transfer" => TransactionType::Transfer,
        "withdrawal" => TransactionType::Withdrawal,
        "deposit" => TransactionType::Deposit,
        "refund" => TransactionType::Refund,
        _ => TransactionType::Payment,
    }
}

fn parse_risk_band(s: &str) -> RiskBand {
    match s {
        "medium" => RiskBand::Medium,
        "high" => RiskBand::High,
        "critical" => RiskBand::Critical,
        _ => RiskBand::Low,
    }
}

impl TryFrom<EnrichedResultRow> for EnrichedResult {
    type Error = serde_json::Error;

    fn try_from(row: EnrichedResultRow) -> Result<Self, Self::Error> {
        let features: BTreeMap<String, f64> = match row.features {
            Some(v) => serde_json::from_value(v)?,
            None => BTreeMap::new(),
        };
        let risk_factors: Option<Vec<String>> = match row.risk_factors {
            Some(v) => Some(serde_json::from_value(v)?),
            None => None,
        };
        let recommendations: Option<Vec<String>> = match row.recommendations {
            Some(v) => Some(serde_json::from_value(v)?),
            None => None,
        };

        Ok(EnrichedResult {
            transaction_id: row.transaction_id,
            user_id: row.user_id,
            amount: row.amount,
            transaction_type: parse_transaction_type(&row.transaction_type),
            merchant_id: row.merchant_id,
            timestamp: row.timestamp,
            fraud_probability: row.fraud_probability,
            risk_level: parse_risk_band(&row.risk_level),
            is_fraud: row.is_fraud,
            features,
            model_used: row.model_used,
            ai_explanation: row.ai_explanation,
            risk_factors,
            recommendations,
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn save(&self, result: &EnrichedResult) -> Result<(), PersistenceError> {
        let features = serde_json::to_value(&result.features).unwrap_or(serde_json::Value::Null);
        let risk_factors = result
            .risk_factors
            .as_ref()
            .map(|v| serde_json::to_value(v).unwrap_or(serde_json::Value::Null));
        let recommendations = result
            .recommendations
            .as_ref()
            .map(|v| serde_json::to_value(v).unwrap_or(serde_json::Value::Null));

        sqlx::query(
            r#"
            INSERT INTO enriched_results (
                transaction_id, user_id, amount, transaction_type, merchant_id,
                timestamp, fraud_probability, risk_level, is_fraud, model_used,
                ai_explanation, risk_factors, recommendations, features
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(&result.transaction_id)
        .bind(&result.user_id)
        .bind(result.amount)
        .bind(result.transaction_type.to_string())
        .bind(&result.merchant_id)
        .bind(result.timestamp)
        .bind(result.fraud_probability)
        .bind(result.risk_level.to_string())
        .bind(result.is_fraud)
        .bind(&result.model_used)
        .bind(&result.ai_explanation)
        .bind(risk_factors)
        .bind(recommendations)
        .bind(features)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE is_fraud) AS fraud_count,
                COALESCE(AVG(fraud_probability), 0.0) AS avg_risk
            FROM enriched_results
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageStats {
            total_transactions: row.try_get::<i64, _>("total")?,
            fraud_detected: row.try_get::<i64, _>("fraud_count")?,
            avg_risk_score: row.try_get::<f64, _>("avg_risk")?,
        })
    }

    async fn recent(&self, limit: i64) -> Result<Vec<EnrichedResult>, PersistenceError> {
        let rows: Vec<EnrichedResultRow> = sqlx::query_as(
            r#"
            SELECT transaction_id, user_id, amount, transaction_type, merchant_id,
                   timestamp, fraud_probability, risk_level, is_fraud, model_used,
                   ai_explanation, risk_factors, recommendations, features
            FROM enriched_results
            ORDER BY timestamp DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            match EnrichedResult::try_from(row) {
                Ok(r) => results.push(r),
                Err(err) => error!(error = %err, "failed to decode persisted result, skipping"),
            }
        }
        Ok(results)
    }
}

/// Deadline wrapper used by the writer task: persistence errors and timeouts
/// are logged and swallowed -- a failed save never blocks publication.
pub async fn save_with_deadline(storage: &dyn Storage, result: &EnrichedResult, deadline: Duration) {
    match tokio::time::timeout(deadline, storage.save(result)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(transaction_id = %result.transaction_id, error = %err, "persistence failed");
        }
        Err(_) => {
            error!(transaction_id = %result.transaction_id, "persistence timed out");
        }
    }
}
