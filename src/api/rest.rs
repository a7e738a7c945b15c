// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The facade is boundary-only: no authentication layer, permissive CORS. It
// exposes service identity, health, aggregate stats, the recent-results
// ring, and two ad-hoc scoring endpoints (`/predict`, `/explain`) for callers
// that want a verdict outside the streaming path.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::Engine;
use crate::features;
use crate::scorer::{MODEL_NAME, RULE_MODEL_NAME};
use crate::types::{Explanation, FraudDecision, RiskBand, RuleTrace, Transaction};

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/recent", get(recent))
        .route("/predict", post(predict))
        .route("/explain", post(explain))
        .layer(cors)
        .with_state(engine)
}

// =============================================================================
// GET /
// =============================================================================

#[derive(Serialize)]
struct IndexResponse {
    service: String,
    status: &'static str,
    version: &'static str,
}

async fn index(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(IndexResponse {
        service: engine.config.app_name.clone(),
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// =============================================================================
// GET /health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    redis_connected: bool,
}

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let redis_connected = !engine.is_degraded();
    let status = if redis_connected { "healthy" } else { "degraded" };
    Json(HealthResponse {
        status,
        model_loaded: true,
        redis_connected,
    })
}

// =============================================================================
// GET /stats
// =============================================================================

#[derive(Serialize)]
struct StatsResponse {
    total_transactions: i64,
    fraud_detected: i64,
    fraud_rate: f64,
    avg_risk_score: f64,
    model_type: String,
    uptime_seconds: f64,
}

async fn stats(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let snapshot = engine.stats_snapshot().await;
    Json(StatsResponse {
        total_transactions: snapshot.total_transactions,
        fraud_detected: snapshot.fraud_detected,
        fraud_rate: snapshot.fraud_rate,
        avg_risk_score: snapshot.avg_risk_score,
        model_type: engine.config.model_type.clone(),
        uptime_seconds: engine.uptime_seconds(),
    })
}

// =============================================================================
// GET /recent?limit=N
// =============================================================================

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct RecentResponse {
    transactions: Vec<crate::types::EnrichedResult>,
    total: usize,
    limit: usize,
}

async fn recent(State(engine): State<Arc<Engine>>, Query(query): Query<RecentQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    if let Some(storage) = &engine.storage {
        if let Ok(transactions) = storage.recent(limit as i64).await {
            let total = transactions.len().max(engine.ring.len());
            return Json(RecentResponse { transactions, total, limit });
        }
    }

    let transactions = engine.ring.recent(limit);
    let total = engine.ring.len();
    Json(RecentResponse { transactions, total, limit })
}

// =============================================================================
// POST /predict
// =============================================================================

async fn predict(
    State(engine): State<Arc<Engine>>,
    Json(txn): Json<Transaction>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let feature_vector = features::extract(&txn, &engine.history);

    let entry = crate::types::HistoryEntry::from(&txn);
    engine.history.append_user(&txn.user_id, entry.clone());
    if let Some(merchant_id) = &txn.merchant_id {
        engine.history.append_merchant(merchant_id, entry.clone());
    }
    if let Some(ip) = &txn.ip_address {
        engine.history.append_ip(ip, entry);
    }

    let score = engine.scorer.score(&feature_vector);
    let band = RiskBand::from_probability(score.probability);
    let is_fraud = score.probability >= engine.config.fraud_threshold;
    let model_used = match score.trace {
        RuleTrace::Logistic => MODEL_NAME,
        _ => RULE_MODEL_NAME,
    }
    .to_string();

    Ok(Json(FraudDecision {
        probability: score.probability,
        band,
        is_fraud,
        model_used,
        features: feature_vector.to_map(),
    }))
}

// =============================================================================
// POST /explain
// =============================================================================

#[derive(Deserialize)]
struct ExplainRequest {
    transaction_id: String,
    probability: f64,
    features: std::collections::BTreeMap<String, f64>,
}

async fn explain(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ExplainRequest>,
) -> Result<Json<Explanation>, (StatusCode, String)> {
    let Some(explainer) = &engine.explainer else {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "explanations are disabled".to_string()));
    };

    let band = RiskBand::from_probability(req.probability);
    let importance: std::collections::BTreeMap<String, f64> = req
        .features
        .iter()
        .map(|(name, value)| (name.clone(), value.abs()))
        .collect();

    let explanation = explainer
        .explain(&req.transaction_id, req.probability, band, &req.features, &importance)
        .await;
    Ok(Json(explanation))
}
