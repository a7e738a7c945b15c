// =============================================================================
// Engine -- owns every subsystem, constructed once at startup
// =============================================================================
//
// No process-wide state: everything a handler or pipeline worker needs hangs
// off one `Arc<Engine>` passed in explicitly, mirroring the teacher's
// single-`AppState`-struct convention but scoped to this engine's own
// subsystems (history, scorer, explainer, ring, storage) instead of the
// teacher's market-data/risk/position state.
//
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::explainer::Explainer;
use crate::history::HistoryStore;
use crate::persistence::Storage;
use crate::pubsub::RedisPublisher;
use crate::ring::RecentRing;
use crate::scorer::Scorer;
use crate::types::EnrichedResult;

/// Aggregate view returned by [`Engine::stats_snapshot`].
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total_transactions: i64,
    pub fraud_detected: i64,
    pub fraud_rate: f64,
    pub avg_risk_score: f64,
}

/// Central engine: history store, scorer, explainer, recent ring, storage,
/// and the stats/health bookkeeping the facade reads. Built once at startup
/// and shared behind an `Arc` with the pipeline workers and the facade.
pub struct Engine {
    pub config: EngineConfig,
    pub history: HistoryStore,
    pub scorer: Scorer,
    pub explainer: Option<Explainer>,
    pub ring: RecentRing,
    pub storage: Option<Arc<dyn Storage>>,
    pub publisher: Option<RedisPublisher>,
    pub redis_connected: Arc<AtomicBool>,
    start_time: Instant,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        scorer: Scorer,
        explainer: Option<Explainer>,
        storage: Option<Arc<dyn Storage>>,
        publisher: Option<RedisPublisher>,
    ) -> Self {
        let history = HistoryStore::new(config.feature_window);
        let ring = RecentRing::new(config.recent_ring_capacity);

        Self {
            config,
            history,
            scorer,
            explainer,
            ring,
            storage,
            publisher,
            redis_connected: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// `/stats` reads from persistent storage when configured and reachable,
    /// else falls back to the Recent Ring -- same precedence and the same
    /// bounded-window caveat as the service this engine replaces, whose
    /// in-memory fallback summed over `recent_fraud_results` rather than an
    /// unbounded counter.
    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        if let Some(storage) = &self.storage {
            if let Ok(db_stats) = storage.stats().await {
                let fraud_rate = if db_stats.total_transactions > 0 {
                    (db_stats.fraud_detected as f64 / db_stats.total_transactions as f64) * 100.0
                } else {
                    0.0
                };
                return StatsSnapshot {
                    total_transactions: db_stats.total_transactions,
                    fraud_detected: db_stats.fraud_detected,
                    fraud_rate,
                    avg_risk_score: db_stats.avg_risk_score,
                };
            }
        }

        let recent = self.ring.all();
        let total = recent.len();
        let fraud = recent.iter().filter(|r| r.is_fraud).count();
        let avg = if total > 0 {
            recent.iter().map(|r| r.fraud_probability).sum::<f64>() / total as f64
        } else {
            0.0
        };
        let fraud_rate = if total > 0 { (fraud as f64 / total as f64) * 100.0 } else { 0.0 };
        StatsSnapshot {
            total_transactions: total as i64,
            fraud_detected: fraud as i64,
            fraud_rate,
            avg_risk_score: avg,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.redis_connected.load(Ordering::Relaxed)
    }
}
