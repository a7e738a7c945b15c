// =============================================================================
// Pipeline -- subscribe -> score -> explain -> persist -> publish
// =============================================================================
//
// A partitioned worker pool keyed by a stable hash of `user_id`: each worker
// owns one queue and processes it strictly in arrival order, so per-user
// ordering is preserved, while different users' events run fully in
// parallel across workers. Each partition queue is bounded and evicts the
// oldest entry on overflow -- the dispatch loop never blocks on a slow
// worker.
//
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{info, warn};

use crate::app_state::Engine;
use crate::features;
use crate::scorer::{self, MODEL_NAME, RULE_MODEL_NAME};
use crate::types::{EnrichedResult, HistoryEntry, RiskBand, RuleTrace, Transaction};

/// One partition's bounded, drop-oldest-on-overflow work queue.
struct PartitionQueue {
    entries: Mutex<VecDeque<Transaction>>,
    capacity: usize,
    notify: Notify,
}

impl PartitionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    fn push(&self, txn: Transaction) {
        let mut entries = self.entries.lock();
        entries.push_back(txn);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        drop(entries);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Transaction {
        loop {
            if let Some(txn) = self.entries.lock().pop_front() {
                return txn;
            }
            self.notify.notified().await;
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Stable partition assignment: same user always lands on the same worker,
/// preserving per-user ordering while spreading load across workers.
fn partition_for(user_id: &str, worker_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() as usize) % worker_count.max(1)
}

/// Run the pipeline until `shutdown` fires. Stops accepting new events
/// immediately on shutdown, drains in-flight partition queues up to
/// `shutdown_deadline`, then abandons whatever remains.
pub async fn run(
    engine: Arc<Engine>,
    mut inbound: mpsc::Receiver<Transaction>,
    worker_count: usize,
    queue_capacity: usize,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_deadline: Duration,
) {
    let worker_count = worker_count.max(1);
    let queues: Vec<Arc<PartitionQueue>> = (0..worker_count)
        .map(|_| Arc::new(PartitionQueue::new(queue_capacity)))
        .collect();

    let mut workers = Vec::with_capacity(worker_count);
    for queue in &queues {
        let queue = queue.clone();
        let engine = engine.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let txn = queue.pop().await;
                process_one(&engine, txn).await;
            }
        }));
    }

    info!(worker_count, queue_capacity, "pipeline started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("pipeline received shutdown signal, no longer accepting new events");
                break;
            }
            maybe_txn = inbound.recv() => {
                match maybe_txn {
                    Some(txn) => {
                        let idx = partition_for(&txn.user_id, worker_count);
                        queues[idx].push(txn);
                    }
                    None => {
                        info!("inbound transaction channel closed");
                        break;
                    }
                }
            }
        }
    }

    let deadline = tokio::time::Instant::now() + shutdown_deadline;
    loop {
        if queues.iter().all(|q| q.is_empty()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("pipeline shutdown deadline reached, abandoning remaining in-flight work");
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    for worker in workers {
        worker.abort();
    }
    info!("pipeline shut down");
}

/// One event through the full scoring/enrichment/persistence path. History
/// is always snapshotted (inside [`features::extract`]) before it is
/// appended here, which is what yields the features-before-self invariant:
/// a transaction's own vector never reflects itself.
async fn process_one(engine: &Engine, txn: Transaction) {
    let feature_vector = features::extract(&txn, &engine.history);

    let entry = HistoryEntry::from(&txn);
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
    let feature_map = feature_vector.to_map();

    let mut ai_explanation = None;
    let mut risk_factors = None;
    let mut recommendations = None;

    if is_fraud {
        if let Some(explainer) = &engine.explainer {
            let importance = scorer::feature_importance(&feature_vector);
            let explanation = explainer
                .explain(&txn.transaction_id, score.probability, band, &feature_map, &importance)
                .await;

            let explanation_payload = serde_json::json!({
                "transaction_id": txn.transaction_id,
                "narrative": explanation.narrative,
                "risk_factors": explanation.risk_factors,
                "recommendations": explanation.recommendations,
            });
            if let Some(publisher) = &engine.publisher {
                publisher
                    .publish(&engine.config.redis_explanations_stream, &explanation_payload.to_string())
                    .await;
            }

            ai_explanation = Some(explanation.narrative);
            risk_factors = Some(explanation.risk_factors);
            recommendations = Some(explanation.recommendations);
        }
    }

    let enriched = EnrichedResult {
        transaction_id: txn.transaction_id.clone(),
        user_id: txn.user_id.clone(),
        amount: txn.amount,
        transaction_type: txn.transaction_type,
        merchant_id: txn.merchant_id.clone(),
        timestamp: txn.timestamp,
        fraud_probability: score.probability,
        risk_level: band,
        is_fraud,
        features: feature_map,
        model_used,
        ai_explanation,
        risk_factors,
        recommendations,
    };

    engine.ring.push(enriched.clone());

    if let Some(storage) = &engine.storage {
        crate::persistence::save_with_deadline(storage.as_ref(), &enriched, engine.config.persist_deadline()).await;
    }

    if let Some(publisher) = &engine.publisher {
        let payload = serde_json::to_string(&enriched).unwrap_or_default();
        publisher.publish(&engine.config.redis_results_stream, &payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::Engine;
    use crate::config::EngineConfig;
    use crate::explainer::ExplainerMode;
    use crate::persistence::PersistenceError;
    use crate::persistence::Storage;
    use crate::scorer::Scorer;
    use crate::types::{EnrichedResult as ER, TransactionType};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingStorage {
        saved: StdMutex<Vec<ER>>,
    }

    #[async_trait]
    impl Storage for CountingStorage {
        async fn save(&self, result: &ER) -> Result<(), PersistenceError> {
            self.saved.lock().unwrap().push(result.clone());
            Ok(())
        }
        async fn stats(&self) -> Result<crate::persistence::StorageStats, PersistenceError> {
            unimplemented!()
        }
        async fn recent(&self, _: i64) -> Result<Vec<ER>, PersistenceError> {
            unimplemented!()
        }
    }

    fn txn(user_id: &str, amount: f64) -> Transaction {
        Transaction {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            currency: "USD".to_string(),
            transaction_type: TransactionType::Payment,
            merchant_id: None,
            merchant_category: None,
            location: None,
            ip_address: None,
            device_id: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    async fn test_engine() -> (Arc<Engine>, Arc<CountingStorage>) {
        let config = EngineConfig::default();
        let storage = Arc::new(CountingStorage { saved: StdMutex::new(Vec::new()) });
        let engine = Arc::new(Engine::new(
            config,
            Scorer::new(),
            Some(crate::explainer::Explainer::new(ExplainerMode::Template)),
            Some(storage.clone() as Arc<dyn Storage>),
            None,
        ));
        (engine, storage)
    }

    #[tokio::test]
    async fn per_user_order_is_preserved_through_one_partition() {
        let (engine, _storage) = test_engine().await;
        let queue = Arc::new(PartitionQueue::new(16));
        let seen = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            queue.push(txn("same-user", 10.0 + i as f64));
        }

        for _ in 0..5 {
            let t = queue.pop().await;
            let expected = 10.0 + seen.fetch_add(1, Ordering::SeqCst) as f64;
            assert!((t.amount - expected).abs() < 1e-9);
            process_one(&engine, t).await;
        }
    }

    #[test]
    fn partition_assignment_is_stable_for_same_user() {
        assert_eq!(partition_for("alice", 8), partition_for("alice", 8));
    }

    #[tokio::test]
    async fn process_one_appends_to_ring_and_persists() {
        let (engine, storage) = test_engine().await;
        process_one(&engine, txn("u1", 50.0)).await;
        assert_eq!(engine.ring.len(), 1);
        assert_eq!(storage.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn high_amount_triggers_explanation_fields() {
        let (engine, _storage) = test_engine().await;
        process_one(&engine, txn("u2", 800.0)).await;
        let recent = engine.ring.recent(1);
        assert!(recent[0].is_fraud);
        assert!(recent[0].ai_explanation.is_some());
        assert!(recent[0].risk_factors.is_some());
    }
}
