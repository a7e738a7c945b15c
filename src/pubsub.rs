// =============================================================================
// Pub/sub adapter -- Redis channel subscribe/publish, reconnect with backoff
// =============================================================================
//
// Two halves: a transaction subscriber that decodes inbound JSON and forwards
// it into the pipeline's dispatch channel, and a publisher used for both the
// results channel and the secondary explanations channel. Neither half ever
// propagates a transport error to its caller -- reconnection and retry happen
// here so the pipeline only ever sees a stream of already-decoded work.
//
// =============================================================================

use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::types::Transaction;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const PUBLISH_RETRY_BASE: Duration = Duration::from_millis(200);
const PUBLISH_RETRY_ATTEMPTS: u32 = 5;

/// Subscribes to `channel` on `redis_url`, decoding each message as a
/// [`Transaction`] and forwarding it on `out`. Malformed payloads are logged
/// and dropped -- the subscriber never crashes on one bad message. On any
/// connection failure it reconnects after [`RECONNECT_BACKOFF`]; it only
/// returns once `shutdown` fires or `out` is dropped.
pub async fn run_transaction_subscriber(
    redis_url: String,
    channel: String,
    out: mpsc::Sender<Transaction>,
    mut shutdown: broadcast::Receiver<()>,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("transaction subscriber stopping on shutdown signal");
                connected.store(false, std::sync::atomic::Ordering::Relaxed);
                return;
            }
            result = subscribe_once(&redis_url, &channel, &out, &mut shutdown, &connected) => {
                connected.store(false, std::sync::atomic::Ordering::Relaxed);
                match result {
                    Ok(()) => {
                        info!("transaction subscriber stopped");
                        return;
                    }
                    Err(err) => {
                        error!(error = %err, "transaction subscriber disconnected, reconnecting");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }
    }
}

async fn subscribe_once(
    redis_url: &str,
    channel: &str,
    out: &mpsc::Sender<Transaction>,
    shutdown: &mut broadcast::Receiver<()>,
    connected: &std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    connected.store(true, std::sync::atomic::Ordering::Relaxed);
    info!(channel, "subscribed to transaction channel");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            msg = stream.next() => {
                let Some(msg) = msg else {
                    anyhow::bail!("pubsub stream ended unexpectedly");
                };
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(error = %err, "non-text pubsub payload, dropping");
                        continue;
                    }
                };
                match serde_json::from_str::<Transaction>(&payload) {
                    Ok(txn) => {
                        if out.send(txn).await.is_err() {
                            // Pipeline dispatcher has shut down; nothing left to feed.
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to decode transaction payload, dropping");
                    }
                }
            }
        }
    }
}

/// Publishes JSON payloads to Redis channels, retrying with exponential
/// backoff up to a small bound before dropping the message and logging.
/// Wraps a [`ConnectionManager`], which already reconnects transparently on
/// the next command after a dropped connection.
#[derive(Clone)]
pub struct RedisPublisher {
    manager: ConnectionManager,
}

impl RedisPublisher {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    /// Publish `payload` on `channel`. Never returns an error to the caller:
    /// after [`PUBLISH_RETRY_ATTEMPTS`] failures the message is logged and
    /// dropped rather than blocking the pipeline indefinitely.
    pub async fn publish(&self, channel: &str, payload: &str) {
        let mut attempt: u32 = 0;
        loop {
            let mut conn = self.manager.clone();
            let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn)
                .await;

            match result {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    if attempt >= PUBLISH_RETRY_ATTEMPTS {
                        error!(channel, error = %err, attempt, "publish failed permanently, dropping message");
                        return;
                    }
                    let backoff = PUBLISH_RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(channel, error = %err, attempt, ?backoff, "publish failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionType;
    use chrono::Utc;

    fn sample_payload() -> String {
        serde_json::json!({
            "transaction_id": "t1",
            "user_id": "u1",
            "amount": 42.0,
            "transaction_type": "payment",
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string()
    }

    #[test]
    fn sample_payload_decodes_as_transaction() {
        let txn: Transaction = serde_json::from_str(&sample_payload()).unwrap();
        assert_eq!(txn.transaction_id, "t1");
        assert_eq!(txn.transaction_type, TransactionType::Payment);
    }

    #[test]
    fn malformed_payload_fails_to_decode_without_panicking() {
        let result: Result<Transaction, _> = serde_json::from_str("not json");
        assert!(result.is_err());
    }
}
