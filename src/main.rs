// =============================================================================
// Fraud Risk Engine — Main Entry Point
// =============================================================================
//
// Wiring order: load config, connect optional persistence and the results
// publisher, build the engine, then start the transaction subscriber and the
// pipeline before the HTTP facade. A Ctrl+C signal stops the subscriber and
// the pipeline's dispatch loop, which drains in-flight work up to the
// configured shutdown deadline before the process exits.
// =============================================================================

mod api;
mod app_state;
mod config;
mod explainer;
mod features;
mod history;
mod persistence;
mod pipeline;
mod pubsub;
mod ring;
mod scorer;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::Engine;
use crate::config::{AiReasoningMode, EngineConfig};
use crate::explainer::{Explainer, ExplainerMode};
use crate::persistence::{PostgresStorage, Storage};
use crate::pubsub::RedisPublisher;
use crate::scorer::Scorer;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("fraud risk engine starting up");

    let config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load engine config, using defaults");
        EngineConfig::default()
    });
    if let Err(e) = config.save(CONFIG_PATH) {
        warn!(error = %e, "failed to persist merged engine config");
    }

    // Persistence is off the hot path by design: a database that is
    // configured but unreachable degrades the service rather than blocking
    // startup. Only `/stats` and `/recent` lose the long-term view; the
    // streaming pipeline keeps working off the Recent Ring.
    let storage: Option<Arc<dyn Storage>> = match &config.database_url {
        Some(url) => match PostgresStorage::connect(url).await {
            Ok(store) => {
                info!("connected to postgres storage");
                Some(Arc::new(store) as Arc<dyn Storage>)
            }
            Err(e) => {
                error!(error = %e, "failed to connect to postgres, running without persistence");
                None
            }
        },
        None => {
            info!("no database_url configured, running without persistence");
            None
        }
    };

    let publisher = match RedisPublisher::connect(&config.redis_url).await {
        Ok(publisher) => Some(publisher),
        Err(e) => {
            error!(error = %e, "failed to connect redis publisher, results will not be published");
            None
        }
    };

    let explainer = if config.enable_ai_reasoning {
        let mode = match config.ai_reasoning_mode {
            AiReasoningMode::Remote => match (&config.remote_explainer_url, &config.remote_explainer_model) {
                (Some(url), Some(model)) => ExplainerMode::Remote { url: url.clone(), model: model.clone() },
                _ => {
                    warn!("remote explainer mode selected but url/model missing, falling back to template");
                    ExplainerMode::Template
                }
            },
            AiReasoningMode::Template => ExplainerMode::Template,
        };
        Some(Explainer::with_timeout(mode, config.explain_deadline()))
    } else {
        None
    };

    let worker_count = config.worker_count();
    let queue_capacity = config.pipeline_queue_capacity;
    let shutdown_deadline = config.shutdown_deadline();
    let bind_addr = config.bind_addr.clone();
    let redis_url = config.redis_url.clone();
    let redis_stream_name = config.redis_stream_name.clone();

    let engine = Arc::new(Engine::new(config, Scorer::new(), explainer, storage, publisher));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(queue_capacity * worker_count.max(1));

    let subscriber_handle = tokio::spawn(pubsub::run_transaction_subscriber(
        redis_url,
        redis_stream_name,
        inbound_tx,
        shutdown_tx.subscribe(),
        engine.redis_connected.clone(),
    ));

    let pipeline_engine = engine.clone();
    let pipeline_shutdown = shutdown_tx.subscribe();
    let pipeline_handle = tokio::spawn(async move {
        pipeline::run(
            pipeline_engine,
            inbound_rx,
            worker_count,
            queue_capacity,
            pipeline_shutdown,
            shutdown_deadline,
        )
        .await;
    });

    let api_engine = engine.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_engine);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind facade listener");
                return;
            }
        };
        info!(addr = %bind_addr, "facade listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "facade server failed");
        }
    });

    info!(worker_count, queue_capacity, "pipeline running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, draining pipeline");

    let _ = shutdown_tx.send(());
    let _ = subscriber_handle.await;
    let _ = pipeline_handle.await;

    info!("fraud risk engine shut down complete");
    Ok(())
}
