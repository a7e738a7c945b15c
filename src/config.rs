// =============================================================================
// Configuration -- environment variables override a JSON file on disk
// =============================================================================
//
// Every tunable lives here. All fields carry `#[serde(default)]` so adding a
// field never breaks loading an older config file. Environment variables are
// applied on top of the file contents (or the built-in defaults if no file
// exists yet), then the merged result is saved back atomically so the file
// always reflects the configuration actually in effect.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_transactions_topic() -> String {
    "transactions".to_string()
}

fn default_results_topic() -> String {
    "fraud_results".to_string()
}

fn default_explanations_topic() -> String {
    "fraud_explanations".to_string()
}

fn default_model_type() -> String {
    "pretrained_lr".to_string()
}

fn default_fraud_threshold() -> f64 {
    0.35
}

fn default_true() -> bool {
    true
}

fn default_feature_window() -> usize {
    1000
}

fn default_app_name() -> String {
    "Fraud Detection Engine".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_recent_ring_capacity() -> usize {
    500
}

fn default_pipeline_queue_capacity() -> usize {
    256
}

fn default_shutdown_deadline_secs() -> u64 {
    5
}

fn default_persist_deadline_secs() -> u64 {
    2
}

fn default_explain_deadline_secs() -> u64 {
    30
}

/// Which explanation backend the engine starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiReasoningMode {
    Template,
    Remote,
}

impl Default for AiReasoningMode {
    fn default() -> Self {
        Self::Template
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_transactions_topic")]
    pub redis_stream_name: String,
    #[serde(default = "default_results_topic")]
    pub redis_results_stream: String,
    #[serde(default = "default_explanations_topic")]
    pub redis_explanations_stream: String,

    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default = "default_fraud_threshold")]
    pub fraud_threshold: f64,

    #[serde(default = "default_true")]
    pub enable_ai_reasoning: bool,
    #[serde(default)]
    pub ai_reasoning_mode: AiReasoningMode,
    #[serde(default)]
    pub remote_explainer_url: Option<String>,
    #[serde(default)]
    pub remote_explainer_model: Option<String>,

    #[serde(default = "default_feature_window")]
    pub feature_window: usize,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_recent_ring_capacity")]
    pub recent_ring_capacity: usize,
    #[serde(default)]
    pub pipeline_worker_count: Option<usize>,
    #[serde(default = "default_pipeline_queue_capacity")]
    pub pipeline_queue_capacity: usize,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_persist_deadline_secs")]
    pub persist_deadline_secs: u64,
    #[serde(default = "default_explain_deadline_secs")]
    pub explain_deadline_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            bind_addr: default_bind_addr(),
            redis_url: default_redis_url(),
            redis_stream_name: default_transactions_topic(),
            redis_results_stream: default_results_topic(),
            redis_explanations_stream: default_explanations_topic(),
            model_type: default_model_type(),
            model_path: None,
            fraud_threshold: default_fraud_threshold(),
            enable_ai_reasoning: true,
            ai_reasoning_mode: AiReasoningMode::default(),
            remote_explainer_url: None,
            remote_explainer_model: None,
            feature_window: default_feature_window(),
            database_url: None,
            recent_ring_capacity: default_recent_ring_capacity(),
            pipeline_worker_count: None,
            pipeline_queue_capacity: default_pipeline_queue_capacity(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            persist_deadline_secs: default_persist_deadline_secs(),
            explain_deadline_secs: default_explain_deadline_secs(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` if it exists (else start from defaults), then apply
    /// any matching environment variables on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?
        } else {
            warn!(path = %path.display(), "no config file found, starting from defaults");
            Self::default()
        };

        config.apply_env_overrides();

        info!(
            path = %path.display(),
            redis_url = %config.redis_url,
            model_type = %config.model_type,
            fraud_threshold = config.fraud_threshold,
            "engine config loaded"
        );

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.redis_url = v;
        }
        if let Ok(v) = std::env::var("REDIS_STREAM_NAME") {
            self.redis_stream_name = v;
        }
        if let Ok(v) = std::env::var("REDIS_RESULTS_STREAM") {
            self.redis_results_stream = v;
        }
        if let Ok(v) = std::env::var("MODEL_TYPE") {
            self.model_type = v;
        }
        if let Ok(v) = std::env::var("MODEL_PATH") {
            self.model_path = Some(v);
        }
        if let Ok(v) = std::env::var("FRAUD_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                self.fraud_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("ENABLE_AI_REASONING") {
            if let Ok(parsed) = v.parse() {
                self.enable_ai_reasoning = parsed;
            }
        }
        if let Ok(v) = std::env::var("AI_REASONING_MODE") {
            self.ai_reasoning_mode = match v.as_str() {
                "remote" => AiReasoningMode::Remote,
                _ => AiReasoningMode::Template,
            };
        }
        if let Ok(v) = std::env::var("REMOTE_EXPLAINER_URL") {
            self.remote_explainer_url = Some(v);
        }
        if let Ok(v) = std::env::var("REMOTE_EXPLAINER_MODEL") {
            self.remote_explainer_model = Some(v);
        }
        if let Ok(v) = std::env::var("FEATURE_WINDOW") {
            if let Ok(parsed) = v.parse() {
                self.feature_window = parsed;
            }
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("RECENT_RING_CAPACITY") {
            if let Ok(parsed) = v.parse() {
                self.recent_ring_capacity = parsed;
            }
        }
        if let Ok(v) = std::env::var("PIPELINE_WORKER_COUNT") {
            if let Ok(parsed) = v.parse() {
                self.pipeline_worker_count = Some(parsed);
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to a `.tmp` sibling, then rename) so a crash mid-write never
    /// leaves a corrupt file behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Number of pipeline workers: the configured value, or available
    /// parallelism, or 4 if that cannot be determined.
    pub fn worker_count(&self) -> usize {
        self.pipeline_worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn persist_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.persist_deadline_secs)
    }

    pub fn explain_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.explain_deadline_secs)
    }

    pub fn shutdown_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.redis_url, "redis://localhost:6379");
        assert_eq!(cfg.redis_stream_name, "transactions");
        assert_eq!(cfg.redis_results_stream, "fraud_results");
        assert_eq!(cfg.model_type, "pretrained_lr");
        assert!((cfg.fraud_threshold - 0.35).abs() < f64::EPSILON);
        assert_eq!(cfg.feature_window, 1000);
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.redis_url, "redis://localhost:6379");
        assert_eq!(cfg.recent_ring_capacity, 500);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "fraud_threshold": 0.5 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.fraud_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.model_type, "pretrained_lr");
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.redis_url, cfg2.redis_url);
        assert_eq!(cfg.fraud_threshold, cfg2.fraud_threshold);
    }

    #[test]
    fn worker_count_falls_back_to_available_parallelism() {
        let cfg = EngineConfig::default();
        assert!(cfg.worker_count() >= 1);
    }

    #[test]
    fn worker_count_honors_explicit_override() {
        let mut cfg = EngineConfig::default();
        cfg.pipeline_worker_count = Some(7);
        assert_eq!(cfg.worker_count(), 7);
    }
}
