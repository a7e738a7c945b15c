// =============================================================================
// Explainer -- template narrative generator with an optional remote backend
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::warn;

use crate::types::{Explanation, RiskBand};

/// Default ceiling on the remote explainer call, used when a caller
/// constructs an [`Explainer`] via [`Explainer::new`] rather than
/// [`Explainer::with_timeout`]. Any failure -- timeout, non-2xx, disconnect,
/// decode error -- falls back to template mode and is logged once; it is
/// never surfaced as an error to the pipeline.
const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-band catalog of narrative templates. Selection among entries within a
/// band is unspecified by contract; this implementation rotates
/// deterministically so repeated runs are reproducible for tests.
static NARRATIVE_TEMPLATES: Lazy<BTreeMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    let mut m = BTreeMap::new();
    m.insert(
        "critical",
        vec![
            "CRITICAL FRAUD ALERT: multiple high-risk indicators present, including a velocity anomaly and a large deviation from baseline spending. Immediate intervention recommended.",
            "SEVERE RISK DETECTED: this transaction matches a sophisticated fraud pattern -- rapid velocity, large amount deviation, and suspicious network signals. Recommend immediate account freeze.",
            "HIGH-CONFIDENCE FRAUD: several critical anomalies converge on this transaction, led by an extreme deviation from the user's historical baseline combined with a velocity spike.",
        ],
    );
    m.insert(
        "high",
        vec![
            "HIGH RISK TRANSACTION: amount and velocity both deviate meaningfully from the user's established pattern. Manual review recommended.",
            "ELEVATED FRAUD RISK: a suspicious spending spike combined with rapid successive transactions. Enhanced verification recommended.",
            "FRAUD PROBABILITY ELEVATED: the transaction shows a notable deviation from baseline alongside elevated recent transaction velocity. Additional authentication suggested.",
        ],
    );
    m.insert(
        "medium",
        vec![
            "MODERATE RISK DETECTED: some unusual characteristics present, but the transaction may still be legitimate. Standard verification protocols apply.",
            "STATISTICAL ANOMALY: this transaction deviates somewhat from typical user behavior, though other indicators are within range. Monitor closely.",
            "CAUTION ADVISED: minor irregularities flagged in transaction velocity and amount. Routine security checks recommended.",
        ],
    );
    m.insert(
        "low",
        vec![
            "LOW RISK TRANSACTION: this transaction aligns with the user's normal behavior patterns across all evaluated indicators. No action required.",
            "LEGITIMATE TRANSACTION: amount, timing, and velocity are all consistent with the user's history.",
            "NORMAL ACTIVITY: no anomalies detected across the evaluated risk dimensions. Approve transaction.",
        ],
    );
    m
});

/// Per-band canonical recommendation lists, adapted from the enhanced
/// recommendation generator: block/hold/review/allow plus ancillary actions.
fn recommendations_for(band: RiskBand, features: &BTreeMap<String, f64>, probability: f64) -> Vec<String> {
    let amount = features.get("amount").copied().unwrap_or(0.0);
    let txns_last_hour = features.get("txns_last_hour").copied().unwrap_or(0.0);
    let amount_vs_avg = features.get("amount_vs_avg").copied().unwrap_or(1.0);

    match band {
        RiskBand::Critical => vec![
            format!("IMMEDIATE BLOCK - fraud confidence {:.0}%", probability * 100.0),
            "FREEZE ACCOUNT - suspend all transactions pending investigation".to_string(),
            "CONTACT CUSTOMER - call verified number within 15 minutes".to_string(),
            "DEEP INVESTIGATION - review all activity from the last 7 days".to_string(),
            "LAW ENFORCEMENT - prepare a fraud report if confirmed".to_string(),
            format!("AMOUNT ALERT - transaction ${:.0} exceeds safe limits", amount),
        ],
        RiskBand::High => vec![
            format!("HOLD TRANSACTION - {:.0}% fraud probability", probability * 100.0),
            "2FA REQUIRED - send a verification code to the registered device".to_string(),
            "ENHANCED VERIFICATION - request additional identity proof".to_string(),
            "ACTIVITY REVIEW - check the last 48 hours for anomalies".to_string(),
            "FRAUD TEAM ALERT - queue for specialist review".to_string(),
            format!("VELOCITY CHECK - {} txns/hour is unusual", txns_last_hour as i64),
        ],
        RiskBand::Medium => vec![
            format!("ENHANCED MONITORING - risk score {:.0}%", probability * 100.0),
            "CUSTOMER NOTIFICATION - send a security alert email".to_string(),
            "CONDITIONAL APPROVAL - allow with increased logging".to_string(),
            "PATTERN TRACKING - add to the behavioral analysis queue".to_string(),
            "DAILY REVIEW - include in tomorrow's audit batch".to_string(),
            format!(
                "THRESHOLD CHECK - ${:.0} is near the user's {:.1}x limit",
                amount, amount_vs_avg
            ),
        ],
        RiskBand::Low => vec![
            format!("APPROVE - low risk ({:.0}% fraud probability)", probability * 100.0),
            "STANDARD MONITORING - normal fraud detection protocols".to_string(),
            "DATA LOGGING - record for model training".to_string(),
            "PROFILE UPDATE - adjust the user's spending baseline".to_string(),
            "NO ACTION REQUIRED - transaction within normal parameters".to_string(),
        ],
    }
}

/// Format the top-N features by importance as `"<name>: <value:.3f>"`.
fn risk_factors(features: &BTreeMap<String, f64>, importance: &BTreeMap<String, f64>, top_n: usize) -> Vec<String> {
    let mut ranked: Vec<(&String, &f64)> = importance.iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
        .into_iter()
        .take(top_n)
        .map(|(name, _imp)| {
            let value = features.get(name).copied().unwrap_or(0.0);
            format!("{name}: {value:.3}")
        })
        .collect()
}

#[derive(Debug, Clone)]
pub enum ExplainerMode {
    Template,
    Remote { url: String, model: String },
}

/// Produces [`Explanation`]s for `is_fraud` events. Template mode never
/// touches the network; remote mode attempts an external call under a hard
/// deadline and falls back to template mode on any failure.
pub struct Explainer {
    mode: ExplainerMode,
    client: reqwest::Client,
    rotation: AtomicUsize,
    remote_timeout: Duration,
}

#[derive(Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    response: String,
}

impl Explainer {
    pub fn new(mode: ExplainerMode) -> Self {
        Self::with_timeout(mode, DEFAULT_REMOTE_TIMEOUT)
    }

    pub fn with_timeout(mode: ExplainerMode, remote_timeout: Duration) -> Self {
        Self {
            mode,
            client: reqwest::Client::new(),
            rotation: AtomicUsize::new(0),
            remote_timeout,
        }
    }

    /// Produce an explanation for a scored, fraud-flagged transaction.
    pub async fn explain(
        &self,
        transaction_id: &str,
        probability: f64,
        band: RiskBand,
        features: &BTreeMap<String, f64>,
        importance: &BTreeMap<String, f64>,
    ) -> Explanation {
        match &self.mode {
            ExplainerMode::Template => self.template_explanation(probability, band, features, importance),
            ExplainerMode::Remote { url, model } => {
                match tokio::time::timeout(
                    self.remote_timeout,
                    self.remote_call(url, model, probability, band, features, importance),
                )
                .await
                {
                    Ok(Ok(explanation)) => explanation,
                    Ok(Err(err)) => {
                        warn!(transaction_id, error = %err, "remote explainer call failed, falling back to template");
                        self.template_explanation(probability, band, features, importance)
                    }
                    Err(_) => {
                        warn!(transaction_id, "remote explainer call timed out, falling back to template");
                        self.template_explanation(probability, band, features, importance)
                    }
                }
            }
        }
    }

    fn template_explanation(
        &self,
        probability: f64,
        band: RiskBand,
        features: &BTreeMap<String, f64>,
        importance: &BTreeMap<String, f64>,
    ) -> Explanation {
        let key = band.to_string();
        let templates = NARRATIVE_TEMPLATES.get(key.as_str()).expect("all bands have a catalog entry");
        let idx = self.rotation.fetch_add(1, Ordering::Relaxed) % templates.len();
        let narrative = templates[idx].to_string();

        Explanation {
            narrative,
            risk_factors: risk_factors(features, importance, 5),
            recommendations: recommendations_for(band, features, probability),
        }
    }

    async fn remote_call(
        &self,
        url: &str,
        model: &str,
        probability: f64,
        band: RiskBand,
        features: &BTreeMap<String, f64>,
        importance: &BTreeMap<String, f64>,
    ) -> anyhow::Result<Explanation> {
        let prompt = build_prompt(probability, band, features, importance);
        let response = self
            .client
            .post(format!("{url}/api/generate"))
            .json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("remote explainer returned status {}", response.status());
        }

        let parsed: RemoteResponse = response.json().await?;
        let narrative = parsed.response.trim().to_string();
        if narrative.is_empty() {
            anyhow::bail!("remote explainer returned an empty response");
        }

        Ok(Explanation {
            narrative,
            risk_factors: risk_factors(features, importance, 5),
            recommendations: recommendations_for(band, features, probability),
        })
    }
}

fn build_prompt(
    probability: f64,
    band: RiskBand,
    features: &BTreeMap<String, f64>,
    importance: &BTreeMap<String, f64>,
) -> String {
    let factors = risk_factors(features, importance, 5).join("\n");
    format!(
        "As a fraud detection analyst, analyze this transaction:\n\nFRAUD RISK: {:.1}% ({} RISK)\n\nTOP RISK INDICATORS:\n{}\n\nProvide a brief 2-3 sentence explanation of why this is {} risk and what action to take.",
        probability * 100.0,
        band.to_string().to_uppercase(),
        factors,
        band
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_features() -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("amount".to_string(), 800.0);
        m.insert("amount_vs_avg".to_string(), 8.0);
        m.insert("txns_last_hour".to_string(), 6.0);
        m
    }

    fn sample_importance() -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("amount".to_string(), 0.9);
        m.insert("amount_vs_avg".to_string(), 0.7);
        m.insert("txns_last_hour".to_string(), 0.5);
        m
    }

    #[tokio::test]
    async fn template_mode_produces_all_field_shapes() {
        let explainer = Explainer::new(ExplainerMode::Template);
        let explanation = explainer
            .explain("t1", 0.9, RiskBand::Critical, &sample_features(), &sample_importance())
            .await;
        assert!(!explanation.narrative.is_empty());
        assert!(!explanation.risk_factors.is_empty());
        assert!(!explanation.recommendations.is_empty());
    }

    #[tokio::test]
    async fn remote_mode_falls_back_to_template_on_connection_failure() {
        let explainer = Explainer::new(ExplainerMode::Remote {
            url: "http://127.0.0.1:1".to_string(),
            model: "test-model".to_string(),
        });
        let explanation = explainer
            .explain("t1", 0.9, RiskBand::High, &sample_features(), &sample_importance())
            .await;
        assert!(!explanation.narrative.is_empty());
        assert!(!explanation.recommendations.is_empty());
    }

    #[test]
    fn risk_factors_are_sorted_by_importance_descending() {
        let factors = risk_factors(&sample_features(), &sample_importance(), 5);
        assert!(factors[0].starts_with("amount:"));
    }

    #[test]
    fn recommendations_differ_by_band() {
        let critical = recommendations_for(RiskBand::Critical, &sample_features(), 0.9);
        let low = recommendations_for(RiskBand::Low, &sample_features(), 0.1);
        assert_ne!(critical, low);
        assert!(critical[0].contains("BLOCK"));
        assert!(low[0].contains("APPROVE"));
    }

    #[test]
    fn every_band_has_a_narrative_catalog_entry() {
        for band in [RiskBand::Low, RiskBand::Medium, RiskBand::High, RiskBand::Critical] {
            assert!(NARRATIVE_TEMPLATES.contains_key(band.to_string().as_str()));
        }
    }
}
