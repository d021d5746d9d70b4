//! Engine configuration and rule definitions.
//!
//! All thresholds that shape engine behavior live here with serde
//! defaults, so a config file only needs to name what it overrides.
//! Rule definitions are data, not code: a typed condition evaluated by
//! a pure function in signals.rs.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

// ── Engine tunables ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Attribution
    /// Days of spend preceding a conversion that earn weighted credit.
    pub attribution_window_days: u32,
    /// Minimum touchpoint paths before the Markov model is trusted;
    /// below this the estimator falls back to weighted credit.
    pub markov_min_paths: usize,

    // MMM
    pub adstock_half_life: f64,
    pub ridge_alpha: f64,
    pub saturation: SaturationKind,
    /// Minimum observations before a fit is attempted at all.
    pub mmm_min_samples: usize,
    /// R² below this marks the whole fit low-confidence.
    pub mmm_low_r2: f64,
    pub mmm_lookback_days: u32,

    // Disagreement
    pub disagreement_threshold: f64,
    /// Per-channel |mta - mmm| share delta that flags a conflict.
    pub channel_conflict_threshold: f64,
    /// Confidence multiplier applied to insights generated while the
    /// disagreement monitor flagged instability.
    pub instability_confidence_penalty: f64,

    // Anomaly ingestion
    pub anomaly_score_threshold: f64,

    // Ranking. The normalization of the four priority factors is not
    // fixed upstream; these are the documented defaults.
    /// Currency scale for squashing impact estimates into [0, 1]:
    /// impact_norm = 1 - exp(-|estimate| / impact_scale).
    pub impact_scale: f64,
    pub severity_weights: SeverityWeights,
    pub top_insights_n: usize,

    // Suppression
    pub cooldown_days: i64,
    pub min_priority_score: f64,
    /// Minimum absolute expected-impact estimate (currency units).
    pub impact_threshold: f64,

    // Upstream read discipline
    pub source_retry_attempts: u32,
    pub source_retry_backoff_ms: u64,
    pub source_deadline_ms: u64,

    // Optimizer
    /// Greedy allocation step as a fraction of total budget.
    pub optimizer_step_pct: f64,
    /// Below this fit confidence the optimizer refuses to reallocate.
    pub optimizer_stability_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attribution_window_days: 7,
            markov_min_paths: 10,
            adstock_half_life: 7.0,
            ridge_alpha: 1.0,
            saturation: SaturationKind::Log,
            mmm_min_samples: 14,
            mmm_low_r2: 0.3,
            mmm_lookback_days: 90,
            disagreement_threshold: 0.25,
            channel_conflict_threshold: 0.30,
            instability_confidence_penalty: 0.8,
            anomaly_score_threshold: 2.0,
            impact_scale: 1000.0,
            severity_weights: SeverityWeights::default(),
            top_insights_n: 5,
            cooldown_days: 5,
            min_priority_score: 0.05,
            impact_threshold: 0.01,
            source_retry_attempts: 3,
            source_retry_backoff_ms: 250,
            source_deadline_ms: 10_000,
            optimizer_step_pct: 0.01,
            optimizer_stability_threshold: 0.3,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &str) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Other(anyhow::anyhow!("read {path}: {e}")))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Severity weights for the priority product. All values in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            low: 0.25,
            medium: 0.5,
            high: 0.75,
            critical: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SaturationKind {
    /// log(1 + x) — the default diminishing-returns transform.
    Log,
    /// Hill transform: x^alpha / (x^alpha + half_saturation^alpha).
    Hill { alpha: f64, half_saturation: f64 },
}

impl SaturationKind {
    /// The scalar recorded in mmm_result.saturation_param.
    pub fn param(&self) -> f64 {
        match self {
            SaturationKind::Log => 0.0,
            SaturationKind::Hill { alpha, .. } => *alpha,
        }
    }
}

// ── Rule definitions ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDef {
    pub id: String,
    pub insight_type: String,
    pub metric: String,
    pub op: CompareOp,
    pub value: f64,
    #[serde(default)]
    pub min_spend: Option<f64>,
    #[serde(default)]
    pub min_sessions: Option<f64>,
    /// How certain a match of this rule is on its own, in [0, 1].
    pub certainty: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    rules: Vec<RuleDef>,
}

/// Load rule definitions from a JSON file.
pub fn load_rules(path: &str) -> EngineResult<Vec<RuleDef>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Other(anyhow::anyhow!("read {path}: {e}")))?;
    let file: RulesFile = serde_json::from_str(&raw)?;
    Ok(file.rules)
}

/// Built-in rule set, mirroring config/rules.json. Used when no rules
/// file is supplied (tests, build_test engines).
pub fn default_rules() -> Vec<RuleDef> {
    vec![
        RuleDef {
            id: "waste_zero_revenue".into(),
            insight_type: "waste_zero_revenue".into(),
            metric: "revenue".into(),
            op: CompareOp::Eq,
            value: 0.0,
            min_spend: Some(100.0),
            min_sessions: None,
            certainty: 0.9,
        },
        RuleDef {
            id: "roas_decline_28d".into(),
            insight_type: "roas_decline".into(),
            metric: "roas_pct_delta_28d".into(),
            op: CompareOp::Lte,
            value: -0.3,
            min_spend: Some(50.0),
            min_sessions: None,
            certainty: 0.82,
        },
        RuleDef {
            id: "conversion_rate_drop".into(),
            insight_type: "conversion_drop".into(),
            metric: "conversion_rate".into(),
            op: CompareOp::Lt,
            value: 0.005,
            min_spend: None,
            min_sessions: Some(500.0),
            certainty: 0.78,
        },
        RuleDef {
            id: "scale_opportunity".into(),
            insight_type: "scale_opportunity".into(),
            metric: "roas_pct_delta_28d".into(),
            op: CompareOp::Gte,
            value: 0.25,
            min_spend: Some(50.0),
            min_sessions: None,
            certainty: 0.8,
        },
        RuleDef {
            id: "funnel_leak".into(),
            insight_type: "funnel_leak".into(),
            metric: "ctr".into(),
            op: CompareOp::Lt,
            value: 0.002,
            min_spend: Some(50.0),
            min_sessions: None,
            certainty: 0.77,
        },
    ]
}
