//! Insight reasoner and ranker — merges raw signals about the same
//! entity into exactly one insight per (entity, root cause), scores it,
//! and prepares it for suppression and persistence.
//!
//! RULES:
//!   - confidence and priority_score are derived, recomputable
//!     functions of the evidence. Never hand-set.
//!   - insight_hash is the idempotency key: identical inputs must
//!     produce identical hashes.

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::signals::{MetricWindow, Signal};
use crate::types::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ── Severity and status ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Severity {
        match s {
            "low" => Severity::Low,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }

    pub fn weight(&self, config: &EngineConfig) -> f64 {
        match self {
            Severity::Low => config.severity_weights.low,
            Severity::Medium => config.severity_weights.medium,
            Severity::High => config.severity_weights.high,
            Severity::Critical => config.severity_weights.critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightStatus {
    New,
    Reviewed,
    Applied,
    Rejected,
}

impl InsightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightStatus::New => "new",
            InsightStatus::Reviewed => "reviewed",
            InsightStatus::Applied => "applied",
            InsightStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> InsightStatus {
        match s {
            "reviewed" => InsightStatus::Reviewed,
            "applied" => InsightStatus::Applied,
            "rejected" => InsightStatus::Rejected,
            _ => InsightStatus::New,
        }
    }
}

// ── Insight ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub metric: String,
    pub value: f64,
    pub baseline: Option<f64>,
    pub period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedImpact {
    pub metric: String,
    pub estimate: f64,
    pub units: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: String,
    pub run_id: String,
    pub entity_type: String,
    pub entity_id: EntityId,
    pub insight_type: String,
    pub summary: String,
    pub explanation: String,
    pub recommendation: String,
    pub expected_impact: ExpectedImpact,
    pub confidence: f64,
    pub evidence: Vec<Evidence>,
    pub detected_by: Vec<String>,
    pub priority_score: f64,
    pub severity: Severity,
    pub insight_hash: String,
    pub disagreement_score: Option<f64>,
    pub status: InsightStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    /// 1-based position after ranking. Computed at read time, never
    /// persisted.
    #[serde(default)]
    pub rank: Option<usize>,
}

// ── Root cause inference ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct RootCause {
    cause: &'static str,
    insight_type: &'static str,
    severity: Severity,
    certainty: f64,
}

/// Signal combinations mapped to root causes, most specific first.
/// Simultaneous ROAS and conversion drops are one funnel/quality issue,
/// not two independent alerts.
const ROOT_CAUSES: &[(&[&str], RootCause)] = &[
    (
        &["conversion_drop", "roas_decline"],
        RootCause {
            cause: "Traffic quality degradation",
            insight_type: "traffic_quality",
            severity: Severity::High,
            certainty: 0.88,
        },
    ),
    (
        &["conversion_drop", "funnel_leak"],
        RootCause {
            cause: "Funnel leakage",
            insight_type: "funnel_issue",
            severity: Severity::High,
            certainty: 0.85,
        },
    ),
    (
        &["waste_zero_revenue"],
        RootCause {
            cause: "Spend with zero revenue",
            insight_type: "waste_zero_revenue",
            severity: Severity::High,
            certainty: 0.90,
        },
    ),
    (
        &["roas_decline"],
        RootCause {
            cause: "ROAS decline vs baseline",
            insight_type: "roas_decline",
            severity: Severity::High,
            certainty: 0.82,
        },
    ),
    (
        &["conversion_drop"],
        RootCause {
            cause: "Conversion rate decline",
            insight_type: "conversion_drop",
            severity: Severity::Medium,
            certainty: 0.78,
        },
    ),
    (
        &["funnel_leak"],
        RootCause {
            cause: "Funnel leakage",
            insight_type: "funnel_leak",
            severity: Severity::Medium,
            certainty: 0.77,
        },
    ),
    (
        &["scale_opportunity"],
        RootCause {
            cause: "Scaling opportunity",
            insight_type: "scale_opportunity",
            severity: Severity::Low,
            certainty: 0.80,
        },
    ),
    (
        &["anomaly"],
        RootCause {
            cause: "Anomaly detected",
            insight_type: "anomaly",
            severity: Severity::Medium,
            certainty: 0.72,
        },
    ),
];

fn infer_root_cause(signal_types: &[String]) -> RootCause {
    for (pattern, cause) in ROOT_CAUSES {
        if pattern.iter().all(|p| signal_types.iter().any(|s| s == p)) {
            return *cause;
        }
    }
    if signal_types.is_empty() {
        RootCause {
            cause: "Unknown",
            insight_type: "unknown",
            severity: Severity::Low,
            certainty: 0.5,
        }
    } else {
        RootCause {
            cause: "Multiple signals",
            insight_type: "multiple_signals",
            severity: Severity::Medium,
            certainty: 0.70,
        }
    }
}

fn recommendation_for(signal_types: &[String], severity: Severity) -> String {
    let has = |t: &str| signal_types.iter().any(|s| s == t);
    if has("waste_zero_revenue") || has("roas_decline") {
        "Reduce spend by 25% and review targeting.".to_string()
    } else if has("scale_opportunity") {
        "Increase budget by 15-20% on top performers.".to_string()
    } else if has("conversion_drop") || has("funnel_leak") {
        "Audit landing pages and audience overlap.".to_string()
    } else if severity >= Severity::High {
        "Review campaign and pause or reallocate budget.".to_string()
    } else {
        "Monitor and reassess in 7 days.".to_string()
    }
}

// ── Impact estimation ────────────────────────────────────────────────

/// Expected-impact estimate from the evaluation window. Estimates are
/// non-negative magnitudes in currency units; the metric names what
/// would move.
pub fn estimate_impact(insight_type: &str, window: Option<&MetricWindow>) -> ExpectedImpact {
    let (spend, revenue, roas, roas_baseline) = match window {
        Some(w) => (
            w.spend,
            w.revenue,
            w.roas.unwrap_or(0.0),
            w.roas_28d_avg.unwrap_or(0.0),
        ),
        None => (0.0, 0.0, 0.0, 0.0),
    };
    match insight_type {
        "waste_zero_revenue" => ExpectedImpact {
            metric: "savings".into(),
            estimate: spend,
            units: "currency".into(),
        },
        "roas_decline" | "traffic_quality" => ExpectedImpact {
            metric: "revenue".into(),
            estimate: ((roas_baseline - roas) * spend).max(0.0),
            units: "currency".into(),
        },
        "scale_opportunity" => ExpectedImpact {
            metric: "revenue".into(),
            estimate: ((roas - roas_baseline) * spend * 0.5).max(0.0),
            units: "currency".into(),
        },
        "funnel_leak" | "funnel_issue" | "conversion_drop" => ExpectedImpact {
            metric: "revenue".into(),
            estimate: revenue * 0.1,
            units: "currency".into(),
        },
        _ => ExpectedImpact {
            metric: "revenue".into(),
            estimate: 0.0,
            units: "currency".into(),
        },
    }
}

// ── Scoring ──────────────────────────────────────────────────────────

/// Recency weight in [0, 1] from insight age.
pub fn recency_weight(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_days();
    match age_days {
        d if d <= 1 => 1.0,
        d if d <= 7 => 0.9,
        d if d <= 28 => 0.7,
        _ => 0.5,
    }
}

/// Normalize an impact estimate (currency) into [0, 1].
pub fn impact_norm(estimate: f64, config: &EngineConfig) -> f64 {
    1.0 - (-estimate.abs() / config.impact_scale).exp()
}

/// priority = impact_norm × confidence × recency × severity_weight,
/// every factor in [0, 1], so the product is in [0, 1].
pub fn priority_score(
    impact_estimate: f64,
    confidence: f64,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    severity: Severity,
    config: &EngineConfig,
) -> f64 {
    impact_norm(impact_estimate, config)
        * confidence.clamp(0.0, 1.0)
        * recency_weight(created_at, now)
        * severity.weight(config)
}

/// Deterministic idempotency key for (detector, entity, period).
pub fn insight_hash(insight_type: &str, entity_type: &str, entity_id: &str, period: &str) -> String {
    let raw = format!("{insight_type}|{entity_type}|{entity_id}|{period}");
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

// ── Reasoning ────────────────────────────────────────────────────────

/// Group signals by entity, infer one root cause per entity, and emit
/// exactly one insight per (entity, root cause). Confidence combines
/// the root cause's certainty with supporting-model confidence and the
/// disagreement monitor's verdict for the same period.
pub fn reason(
    signals: &[Signal],
    windows: &[MetricWindow],
    ctx: &RunContext,
    model_confidence: f64,
    config: &EngineConfig,
) -> Vec<Insight> {
    let window_by_entity: BTreeMap<&str, &MetricWindow> =
        windows.iter().map(|w| (w.entity_id.as_str(), w)).collect();

    let mut by_entity: BTreeMap<&str, Vec<&Signal>> = BTreeMap::new();
    for s in signals {
        by_entity.entry(s.entity_id.as_str()).or_default().push(s);
    }

    let (disagreement_score, instability) = match &ctx.disagreement {
        Some(d) => (Some(d.score), d.instability_flagged),
        None => (None, false),
    };

    let mut out = Vec::new();
    for (entity_id, entity_signals) in by_entity {
        let mut signal_types: Vec<String> = Vec::new();
        for s in &entity_signals {
            if !signal_types.contains(&s.signal_type) {
                signal_types.push(s.signal_type.clone());
            }
        }
        let root = infer_root_cause(&signal_types);
        let window = window_by_entity.get(entity_id).copied();
        let expected_impact = estimate_impact(root.insight_type, window);

        // Derived confidence: rule/root-cause certainty scaled by model
        // support, penalized when attribution and MMM disagreed for
        // this period.
        let rule_certainty = entity_signals
            .iter()
            .map(|s| s.certainty)
            .fold(0.0f64, f64::max);
        let certainty = root.certainty.max(rule_certainty);
        let mut confidence = certainty * (0.6 + 0.4 * model_confidence.clamp(0.0, 1.0));
        if instability {
            confidence *= config.instability_confidence_penalty;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        let severity = root.severity;
        let created_at = ctx.now;
        let score = priority_score(
            expected_impact.estimate,
            confidence,
            created_at,
            ctx.now,
            severity,
            config,
        );

        let hash = insight_hash(root.insight_type, "campaign", entity_id, &ctx.period());

        let mut evidence: Vec<Evidence> = Vec::new();
        let mut detected_by: Vec<String> = Vec::new();
        for s in &entity_signals {
            if !detected_by.contains(&s.source) {
                detected_by.push(s.source.clone());
            }
            if evidence
                .iter()
                .any(|e| e.metric == s.metric && e.period == s.period)
            {
                continue;
            }
            evidence.push(Evidence {
                metric: s.metric.clone(),
                value: s.observed,
                baseline: s.baseline,
                period: s.period.clone(),
            });
        }
        evidence.truncate(20);

        out.push(Insight {
            insight_id: hash.clone(),
            run_id: ctx.run_id.clone(),
            entity_type: "campaign".into(),
            entity_id: entity_id.to_string(),
            insight_type: root.insight_type.to_string(),
            summary: format!("{}: {}", root.cause, signal_types.join(", ")),
            explanation: format!(
                "Signals ({}) indicate {}. Severity: {}.",
                signal_types.join(", "),
                root.cause,
                severity.as_str()
            ),
            recommendation: recommendation_for(&signal_types, severity),
            expected_impact,
            confidence,
            evidence,
            detected_by,
            priority_score: score,
            severity,
            insight_hash: hash,
            disagreement_score,
            status: InsightStatus::New,
            created_at,
            applied_at: None,
            rank: None,
        });
    }
    out
}

/// Sort by priority descending (ties: most recent first) and assign
/// 1-based ranks. Callers pass the candidate set they want ranked
/// (typically new + reviewed insights).
pub fn rank_insights(insights: &mut [Insight]) {
    insights.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
    });
    for (i, insight) in insights.iter_mut().enumerate() {
        insight.rank = Some(i + 1);
    }
}
