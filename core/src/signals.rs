//! Signal generator — evaluates declarative rules and ingests anomaly
//! flags against aggregated metrics, emitting raw signals.
//!
//! Signals are not insights: they are potentially duplicative evidence.
//! The reasoner merges them downstream.

use crate::aggregator::{pct_delta, safe_div, MetricRow};
use crate::config::{CompareOp, EngineConfig, RuleDef};
use crate::types::EntityId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated evaluation window for one entity (summed across its
/// channels and devices over the lookback window).
#[derive(Debug, Clone)]
pub struct MetricWindow {
    pub entity_id: EntityId,
    pub spend: f64,
    pub clicks: f64,
    pub impressions: f64,
    pub conversions: f64,
    pub revenue: f64,
    pub sessions: f64,
    pub roas: Option<f64>,
    pub ctr: Option<f64>,
    pub conversion_rate: Option<f64>,
    pub roas_28d_avg: Option<f64>,
    pub roas_pct_delta_28d: Option<f64>,
}

impl MetricWindow {
    /// Metric lookup by rule name. Unknown metrics resolve to None and
    /// the rule simply never fires.
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "spend" => Some(self.spend),
            "clicks" => Some(self.clicks),
            "impressions" => Some(self.impressions),
            "conversions" => Some(self.conversions),
            "revenue" => Some(self.revenue),
            "sessions" => Some(self.sessions),
            "roas" => self.roas,
            "ctr" => self.ctr,
            "conversion_rate" => self.conversion_rate,
            "roas_28d_avg" => self.roas_28d_avg,
            "roas_pct_delta_28d" => self.roas_pct_delta_28d,
            _ => None,
        }
    }

    /// Baseline reported as signal evidence for a given metric.
    fn baseline_for(&self, metric: &str) -> Option<f64> {
        match metric {
            "roas" | "roas_pct_delta_28d" => self.roas_28d_avg,
            _ => None,
        }
    }
}

/// Collapse an entity's metric rows into one evaluation window.
pub fn build_window(entity_id: &str, rows: &[MetricRow]) -> MetricWindow {
    let mut w = MetricWindow {
        entity_id: entity_id.to_string(),
        spend: 0.0,
        clicks: 0.0,
        impressions: 0.0,
        conversions: 0.0,
        revenue: 0.0,
        sessions: 0.0,
        roas: None,
        ctr: None,
        conversion_rate: None,
        roas_28d_avg: None,
        roas_pct_delta_28d: None,
    };
    let mut baseline_sum = 0.0;
    let mut baseline_n = 0usize;
    for r in rows {
        w.spend += r.spend;
        w.clicks += r.clicks;
        w.impressions += r.impressions;
        w.conversions += r.conversions;
        w.revenue += r.revenue;
        w.sessions += r.sessions;
        if let Some(b) = r.roas_28d_avg {
            baseline_sum += b;
            baseline_n += 1;
        }
    }
    w.roas = safe_div(w.revenue, w.spend);
    w.ctr = safe_div(w.clicks, w.impressions);
    w.conversion_rate = safe_div(w.conversions, w.sessions);
    if baseline_n > 0 {
        w.roas_28d_avg = Some(baseline_sum / baseline_n as f64);
    }
    w.roas_pct_delta_28d = pct_delta(w.roas, w.roas_28d_avg);
    w
}

/// Group metric rows by entity and build one window per entity.
pub fn build_windows(rows: &[MetricRow]) -> Vec<MetricWindow> {
    let mut by_entity: BTreeMap<&str, Vec<MetricRow>> = BTreeMap::new();
    for r in rows {
        by_entity.entry(r.entity_id.as_str()).or_default().push(r.clone());
    }
    by_entity
        .into_iter()
        .map(|(entity, rows)| build_window(entity, &rows))
        .collect()
}

// ── Signals ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// "rule:<rule_id>" or "anomaly".
    pub source: String,
    pub entity_id: EntityId,
    /// The insight_type this signal argues for.
    pub signal_type: String,
    pub metric: String,
    pub observed: f64,
    pub baseline: Option<f64>,
    pub period: String,
    pub certainty: f64,
}

/// Pure rule evaluation over one window. Volume guards gate first:
/// a rule with min_spend or min_sessions never fires below them.
pub fn evaluate_rule(rule: &RuleDef, window: &MetricWindow) -> bool {
    if let Some(min_spend) = rule.min_spend {
        if window.spend < min_spend {
            return false;
        }
    }
    if let Some(min_sessions) = rule.min_sessions {
        if window.sessions < min_sessions {
            return false;
        }
    }
    let Some(value) = window.metric(&rule.metric) else {
        return false;
    };
    match rule.op {
        CompareOp::Lt => value < rule.value,
        CompareOp::Lte => value <= rule.value,
        CompareOp::Gt => value > rule.value,
        CompareOp::Gte => value >= rule.value,
        CompareOp::Eq => value == rule.value,
    }
}

/// Evaluate every rule against every window.
pub fn rule_signals(rules: &[RuleDef], windows: &[MetricWindow], period: &str) -> Vec<Signal> {
    let mut out = Vec::new();
    for window in windows {
        for rule in rules {
            if !evaluate_rule(rule, window) {
                continue;
            }
            let observed = window.metric(&rule.metric).unwrap_or(0.0);
            out.push(Signal {
                source: format!("rule:{}", rule.id),
                entity_id: window.entity_id.clone(),
                signal_type: rule.insight_type.clone(),
                metric: rule.metric.clone(),
                observed,
                baseline: window.baseline_for(&rule.metric),
                period: period.to_string(),
                certainty: rule.certainty,
            });
        }
    }
    out
}

/// An externally supplied anomaly flag (observed vs. forecast from a
/// time-series detector).
#[derive(Debug, Clone)]
pub struct AnomalyFlag {
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub metric: String,
    pub observed: f64,
    pub forecast: f64,
    pub score: f64,
}

/// Turn anomaly flags above the score threshold into signals.
/// Certainty scales with the anomaly score, capped at 0.9.
pub fn anomaly_signals(flags: &[AnomalyFlag], config: &EngineConfig, period: &str) -> Vec<Signal> {
    flags
        .iter()
        .filter(|f| f.score >= config.anomaly_score_threshold)
        .map(|f| Signal {
            source: "anomaly".to_string(),
            entity_id: f.entity_id.clone(),
            signal_type: "anomaly".to_string(),
            metric: f.metric.clone(),
            observed: f.observed,
            baseline: Some(f.forecast),
            period: period.to_string(),
            certainty: (0.5 + f.score / 10.0).min(0.9),
        })
        .collect()
}
