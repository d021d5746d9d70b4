//! Run event log — the audit trail of what each stage did.
//!
//! RULE: Stages report outcomes ONLY through events and store writes.
//! A stage never reaches into another stage's in-memory state.

use crate::types::{EntityId, RunId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Every event emitted during a pipeline run.
/// Variants are added per stage — never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Run events ─────────────────────────────────
    RunStarted {
        run_id: RunId,
        as_of: NaiveDate,
        lookback_days: u32,
    },
    RunCompleted {
        run_id: RunId,
        entities_processed: usize,
        insights_emitted: usize,
        insights_suppressed: usize,
    },
    RunFailed {
        run_id: RunId,
        stage: String,
        error: String,
        entities_processed: usize,
        entities_total: usize,
    },

    // ── Stage events ───────────────────────────────
    MetricsAggregated {
        run_id: RunId,
        rows_written: usize,
        entities: usize,
        incremental_cutoff: Option<NaiveDate>,
    },
    AttributionComputed {
        run_id: RunId,
        model_used: String,
        orders_allocated: usize,
        path_count: usize,
        /// Observed path patterns and their frequencies.
        path_frequency: serde_json::Value,
    },
    MmmFitted {
        run_id: RunId,
        r_squared: f64,
        sample_size: usize,
        channels_fit: usize,
        channels_dropped: usize,
        low_confidence: bool,
    },
    DisagreementEvaluated {
        run_id: RunId,
        score: f64,
        instability_flagged: bool,
        channel_detail: serde_json::Value,
    },
    SignalsEvaluated {
        run_id: RunId,
        rule_signals: usize,
        anomaly_signals: usize,
    },
    InsightEmitted {
        run_id: RunId,
        insight_hash: String,
        entity_id: EntityId,
        insight_type: String,
        severity: String,
        priority_score: f64,
    },
    InsightSuppressed {
        run_id: RunId,
        insight_hash: String,
        entity_id: EntityId,
        reason: String,
    },

    // ── Lifecycle events ───────────────────────────
    DecisionTransitioned {
        insight_id: String,
        from: String,
        to: String,
        actor: String,
    },
    OutcomeEvaluated {
        history_id: String,
        window_days: u32,
        success_score: Option<f64>,
    },
}

/// Extract a stable string name from an EngineEvent variant.
/// Used for the event_type column in event_log.
pub fn event_type_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::RunStarted { .. } => "run_started",
        EngineEvent::RunCompleted { .. } => "run_completed",
        EngineEvent::RunFailed { .. } => "run_failed",
        EngineEvent::MetricsAggregated { .. } => "metrics_aggregated",
        EngineEvent::AttributionComputed { .. } => "attribution_computed",
        EngineEvent::MmmFitted { .. } => "mmm_fitted",
        EngineEvent::DisagreementEvaluated { .. } => "disagreement_evaluated",
        EngineEvent::SignalsEvaluated { .. } => "signals_evaluated",
        EngineEvent::InsightEmitted { .. } => "insight_emitted",
        EngineEvent::InsightSuppressed { .. } => "insight_suppressed",
        EngineEvent::DecisionTransitioned { .. } => "decision_transitioned",
        EngineEvent::OutcomeEvaluated { .. } => "outcome_evaluated",
    }
}

/// The event log entry as persisted to SQLite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub run_id: RunId,
    pub stage: String,
    pub event_type: String,
    pub payload: String, // JSON-serialized EngineEvent
    pub created_at: String,
}
