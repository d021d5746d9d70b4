//! Decision lifecycle and outcome evaluator.
//!
//! One DecisionHistory row tracks one insight from creation to verified
//! outcome. Transitions move forward only; moving backward or jumping
//! straight to VERIFIED is rejected with no mutation. Only APPLIED
//! decisions are eligible for outcome evaluation, which is idempotent
//! for a fixed "now": re-running recomputes the same values in place,
//! never accumulating duplicate rows.

use crate::error::{EngineError, EngineResult};
use crate::event::{event_type_name, EngineEvent, EventLogEntry};
use crate::reasoner::InsightStatus;
use crate::store::EngineStore;
use crate::types::EntityId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Status ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DecisionStatus {
    New,
    Reviewed,
    Applied,
    Verified,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::New => "NEW",
            DecisionStatus::Reviewed => "REVIEWED",
            DecisionStatus::Applied => "APPLIED",
            DecisionStatus::Verified => "VERIFIED",
        }
    }

    pub fn parse(s: &str) -> DecisionStatus {
        match s {
            "REVIEWED" => DecisionStatus::Reviewed,
            "APPLIED" => DecisionStatus::Applied,
            "VERIFIED" => DecisionStatus::Verified,
            _ => DecisionStatus::New,
        }
    }
}

/// Forward-only. VERIFIED is only reachable from APPLIED because only
/// applied decisions have an outcome to verify.
pub fn can_transition(from: DecisionStatus, to: DecisionStatus) -> bool {
    if to <= from {
        return false;
    }
    if to == DecisionStatus::Verified {
        return from == DecisionStatus::Applied;
    }
    true
}

// ── Record ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub history_id: String,
    pub insight_id: String,
    pub entity_id: EntityId,
    pub recommended_action: String,
    pub status: DecisionStatus,
    pub applied_by: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub outcome_metrics_after_7d: Option<String>,
    pub outcome_metrics_after_30d: Option<String>,
    pub decision_success_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-window outcome payload stored as JSON on the decision row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub window_days: u32,
    pub spend_change: Option<f64>,
    pub revenue_change: Option<f64>,
    pub roas_change: Option<f64>,
}

// ── Transitions ──────────────────────────────────────────────────────

/// Apply a lifecycle transition for an insight's decision row. The
/// insight's own status is moved alongside (REVIEWED -> reviewed,
/// APPLIED -> applied with applied_at stamped).
pub fn transition(
    store: &EngineStore,
    insight_id: &str,
    to: DecisionStatus,
    actor: &str,
    now: DateTime<Utc>,
) -> EngineResult<DecisionRecord> {
    let decision =
        store
            .decision_for_insight(insight_id)?
            .ok_or_else(|| EngineError::InvalidTransition {
                from: format!("missing decision for insight {insight_id}"),
                to: to.as_str().to_string(),
            })?;

    if !can_transition(decision.status, to) {
        return Err(EngineError::InvalidTransition {
            from: decision.status.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    let applied_at = if to == DecisionStatus::Applied {
        Some(now)
    } else {
        decision.applied_at
    };
    let applied_by = if to == DecisionStatus::Applied {
        Some(actor.to_string())
    } else {
        decision.applied_by.clone()
    };

    store.update_decision_status(&decision.history_id, to, applied_by.as_deref(), applied_at, now)?;

    match to {
        DecisionStatus::Reviewed => {
            store.update_insight_status(insight_id, InsightStatus::Reviewed, None)?
        }
        DecisionStatus::Applied => {
            store.update_insight_status(insight_id, InsightStatus::Applied, Some(now))?
        }
        _ => {}
    }

    if let Some(insight) = store.get_insight(insight_id)? {
        let event = EngineEvent::DecisionTransitioned {
            insight_id: insight_id.to_string(),
            from: decision.status.as_str().to_string(),
            to: to.as_str().to_string(),
            actor: actor.to_string(),
        };
        store.append_event(&EventLogEntry {
            id: None,
            run_id: insight.run_id,
            stage: "lifecycle".into(),
            event_type: event_type_name(&event).into(),
            payload: serde_json::to_string(&event)?,
            created_at: now.to_rfc3339(),
        })?;
    }

    log::info!(
        "decision {} for insight {insight_id}: {} -> {}",
        decision.history_id,
        decision.status.as_str(),
        to.as_str()
    );

    store.decision_for_insight(insight_id)?.ok_or_else(|| {
        EngineError::Other(anyhow::anyhow!("decision vanished after transition"))
    })
}

/// Reject an insight. Rejection is terminal for the insight and does
/// not advance its decision row.
pub fn reject_insight(store: &EngineStore, insight_id: &str) -> EngineResult<()> {
    store.update_insight_status(insight_id, InsightStatus::Rejected, None)
}

// ── Outcome evaluation ───────────────────────────────────────────────

/// Evaluate outcomes for APPLIED decisions whose +7d / +30d windows
/// have elapsed. Metric change = (window_now - window_at_apply) /
/// window_at_apply over 7-day windows. Re-running with the same `now`
/// recomputes identical values in place.
pub fn evaluate_outcomes(store: &EngineStore, now: DateTime<Utc>) -> EngineResult<usize> {
    let decisions = store.decisions_with_status(DecisionStatus::Applied)?;
    let mut updated = 0usize;

    for decision in decisions {
        let Some(applied_at) = decision.applied_at else {
            continue;
        };
        let age_days = (now - applied_at).num_days();
        if age_days < 7 {
            continue;
        }

        let outcome_7d = Some(compute_outcome(store, &decision.entity_id, applied_at, 7)?);
        let outcome_30d = if age_days >= 30 {
            Some(compute_outcome(store, &decision.entity_id, applied_at, 30)?)
        } else {
            None
        };

        let expected = store
            .get_insight(&decision.insight_id)?
            .map(|i| (i.expected_impact.metric, i.expected_impact.estimate));
        let latest = outcome_30d.as_ref().or(outcome_7d.as_ref());
        let score = latest.and_then(|o| success_score(expected.as_ref(), o));

        let o7 = outcome_7d.as_ref().map(serde_json::to_string).transpose()?;
        let o30 = outcome_30d.as_ref().map(serde_json::to_string).transpose()?;
        store.update_decision_outcomes(
            &decision.history_id,
            o7.as_deref(),
            o30.as_deref(),
            score,
            now,
        )?;

        let event = EngineEvent::OutcomeEvaluated {
            history_id: decision.history_id.clone(),
            window_days: if outcome_30d.is_some() { 30 } else { 7 },
            success_score: score,
        };
        if let Some(insight) = store.get_insight(&decision.insight_id)? {
            store.append_event(&EventLogEntry {
                id: None,
                run_id: insight.run_id,
                stage: "outcome".into(),
                event_type: event_type_name(&event).into(),
                payload: serde_json::to_string(&event)?,
                created_at: now.to_rfc3339(),
            })?;
        }
        updated += 1;
    }
    Ok(updated)
}

fn compute_outcome(
    store: &EngineStore,
    entity_id: &str,
    applied_at: DateTime<Utc>,
    window_days: u32,
) -> EngineResult<OutcomeMetrics> {
    let apply_date = applied_at.date_naive();
    let later_date = apply_date + Duration::days(window_days as i64);

    let before = store.entity_window_metrics(entity_id, apply_date, 7)?;
    let after = store.entity_window_metrics(entity_id, later_date, 7)?;

    let change = |b: f64, a: f64| -> Option<f64> {
        if b == 0.0 {
            None
        } else {
            Some((a - b) / b)
        }
    };

    let roas_before = crate::aggregator::safe_div(before.revenue, before.spend);
    let roas_after = crate::aggregator::safe_div(after.revenue, after.spend);
    let roas_change = match (roas_before, roas_after) {
        (Some(b), Some(a)) if b != 0.0 => Some((a - b) / b),
        _ => None,
    };

    Ok(OutcomeMetrics {
        window_days,
        spend_change: change(before.spend, after.spend),
        revenue_change: change(before.revenue, after.revenue),
        roas_change,
    })
}

/// Success score in [0, 1]: a recommendation that predicted improvement
/// and got it scores near 1; predicted improvement with decline scores
/// near 0. Unknown expectations or unmeasurable changes score neutral.
pub fn success_score(
    expected: Option<&(String, f64)>,
    outcome: &OutcomeMetrics,
) -> Option<f64> {
    let (metric, estimate) = expected?;
    if *estimate == 0.0 {
        return Some(0.5);
    }
    // "savings" improvements realize as spend going down; revenue
    // improvements realize as revenue going up.
    let realized = match metric.as_str() {
        "savings" => outcome.spend_change.map(|c| -c),
        _ => outcome.revenue_change,
    }?;
    Some((0.5 + realized.clamp(-0.5, 0.5)).clamp(0.0, 1.0))
}
