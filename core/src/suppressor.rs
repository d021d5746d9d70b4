//! Noise suppressor — cooldown and minimum-quality gates applied before
//! an insight is persisted.
//!
//! The contract: an identical insight at equal-or-lower severity does
//! not resurface during its cooldown window, but escalating severity
//! breaks through immediately and supersedes the stored state.

use crate::config::EngineConfig;
use crate::reasoner::{Insight, Severity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Control-plane state bounding how often an identical insight may
/// resurface. Superseded, not merely refreshed, when severity rises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionState {
    pub insight_hash: String,
    pub last_emitted_at: DateTime<Utc>,
    pub last_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Emit,
    /// Below the configured minimum priority score.
    LowPriority,
    /// Below the configured expected-impact floor.
    LowImpact,
    /// Same hash emitted within the cooldown window at >= severity.
    CooldownActive,
}

impl Verdict {
    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Emit => "emit",
            Verdict::LowPriority => "low_priority",
            Verdict::LowImpact => "low_impact",
            Verdict::CooldownActive => "cooldown_active",
        }
    }
}

/// Pure gate evaluation. Quality gates apply regardless of cooldown;
/// the cooldown gate only applies when prior state exists for the hash.
pub fn evaluate(
    insight: &Insight,
    existing: Option<&SuppressionState>,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Verdict {
    if insight.priority_score < config.min_priority_score {
        return Verdict::LowPriority;
    }
    if insight.expected_impact.estimate.abs() < config.impact_threshold {
        return Verdict::LowImpact;
    }

    if let Some(state) = existing {
        let cutoff = now - Duration::days(config.cooldown_days);
        let within_cooldown = state.last_emitted_at > cutoff;
        let escalated = insight.severity > state.last_severity;
        if within_cooldown && !escalated {
            return Verdict::CooldownActive;
        }
    }
    Verdict::Emit
}
