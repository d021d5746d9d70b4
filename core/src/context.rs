//! Run context — the explicit parameter object threaded through every
//! stage. No component reads run state from globals; parallel runs over
//! disjoint entities or date ranges stay independent.

use crate::disagreement::DisagreementSummary;
use crate::types::RunId;
use chrono::{DateTime, Duration, NaiveDate, Utc};

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    /// Last date of the evaluation window (inclusive).
    pub as_of: NaiveDate,
    pub lookback_days: u32,
    /// Wall-clock "now" for this run. Fixed at run start so every
    /// component sees the same instant (and tests can pin it).
    pub now: DateTime<Utc>,
    /// Set by the disagreement stage; stamped into every insight this
    /// run generates so recommendations carry the score that was in
    /// effect when they were made, never a stale one.
    pub disagreement: Option<DisagreementSummary>,
}

impl RunContext {
    pub fn new(run_id: RunId, as_of: NaiveDate, lookback_days: u32, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            as_of,
            lookback_days,
            now,
            disagreement: None,
        }
    }

    /// First date of the evaluation window (inclusive).
    pub fn window_start(&self) -> NaiveDate {
        self.as_of - Duration::days(self.lookback_days as i64 - 1)
    }

    /// Evaluation period label used in insight hashes.
    pub fn period(&self) -> String {
        self.as_of.format("%Y-%m-%d").to_string()
    }
}
