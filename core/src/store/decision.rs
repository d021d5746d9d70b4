//! Decision history persistence. Rows are created when an insight is
//! first surfaced and mutated only by status transitions and outcome
//! evaluation. Never deleted (audit requirement).

use super::{parse_datetime, EngineStore};
use crate::error::EngineResult;
use crate::lifecycle::{DecisionRecord, DecisionStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl EngineStore {
    pub fn insert_decision(&self, d: &DecisionRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO decision_history (
                history_id, insight_id, entity_id, recommended_action, status,
                applied_by, applied_at, outcome_metrics_after_7d,
                outcome_metrics_after_30d, decision_success_score,
                created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                d.history_id,
                d.insight_id,
                d.entity_id,
                d.recommended_action,
                d.status.as_str(),
                d.applied_by.as_deref(),
                d.applied_at.map(|t| t.to_rfc3339()),
                d.outcome_metrics_after_7d.as_deref(),
                d.outcome_metrics_after_30d.as_deref(),
                d.decision_success_score,
                d.created_at.to_rfc3339(),
                d.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn decision_for_insight(&self, insight_id: &str) -> EngineResult<Option<DecisionRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{DECISION_SELECT} WHERE insight_id = ?1"))?;
        stmt.query_row(params![insight_id], decision_row_mapper)
            .optional()
            .map_err(Into::into)
    }

    pub fn update_decision_status(
        &self,
        history_id: &str,
        status: DecisionStatus,
        applied_by: Option<&str>,
        applied_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE decision_history
             SET status = ?1, applied_by = COALESCE(?2, applied_by),
                 applied_at = COALESCE(?3, applied_at), updated_at = ?4
             WHERE history_id = ?5",
            params![
                status.as_str(),
                applied_by,
                applied_at.map(|t| t.to_rfc3339()),
                updated_at.to_rfc3339(),
                history_id
            ],
        )?;
        Ok(())
    }

    pub fn decisions_with_status(
        &self,
        status: DecisionStatus,
    ) -> EngineResult<Vec<DecisionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{DECISION_SELECT} WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], decision_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Outcome evaluation is idempotent: recomputed values overwrite in
    /// place, no duplicate evaluation rows accumulate.
    pub fn update_decision_outcomes(
        &self,
        history_id: &str,
        outcome_7d: Option<&str>,
        outcome_30d: Option<&str>,
        success_score: Option<f64>,
        updated_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE decision_history
             SET outcome_metrics_after_7d = COALESCE(?1, outcome_metrics_after_7d),
                 outcome_metrics_after_30d = COALESCE(?2, outcome_metrics_after_30d),
                 decision_success_score = COALESCE(?3, decision_success_score),
                 updated_at = ?4
             WHERE history_id = ?5",
            params![
                outcome_7d,
                outcome_30d,
                success_score,
                updated_at.to_rfc3339(),
                history_id
            ],
        )?;
        Ok(())
    }

    /// Full audit trail for an entity, oldest first.
    pub fn decision_history_for_entity(
        &self,
        entity_id: &str,
    ) -> EngineResult<Vec<DecisionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "{DECISION_SELECT} WHERE entity_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![entity_id], decision_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn decision_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM decision_history", [], |row| row.get(0))
            .map_err(Into::into)
    }
}

const DECISION_SELECT: &str = "SELECT history_id, insight_id, entity_id, recommended_action, status,
        applied_by, applied_at, outcome_metrics_after_7d,
        outcome_metrics_after_30d, decision_success_score, created_at, updated_at
 FROM decision_history";

fn decision_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let applied_at: Option<String> = row.get(6)?;
    Ok(DecisionRecord {
        history_id: row.get(0)?,
        insight_id: row.get(1)?,
        entity_id: row.get(2)?,
        recommended_action: row.get(3)?,
        status: DecisionStatus::parse(&row.get::<_, String>(4)?),
        applied_by: row.get(5)?,
        applied_at: applied_at.as_deref().map(parse_datetime).transpose()?,
        outcome_metrics_after_7d: row.get(7)?,
        outcome_metrics_after_30d: row.get(8)?,
        decision_success_score: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?)?,
        updated_at: parse_datetime(&row.get::<_, String>(11)?)?,
    })
}
