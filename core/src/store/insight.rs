//! Insight and suppression-state persistence.
//!
//! insight_hash uniqueness is enforced at write time: writes go through
//! upsert-by-hash, never plain insert. Rank is computed at read time
//! over the new + reviewed candidate set, so it always reflects the
//! current lifecycle states.

use super::{parse_datetime, EngineStore};
use crate::error::EngineResult;
use crate::reasoner::{
    rank_insights, Evidence, ExpectedImpact, Insight, InsightStatus, Severity,
};
use crate::suppressor::SuppressionState;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl EngineStore {
    /// Upsert by insight_hash. A hash collision updates the existing
    /// row's derived fields in place (status and applied_at belong to
    /// the lifecycle and are left untouched). Returns true when a new
    /// row was inserted.
    pub fn upsert_insight(&self, insight: &Insight) -> EngineResult<bool> {
        let existing = self.get_insight_by_hash(&insight.insight_hash)?;
        // A hash shared across distinct entities is a real collision,
        // not a re-evaluation; upserting would silently merge them.
        if let Some(prior) = &existing {
            if prior.entity_id != insight.entity_id {
                return Err(crate::error::EngineError::DuplicateWrite {
                    hash: insight.insight_hash.clone(),
                });
            }
        }
        let existed = existing.is_some();
        self.conn.execute(
            "INSERT INTO insight (
                insight_id, run_id, entity_type, entity_id, insight_type,
                summary, explanation, recommendation,
                impact_metric, impact_estimate, impact_units,
                confidence, evidence, detected_by, priority_score, severity,
                insight_hash, disagreement_score, status, created_at, applied_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
            ON CONFLICT(insight_hash) DO UPDATE SET
                run_id = excluded.run_id,
                summary = excluded.summary,
                explanation = excluded.explanation,
                recommendation = excluded.recommendation,
                impact_metric = excluded.impact_metric,
                impact_estimate = excluded.impact_estimate,
                impact_units = excluded.impact_units,
                confidence = excluded.confidence,
                evidence = excluded.evidence,
                detected_by = excluded.detected_by,
                priority_score = excluded.priority_score,
                severity = excluded.severity,
                disagreement_score = excluded.disagreement_score,
                created_at = excluded.created_at",
            params![
                insight.insight_id,
                insight.run_id,
                insight.entity_type,
                insight.entity_id,
                insight.insight_type,
                insight.summary,
                insight.explanation,
                insight.recommendation,
                insight.expected_impact.metric,
                insight.expected_impact.estimate,
                insight.expected_impact.units,
                insight.confidence,
                serde_json::to_string(&insight.evidence)?,
                serde_json::to_string(&insight.detected_by)?,
                insight.priority_score,
                insight.severity.as_str(),
                insight.insight_hash,
                insight.disagreement_score,
                insight.status.as_str(),
                insight.created_at.to_rfc3339(),
                insight.applied_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(!existed)
    }

    pub fn get_insight(&self, insight_id: &str) -> EngineResult<Option<Insight>> {
        let mut stmt = self.conn.prepare(&format!(
            "{INSIGHT_SELECT} WHERE insight_id = ?1"
        ))?;
        stmt.query_row(params![insight_id], insight_row_mapper)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_insight_by_hash(&self, hash: &str) -> EngineResult<Option<Insight>> {
        let mut stmt = self.conn.prepare(&format!(
            "{INSIGHT_SELECT} WHERE insight_hash = ?1"
        ))?;
        stmt.query_row(params![hash], insight_row_mapper)
            .optional()
            .map_err(Into::into)
    }

    /// List insights with read-time ranks. Ranking is computed over all
    /// new + reviewed insights first; entity/status filters and
    /// pagination apply afterwards, so an insight's rank is stable no
    /// matter how the caller filters.
    pub fn list_insights(
        &self,
        entity_id: Option<&str>,
        status: Option<InsightStatus>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Insight>> {
        let mut stmt = self.conn.prepare(&format!("{INSIGHT_SELECT} ORDER BY created_at DESC"))?;
        let mut all: Vec<Insight> = stmt
            .query_map([], insight_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut actionable: Vec<Insight> = all
            .iter()
            .filter(|i| matches!(i.status, InsightStatus::New | InsightStatus::Reviewed))
            .cloned()
            .collect();
        rank_insights(&mut actionable);
        for i in &mut all {
            i.rank = actionable
                .iter()
                .find(|r| r.insight_hash == i.insight_hash)
                .and_then(|r| r.rank);
        }

        let filtered = all
            .into_iter()
            .filter(|i| entity_id.map_or(true, |e| i.entity_id == e))
            .filter(|i| status.map_or(true, |s| i.status == s));

        // Ranked insights first (by rank), then the rest by recency.
        let mut out: Vec<Insight> = filtered.collect();
        out.sort_by(|a, b| match (a.rank, b.rank) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b.created_at.cmp(&a.created_at),
        });
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    /// Top N actionable insights, already ranked.
    pub fn top_insights(&self, n: usize) -> EngineResult<Vec<Insight>> {
        let mut stmt = self.conn.prepare(&format!(
            "{INSIGHT_SELECT} WHERE status IN ('new', 'reviewed')"
        ))?;
        let mut actionable: Vec<Insight> = stmt
            .query_map([], insight_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        rank_insights(&mut actionable);
        actionable.truncate(n);
        Ok(actionable)
    }

    pub fn update_insight_status(
        &self,
        insight_id: &str,
        status: InsightStatus,
        applied_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        match applied_at {
            Some(t) => {
                self.conn.execute(
                    "UPDATE insight SET status = ?1, applied_at = ?2 WHERE insight_id = ?3",
                    params![status.as_str(), t.to_rfc3339(), insight_id],
                )?;
            }
            None => {
                self.conn.execute(
                    "UPDATE insight SET status = ?1 WHERE insight_id = ?2",
                    params![status.as_str(), insight_id],
                )?;
            }
        }
        Ok(())
    }

    pub fn insight_count(&self) -> EngineResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM insight", [], |row| row.get(0))
            .map_err(Into::into)
    }

    // ── Suppression state ──────────────────────────────────────

    pub fn suppression_state(&self, hash: &str) -> EngineResult<Option<SuppressionState>> {
        self.conn
            .query_row(
                "SELECT insight_hash, last_emitted_at, last_severity
                 FROM suppression_state WHERE insight_hash = ?1",
                params![hash],
                |row| {
                    Ok(SuppressionState {
                        insight_hash: row.get(0)?,
                        last_emitted_at: parse_datetime(&row.get::<_, String>(1)?)?,
                        last_severity: Severity::parse(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Supersede (not merely refresh) the suppression state for a hash.
    pub fn upsert_suppression_state(
        &self,
        hash: &str,
        emitted_at: DateTime<Utc>,
        severity: Severity,
    ) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO suppression_state (insight_hash, last_emitted_at, last_severity)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(insight_hash) DO UPDATE SET
                last_emitted_at = excluded.last_emitted_at,
                last_severity = excluded.last_severity",
            params![hash, emitted_at.to_rfc3339(), severity.as_str()],
        )?;
        Ok(())
    }
}

const INSIGHT_SELECT: &str = "SELECT insight_id, run_id, entity_type, entity_id, insight_type,
        summary, explanation, recommendation,
        impact_metric, impact_estimate, impact_units,
        confidence, evidence, detected_by, priority_score, severity,
        insight_hash, disagreement_score, status, created_at, applied_at
 FROM insight";

fn insight_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Insight> {
    let evidence_json: String = row.get(12)?;
    let detected_json: String = row.get(13)?;
    let evidence: Vec<Evidence> = serde_json::from_str(&evidence_json).unwrap_or_default();
    let detected_by: Vec<String> = serde_json::from_str(&detected_json).unwrap_or_default();
    let applied_at: Option<String> = row.get(20)?;
    Ok(Insight {
        insight_id: row.get(0)?,
        run_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        insight_type: row.get(4)?,
        summary: row.get(5)?,
        explanation: row.get(6)?,
        recommendation: row.get(7)?,
        expected_impact: ExpectedImpact {
            metric: row.get(8)?,
            estimate: row.get(9)?,
            units: row.get(10)?,
        },
        confidence: row.get(11)?,
        evidence,
        detected_by,
        priority_score: row.get(14)?,
        severity: Severity::parse(&row.get::<_, String>(15)?),
        insight_hash: row.get(16)?,
        disagreement_score: row.get(17)?,
        status: InsightStatus::parse(&row.get::<_, String>(18)?),
        created_at: parse_datetime(&row.get::<_, String>(19)?)?,
        applied_at: applied_at.as_deref().map(parse_datetime).transpose()?,
        rank: None,
    })
}
