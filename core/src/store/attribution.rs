//! Attribution event persistence. A run's batch is atomic: the whole
//! batch replaces any prior rows for that run_id in one transaction, so
//! a crash mid-run never leaves partial credit.

use super::{parse_date, sql_date, EngineStore};
use crate::attribution::AttributionEvent;
use crate::error::EngineResult;
use crate::types::Channel;
use rusqlite::params;
use std::collections::BTreeMap;

impl EngineStore {
    pub fn replace_attribution_run(
        &self,
        run_id: &str,
        events: &[AttributionEvent],
    ) -> EngineResult<()> {
        let tx = self.transaction()?;
        self.conn.execute(
            "DELETE FROM attribution_event WHERE run_id = ?1",
            params![run_id],
        )?;
        for e in events {
            self.conn.execute(
                "INSERT INTO attribution_event (
                    run_id, order_id, channel, weight, credited_revenue, model_used, event_date
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    e.run_id,
                    e.order_id,
                    e.channel,
                    e.weight,
                    e.credited_revenue,
                    e.model_used,
                    sql_date(e.event_date),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn attribution_events(&self, run_id: &str) -> EngineResult<Vec<AttributionEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, order_id, channel, weight, credited_revenue, model_used, event_date
             FROM attribution_event WHERE run_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(AttributionEvent {
                    run_id: row.get(0)?,
                    order_id: row.get(1)?,
                    channel: row.get(2)?,
                    weight: row.get(3)?,
                    credited_revenue: row.get(4)?,
                    model_used: row.get(5)?,
                    event_date: parse_date(&row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Credited revenue share per channel for a run, normalized to 1.
    pub fn attribution_revenue_share(&self, run_id: &str) -> EngineResult<BTreeMap<Channel, f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel, SUM(credited_revenue)
             FROM attribution_event WHERE run_id = ?1
             GROUP BY channel",
        )?;
        let mut shares: BTreeMap<Channel, f64> = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, Channel>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let total: f64 = shares.values().sum();
        if total > 0.0 {
            for v in shares.values_mut() {
                *v /= total;
            }
        }
        Ok(shares)
    }

    /// Per-order credited totals, for the conservation invariant.
    pub fn order_credit_totals(&self, run_id: &str) -> EngineResult<Vec<(String, f64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT order_id, SUM(credited_revenue)
             FROM attribution_event WHERE run_id = ?1
             GROUP BY order_id ORDER BY order_id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
