//! MMM result persistence. One row per (run_id, channel); historical
//! runs are retained for trend and versioning queries.

use super::EngineStore;
use crate::error::EngineResult;
use crate::mmm::MmmChannelResult;
use crate::types::RunId;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl EngineStore {
    pub fn insert_mmm_results(
        &self,
        run_id: &str,
        results: &[MmmChannelResult],
        created_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let tx = self.transaction()?;
        for r in results {
            self.conn.execute(
                "INSERT INTO mmm_result (
                    run_id, channel, coefficient, intercept, adstock_half_life,
                    saturation_param, r_squared, sample_size, low_confidence,
                    model_version, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(run_id, channel) DO UPDATE SET
                    coefficient = excluded.coefficient,
                    intercept = excluded.intercept,
                    r_squared = excluded.r_squared,
                    sample_size = excluded.sample_size,
                    low_confidence = excluded.low_confidence",
                params![
                    run_id,
                    r.channel,
                    r.coefficient,
                    r.intercept,
                    r.adstock_half_life,
                    r.saturation_param,
                    r.r_squared,
                    r.sample_size as i64,
                    if r.low_confidence { 1i32 } else { 0i32 },
                    r.model_version,
                    created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mmm_results(&self, run_id: &str) -> EngineResult<Vec<MmmChannelResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT channel, coefficient, intercept, adstock_half_life,
                    saturation_param, r_squared, sample_size, low_confidence, model_version
             FROM mmm_result WHERE run_id = ?1
             ORDER BY channel",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(MmmChannelResult {
                    channel: row.get(0)?,
                    coefficient: row.get(1)?,
                    intercept: row.get(2)?,
                    adstock_half_life: row.get(3)?,
                    saturation_param: row.get(4)?,
                    r_squared: row.get(5)?,
                    sample_size: row.get::<_, i64>(6)? as usize,
                    low_confidence: row.get::<_, i32>(7)? != 0,
                    model_version: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recently written MMM run, for on-demand optimizer and
    /// simulator queries.
    pub fn latest_mmm_run_id(&self) -> EngineResult<Option<RunId>> {
        self.conn
            .query_row(
                "SELECT run_id FROM mmm_result ORDER BY created_at DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }
}
