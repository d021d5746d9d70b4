//! Source-table reads and unified metric rows.

use super::{parse_date, sql_date, EngineStore};
use crate::aggregator::{MetricRow, RawMetricRow};
use crate::attribution::{DailySpend, Order, TouchpointPath};
use crate::error::EngineResult;
use crate::mmm::MmmDataset;
use crate::signals::AnomalyFlag;
use crate::types::Channel;
use chrono::NaiveDate;
use rusqlite::params;
use std::collections::{BTreeMap, BTreeSet};

impl EngineStore {
    // ── Collaborator table seeding ─────────────────────────────

    pub fn insert_raw_metric(&self, r: &RawMetricRow) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO raw_metric_daily (
                entity_id, date, channel, device,
                spend, clicks, impressions, conversions, revenue, sessions
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                r.entity_id,
                sql_date(r.date),
                r.channel,
                r.device,
                r.spend,
                r.clicks,
                r.impressions,
                r.conversions,
                r.revenue,
                r.sessions,
            ],
        )?;
        Ok(())
    }

    pub fn insert_raw_order(&self, o: &Order) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO raw_order (order_id, entity_id, date, revenue, conversions)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                o.order_id,
                o.entity_id,
                sql_date(o.date),
                o.revenue,
                o.conversions
            ],
        )?;
        Ok(())
    }

    pub fn insert_touchpoint_path(&self, p: &TouchpointPath) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO touchpoint_path (path_id, entity_id, order_id, path, converted, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                p.path_id,
                p.entity_id,
                p.order_id.as_deref(),
                p.channels.join(">"),
                if p.converted { 1i32 } else { 0i32 },
                sql_date(p.date),
            ],
        )?;
        Ok(())
    }

    pub fn insert_anomaly_flag(&self, f: &AnomalyFlag) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO anomaly_flag (entity_id, date, metric, observed, forecast, score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                f.entity_id,
                sql_date(f.date),
                f.metric,
                f.observed,
                f.forecast,
                f.score
            ],
        )?;
        Ok(())
    }

    // ── Source reads ───────────────────────────────────────────

    pub fn raw_metrics_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<RawMetricRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, date, channel, device,
                    spend, clicks, impressions, conversions, revenue, sessions
             FROM raw_metric_daily
             WHERE date >= ?1 AND date <= ?2
             ORDER BY entity_id, channel, device, date",
        )?;
        let rows = stmt
            .query_map(params![sql_date(start), sql_date(end)], |row| {
                Ok(RawMetricRow {
                    entity_id: row.get(0)?,
                    date: parse_date(&row.get::<_, String>(1)?)?,
                    channel: row.get(2)?,
                    device: row.get(3)?,
                    spend: row.get(4)?,
                    clicks: row.get(5)?,
                    impressions: row.get(6)?,
                    conversions: row.get(7)?,
                    revenue: row.get(8)?,
                    sessions: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn orders_window(&self, start: NaiveDate, end: NaiveDate) -> EngineResult<Vec<Order>> {
        let mut stmt = self.conn.prepare(
            "SELECT order_id, entity_id, date, revenue, conversions
             FROM raw_order WHERE date >= ?1 AND date <= ?2
             ORDER BY order_id",
        )?;
        let rows = stmt
            .query_map(params![sql_date(start), sql_date(end)], |row| {
                Ok(Order {
                    order_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    date: parse_date(&row.get::<_, String>(2)?)?,
                    revenue: row.get(3)?,
                    conversions: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn paths_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<TouchpointPath>> {
        let mut stmt = self.conn.prepare(
            "SELECT path_id, entity_id, order_id, path, converted, date
             FROM touchpoint_path WHERE date >= ?1 AND date <= ?2
             ORDER BY path_id",
        )?;
        let rows = stmt
            .query_map(params![sql_date(start), sql_date(end)], |row| {
                let path: String = row.get(3)?;
                Ok(TouchpointPath {
                    path_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    order_id: row.get(2)?,
                    channels: path
                        .split('>')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                    converted: row.get::<_, i32>(4)? != 0,
                    date: parse_date(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn anomaly_flags_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<AnomalyFlag>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, date, metric, observed, forecast, score
             FROM anomaly_flag WHERE date >= ?1 AND date <= ?2
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![sql_date(start), sql_date(end)], |row| {
                Ok(AnomalyFlag {
                    entity_id: row.get(0)?,
                    date: parse_date(&row.get::<_, String>(1)?)?,
                    metric: row.get(2)?,
                    observed: row.get(3)?,
                    forecast: row.get(4)?,
                    score: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Unified metric rows ────────────────────────────────────

    /// Replace an entity's metric partition: wholesale by default, or
    /// only rows with date >= cutoff when an incremental window was
    /// requested. Runs in one transaction.
    pub fn replace_metric_partition(
        &self,
        entity_id: &str,
        rows: &[MetricRow],
        cutoff: Option<NaiveDate>,
    ) -> EngineResult<()> {
        let tx = self.transaction()?;
        match cutoff {
            Some(c) => {
                self.conn.execute(
                    "DELETE FROM metric_row WHERE entity_id = ?1 AND date >= ?2",
                    params![entity_id, sql_date(c)],
                )?;
            }
            None => {
                self.conn.execute(
                    "DELETE FROM metric_row WHERE entity_id = ?1",
                    params![entity_id],
                )?;
            }
        }
        for r in rows {
            if r.entity_id != entity_id {
                continue;
            }
            if let Some(c) = cutoff {
                if r.date < c {
                    continue;
                }
            }
            self.conn.execute(
                "INSERT INTO metric_row (
                    entity_id, date, channel, device,
                    spend, clicks, impressions, conversions, revenue, sessions,
                    roas, cpa, ctr, conversion_rate,
                    roas_7d_avg, roas_28d_avg, revenue_7d_avg, revenue_28d_avg,
                    roas_pct_delta_7d, roas_pct_delta_28d, revenue_pct_delta_28d
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
                params![
                    r.entity_id,
                    sql_date(r.date),
                    r.channel,
                    r.device,
                    r.spend,
                    r.clicks,
                    r.impressions,
                    r.conversions,
                    r.revenue,
                    r.sessions,
                    r.roas,
                    r.cpa,
                    r.ctr,
                    r.conversion_rate,
                    r.roas_7d_avg,
                    r.roas_28d_avg,
                    r.revenue_7d_avg,
                    r.revenue_28d_avg,
                    r.roas_pct_delta_7d,
                    r.roas_pct_delta_28d,
                    r.revenue_pct_delta_28d,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn metric_rows_window(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<MetricRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, date, channel, device,
                    spend, clicks, impressions, conversions, revenue, sessions,
                    roas, cpa, ctr, conversion_rate,
                    roas_7d_avg, roas_28d_avg, revenue_7d_avg, revenue_28d_avg,
                    roas_pct_delta_7d, roas_pct_delta_28d, revenue_pct_delta_28d
             FROM metric_row WHERE date >= ?1 AND date <= ?2
             ORDER BY entity_id, channel, device, date",
        )?;
        let rows = stmt
            .query_map(params![sql_date(start), sql_date(end)], metric_row_mapper)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn metric_rows_for_entity(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<MetricRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, date, channel, device,
                    spend, clicks, impressions, conversions, revenue, sessions,
                    roas, cpa, ctr, conversion_rate,
                    roas_7d_avg, roas_28d_avg, revenue_7d_avg, revenue_28d_avg,
                    roas_pct_delta_7d, roas_pct_delta_28d, revenue_pct_delta_28d
             FROM metric_row
             WHERE entity_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY channel, device, date",
        )?;
        let rows = stmt
            .query_map(
                params![entity_id, sql_date(start), sql_date(end)],
                metric_row_mapper,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Daily spend summed across entities and devices per (date, channel).
    pub fn daily_spend_by_channel(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<DailySpend>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, channel, SUM(spend)
             FROM metric_row WHERE date >= ?1 AND date <= ?2
             GROUP BY date, channel
             ORDER BY date, channel",
        )?;
        let rows = stmt
            .query_map(params![sql_date(start), sql_date(end)], |row| {
                Ok(DailySpend {
                    date: parse_date(&row.get::<_, String>(0)?)?,
                    channel: row.get(1)?,
                    spend: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Totals for one entity over a trailing window ending at `end`
    /// (inclusive). Used by the outcome evaluator.
    pub fn entity_window_metrics(
        &self,
        entity_id: &str,
        end: NaiveDate,
        days: u32,
    ) -> EngineResult<EntityWindowTotals> {
        let start = end - chrono::Duration::days(days as i64 - 1);
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(spend), 0.0), COALESCE(SUM(revenue), 0.0),
                        COALESCE(SUM(conversions), 0.0), COALESCE(SUM(sessions), 0.0)
                 FROM metric_row
                 WHERE entity_id = ?1 AND date >= ?2 AND date <= ?3",
                params![entity_id, sql_date(start), sql_date(end)],
                |row| {
                    Ok(EntityWindowTotals {
                        spend: row.get(0)?,
                        revenue: row.get(1)?,
                        conversions: row.get(2)?,
                        sessions: row.get(3)?,
                    })
                },
            )
            .map_err(Into::into)
    }

    /// Date-aligned MMM dataset over a window: per-channel daily spend
    /// and total daily revenue, zero-filled for missing combinations.
    pub fn mmm_dataset(&self, start: NaiveDate, end: NaiveDate) -> EngineResult<MmmDataset> {
        let mut stmt = self.conn.prepare(
            "SELECT date, channel, SUM(spend), SUM(revenue)
             FROM metric_row WHERE date >= ?1 AND date <= ?2
             GROUP BY date, channel
             ORDER BY date, channel",
        )?;
        let raw: Vec<(NaiveDate, Channel, f64, f64)> = stmt
            .query_map(params![sql_date(start), sql_date(end)], |row| {
                Ok((
                    parse_date(&row.get::<_, String>(0)?)?,
                    row.get::<_, Channel>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let dates: Vec<NaiveDate> = raw
            .iter()
            .map(|(d, _, _, _)| *d)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let channels: Vec<Channel> = raw
            .iter()
            .map(|(_, c, _, _)| c.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let date_idx: BTreeMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();
        let channel_idx: BTreeMap<&str, usize> = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();

        let mut spend = vec![vec![0.0f64; dates.len()]; channels.len()];
        let mut revenue = vec![0.0f64; dates.len()];
        for (date, channel, s, r) in &raw {
            let t = date_idx[date];
            spend[channel_idx[channel.as_str()]][t] += s;
            revenue[t] += r;
        }

        Ok(MmmDataset {
            dates,
            channels,
            spend,
            revenue,
        })
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EntityWindowTotals {
    pub spend: f64,
    pub revenue: f64,
    pub conversions: f64,
    pub sessions: f64,
}

fn metric_row_mapper(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRow> {
    Ok(MetricRow {
        entity_id: row.get(0)?,
        date: parse_date(&row.get::<_, String>(1)?)?,
        channel: row.get(2)?,
        device: row.get(3)?,
        spend: row.get(4)?,
        clicks: row.get(5)?,
        impressions: row.get(6)?,
        conversions: row.get(7)?,
        revenue: row.get(8)?,
        sessions: row.get(9)?,
        roas: row.get(10)?,
        cpa: row.get(11)?,
        ctr: row.get(12)?,
        conversion_rate: row.get(13)?,
        roas_7d_avg: row.get(14)?,
        roas_28d_avg: row.get(15)?,
        revenue_7d_avg: row.get(16)?,
        revenue_28d_avg: row.get(17)?,
        roas_pct_delta_7d: row.get(18)?,
        roas_pct_delta_28d: row.get(19)?,
        revenue_pct_delta_28d: row.get(20)?,
    })
}
