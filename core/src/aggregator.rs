//! Metrics aggregator — turns raw per-source daily rows into unified
//! metric rows with derived ratios and rolling baselines.
//!
//! RULES:
//!   - Ratios use safe division: a zero or non-finite denominator
//!     yields None, never an exception or infinity.
//!   - Baselines are row-based trailing windows (7 and 28 rows), not
//!     calendar windows: sparse series still get a baseline from
//!     however many rows exist, down to one.
//!   - Recomputation replaces the affected partition wholesale unless
//!     an incremental cutoff is requested.

use crate::types::{Channel, EntityId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SHORT_WINDOW: usize = 7;
pub const LONG_WINDOW: usize = 28;

/// A raw source row as supplied by the ETL collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMetricRow {
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub channel: Channel,
    pub device: String,
    pub spend: f64,
    pub clicks: f64,
    pub impressions: f64,
    pub conversions: f64,
    pub revenue: f64,
    pub sessions: f64,
}

/// One unified metrics row per (entity, date, channel, device).
/// Immutable once computed for a partition; recomputed wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub channel: Channel,
    pub device: String,
    pub spend: f64,
    pub clicks: f64,
    pub impressions: f64,
    pub conversions: f64,
    pub revenue: f64,
    pub sessions: f64,
    pub roas: Option<f64>,
    pub cpa: Option<f64>,
    pub ctr: Option<f64>,
    pub conversion_rate: Option<f64>,
    pub roas_7d_avg: Option<f64>,
    pub roas_28d_avg: Option<f64>,
    pub revenue_7d_avg: Option<f64>,
    pub revenue_28d_avg: Option<f64>,
    pub roas_pct_delta_7d: Option<f64>,
    pub roas_pct_delta_28d: Option<f64>,
    pub revenue_pct_delta_28d: Option<f64>,
}

/// Safe division: None on zero or non-finite denominator.
pub fn safe_div(num: f64, den: f64) -> Option<f64> {
    if den == 0.0 || !den.is_finite() || !num.is_finite() {
        None
    } else {
        Some(num / den)
    }
}

/// Percent delta vs. baseline: None when the baseline is None or zero.
pub fn pct_delta(current: Option<f64>, baseline: Option<f64>) -> Option<f64> {
    match (current, baseline) {
        (Some(c), Some(b)) if b != 0.0 => Some((c - b) / b),
        _ => None,
    }
}

/// Group-sum raw rows by (entity, date, channel, device), then compute
/// ratios and trailing baselines per (entity, channel, device) series.
pub fn aggregate(raw: &[RawMetricRow]) -> Vec<MetricRow> {
    // BTreeMap keeps output ordering deterministic across runs.
    let mut sums: BTreeMap<(EntityId, NaiveDate, Channel, String), RawMetricRow> = BTreeMap::new();
    for r in raw {
        let key = (
            r.entity_id.clone(),
            r.date,
            r.channel.clone(),
            r.device.clone(),
        );
        let e = sums.entry(key).or_insert_with(|| RawMetricRow {
            entity_id: r.entity_id.clone(),
            date: r.date,
            channel: r.channel.clone(),
            device: r.device.clone(),
            spend: 0.0,
            clicks: 0.0,
            impressions: 0.0,
            conversions: 0.0,
            revenue: 0.0,
            sessions: 0.0,
        });
        e.spend += r.spend;
        e.clicks += r.clicks;
        e.impressions += r.impressions;
        e.conversions += r.conversions;
        e.revenue += r.revenue;
        e.sessions += r.sessions;
    }

    // Regroup into per-series date-ordered vectors.
    let mut series: BTreeMap<(EntityId, Channel, String), Vec<RawMetricRow>> = BTreeMap::new();
    for ((entity, _, channel, device), row) in sums {
        series
            .entry((entity, channel, device))
            .or_default()
            .push(row);
    }

    let mut out = Vec::new();
    for rows in series.values() {
        // BTreeMap iteration already yields dates in ascending order
        // within a series, so rows are ordered here.
        let roas_series: Vec<Option<f64>> =
            rows.iter().map(|r| safe_div(r.revenue, r.spend)).collect();
        let revenue_series: Vec<f64> = rows.iter().map(|r| r.revenue).collect();

        for (i, r) in rows.iter().enumerate() {
            let roas = roas_series[i];
            let roas_7 = trailing_avg_opt(&roas_series, i, SHORT_WINDOW);
            let roas_28 = trailing_avg_opt(&roas_series, i, LONG_WINDOW);
            let rev_7 = trailing_avg(&revenue_series, i, SHORT_WINDOW);
            let rev_28 = trailing_avg(&revenue_series, i, LONG_WINDOW);

            out.push(MetricRow {
                entity_id: r.entity_id.clone(),
                date: r.date,
                channel: r.channel.clone(),
                device: r.device.clone(),
                spend: r.spend,
                clicks: r.clicks,
                impressions: r.impressions,
                conversions: r.conversions,
                revenue: r.revenue,
                sessions: r.sessions,
                roas,
                cpa: safe_div(r.spend, r.conversions),
                ctr: safe_div(r.clicks, r.impressions),
                conversion_rate: safe_div(r.conversions, r.sessions),
                roas_7d_avg: roas_7,
                roas_28d_avg: roas_28,
                revenue_7d_avg: rev_7,
                revenue_28d_avg: rev_28,
                roas_pct_delta_7d: pct_delta(roas, roas_7),
                roas_pct_delta_28d: pct_delta(roas, roas_28),
                revenue_pct_delta_28d: pct_delta(Some(r.revenue), rev_28),
            });
        }
    }
    out
}

/// Trailing average over the last `window` rows ending at `idx`,
/// inclusive. Always defined (windows shrink at the series head).
fn trailing_avg(values: &[f64], idx: usize, window: usize) -> Option<f64> {
    let start = idx.saturating_sub(window - 1);
    let slice = &values[start..=idx];
    if slice.is_empty() {
        None
    } else {
        Some(slice.iter().sum::<f64>() / slice.len() as f64)
    }
}

/// Trailing average over optional values; rows where the ratio was not
/// computable are skipped. None when no row in the window had a value.
fn trailing_avg_opt(values: &[Option<f64>], idx: usize, window: usize) -> Option<f64> {
    let start = idx.saturating_sub(window - 1);
    let present: Vec<f64> = values[start..=idx].iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}
