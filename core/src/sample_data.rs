//! Deterministic synthetic collaborator data.
//!
//! Seeds the raw tables the ETL would supply in production: daily
//! per-channel metrics, orders, touchpoint paths, and anomaly flags.
//! Profiles are shaped so a default run exercises the whole pipeline:
//! a healthy scaler, a decliner, and a zero-revenue waster.

use crate::aggregator::RawMetricRow;
use crate::attribution::{Order, TouchpointPath};
use crate::error::EngineResult;
use crate::rng::DataRng;
use crate::signals::AnomalyFlag;
use crate::store::EngineStore;
use chrono::{Duration, NaiveDate};

struct EntityProfile {
    entity_id: &'static str,
    channel: &'static str,
    daily_spend: f64,
    base_roas: f64,
    /// Multiplier applied to revenue over the final 14 days; < 1.0
    /// produces a decline that trips the ROAS rules.
    late_revenue_factor: f64,
    sessions_per_day: f64,
}

const PROFILES: &[EntityProfile] = &[
    EntityProfile {
        entity_id: "cmp-search-brand",
        channel: "google",
        daily_spend: 180.0,
        base_roas: 4.2,
        late_revenue_factor: 1.8,
        sessions_per_day: 900.0,
    },
    EntityProfile {
        entity_id: "cmp-social-retarget",
        channel: "meta",
        daily_spend: 120.0,
        base_roas: 2.6,
        late_revenue_factor: 1.0,
        sessions_per_day: 600.0,
    },
    EntityProfile {
        entity_id: "cmp-social-prospect",
        channel: "meta",
        daily_spend: 220.0,
        base_roas: 1.8,
        late_revenue_factor: 0.45,
        sessions_per_day: 1100.0,
    },
    EntityProfile {
        entity_id: "cmp-display-legacy",
        channel: "display",
        daily_spend: 60.0,
        base_roas: 0.0,
        late_revenue_factor: 1.0,
        sessions_per_day: 300.0,
    },
];

#[derive(Debug, Clone, Copy, Default)]
pub struct SampleSummary {
    pub metric_rows: usize,
    pub orders: usize,
    pub paths: usize,
    pub anomaly_flags: usize,
}

/// Populate collaborator tables for `days` ending at `end` (inclusive).
pub fn seed_collaborator_tables(
    store: &EngineStore,
    seed: u64,
    end: NaiveDate,
    days: u32,
) -> EngineResult<SampleSummary> {
    let mut summary = SampleSummary::default();
    let start = end - Duration::days(days as i64 - 1);
    let mut metrics_rng = DataRng::new(seed, 1);
    let mut orders_rng = DataRng::new(seed, 2);
    let mut paths_rng = DataRng::new(seed, 3);

    let channels: Vec<&str> = PROFILES.iter().map(|p| p.channel).collect();

    for day_offset in 0..days as i64 {
        let date = start + Duration::days(day_offset);
        let days_from_end = (end - date).num_days();
        let in_late_window = days_from_end < 14;

        for profile in PROFILES {
            let spend = profile.daily_spend * metrics_rng.range_f64(0.85, 1.15);
            let roas = if in_late_window {
                profile.base_roas * profile.late_revenue_factor
            } else {
                profile.base_roas
            };
            let revenue = if profile.base_roas == 0.0 {
                0.0
            } else {
                spend * roas * metrics_rng.range_f64(0.8, 1.2)
            };
            let sessions = profile.sessions_per_day * metrics_rng.range_f64(0.9, 1.1);
            let clicks = sessions * metrics_rng.range_f64(0.7, 0.95);
            let impressions = clicks * metrics_rng.range_f64(18.0, 30.0);
            let conversions = if revenue > 0.0 {
                (revenue / metrics_rng.range_f64(55.0, 85.0)).max(1.0).round()
            } else {
                0.0
            };

            store.insert_raw_metric(&RawMetricRow {
                entity_id: profile.entity_id.to_string(),
                date,
                channel: profile.channel.to_string(),
                device: "all".to_string(),
                spend,
                clicks,
                impressions,
                conversions,
                revenue,
                sessions,
            })?;
            summary.metric_rows += 1;

            // Orders for converting entities: a handful per day, with
            // revenue summing to the day's total.
            if revenue > 0.0 {
                let n_orders = 1 + orders_rng.next_u64_below(3) as usize;
                let slice = revenue / n_orders as f64;
                for k in 0..n_orders {
                    let order_id =
                        format!("ord-{}-{}-{}", profile.entity_id, date.format("%Y%m%d"), k);
                    store.insert_raw_order(&Order {
                        order_id: order_id.clone(),
                        entity_id: profile.entity_id.to_string(),
                        date,
                        revenue: slice,
                        conversions: 1.0,
                    })?;
                    summary.orders += 1;

                    // Converted path ending at this entity's channel.
                    let mut path = Vec::new();
                    if paths_rng.chance(0.6) {
                        path.push(
                            channels[paths_rng.next_u64_below(channels.len() as u64) as usize]
                                .to_string(),
                        );
                    }
                    path.push(profile.channel.to_string());
                    store.insert_touchpoint_path(&TouchpointPath {
                        path_id: format!("path-{order_id}"),
                        entity_id: profile.entity_id.to_string(),
                        order_id: Some(order_id),
                        channels: path,
                        converted: true,
                        date,
                    })?;
                    summary.paths += 1;
                }
            }

            // Non-converting journeys keep the null state populated.
            if paths_rng.chance(0.5) {
                let mut path = vec![profile.channel.to_string()];
                if paths_rng.chance(0.4) {
                    path.push(
                        channels[paths_rng.next_u64_below(channels.len() as u64) as usize]
                            .to_string(),
                    );
                }
                store.insert_touchpoint_path(&TouchpointPath {
                    path_id: format!("path-null-{}-{}", profile.entity_id, date.format("%Y%m%d")),
                    entity_id: profile.entity_id.to_string(),
                    order_id: None,
                    channels: path,
                    converted: false,
                    date,
                })?;
                summary.paths += 1;
            }
        }
    }

    // One revenue anomaly near the end of the window, as the external
    // detector would flag it.
    let anomaly_date = end - Duration::days(2);
    store.insert_anomaly_flag(&AnomalyFlag {
        entity_id: "cmp-social-prospect".to_string(),
        date: anomaly_date,
        metric: "revenue".to_string(),
        observed: 90.0,
        forecast: 400.0,
        score: 3.1,
    })?;
    summary.anomaly_flags += 1;

    log::info!(
        "seeded sample data: {} metric rows, {} orders, {} paths",
        summary.metric_rows,
        summary.orders,
        summary.paths
    );
    Ok(summary)
}
