//! End-to-end pipeline tests over deterministic sample data.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use decision_core::pipeline::PipelineEngine;
use decision_core::reasoner::Severity;
use decision_core::sample_data::seed_collaborator_tables;
use std::collections::HashMap;

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap()
}

fn seeded_engine(seed: u64) -> PipelineEngine {
    let engine = PipelineEngine::build_test().unwrap();
    seed_collaborator_tables(&engine.store, seed, as_of(), 60).unwrap();
    engine
}

#[test]
fn full_run_completes_and_persists() {
    let engine = seeded_engine(7);
    let mut ctx = engine.start_run(7, as_of(), now()).unwrap();
    let report = engine.run(&mut ctx, None).unwrap();

    assert_eq!(report.entities_processed, 4);
    assert!(report.metric_rows_written >= 4 * 60);
    assert!(report.orders_allocated > 0);
    assert!(report.signals >= 2);
    assert!(report.insights_emitted >= 2, "report: {report:?}");

    let summary = engine.store.run_summary(&ctx.run_id).unwrap();
    assert_eq!(summary.status, "completed");
    assert!(summary.failed_stage.is_none());
    assert_eq!(summary.entities_total, 4);

    // One health row per stage, in execution order.
    let health = engine.store.stage_health_for_run(&ctx.run_id).unwrap();
    let stages: Vec<&str> = health.iter().map(|h| h.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec!["aggregate", "attribution", "mmm", "disagreement", "signals", "insights"]
    );

    for event_type in [
        "run_started",
        "metrics_aggregated",
        "attribution_computed",
        "mmm_fitted",
        "disagreement_evaluated",
        "signals_evaluated",
        "run_completed",
    ] {
        assert!(
            engine.store.event_count(&ctx.run_id, event_type).unwrap() >= 1,
            "missing event {event_type}"
        );
    }
}

/// The zero-revenue spender surfaces as a high-severity waste insight,
/// and the decliner's correlated signals merge into one insight.
#[test]
fn expected_insights_surface() {
    let engine = seeded_engine(7);
    let mut ctx = engine.start_run(7, as_of(), now()).unwrap();
    engine.run(&mut ctx, None).unwrap();

    let waste = engine
        .store
        .list_insights(Some("cmp-display-legacy"), None, 10, 0)
        .unwrap();
    assert_eq!(waste.len(), 1);
    assert_eq!(waste[0].insight_type, "waste_zero_revenue");
    assert_eq!(waste[0].severity, Severity::High);
    assert!(waste[0].disagreement_score.is_some());

    let decliner = engine
        .store
        .list_insights(Some("cmp-social-prospect"), None, 10, 0)
        .unwrap();
    assert_eq!(decliner.len(), 1, "correlated signals merge to one insight");
    assert!(decliner[0].detected_by.len() >= 2);

    // Every emitted insight has a decision row in NEW.
    let history = engine
        .store
        .decision_history_for_entity("cmp-display-legacy")
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status.as_str(), "NEW");
}

/// Conservation holds end to end: credited revenue per order equals
/// the order's observed revenue.
#[test]
fn attribution_conserves_revenue_end_to_end() {
    let engine = seeded_engine(11);
    let mut ctx = engine.start_run(11, as_of(), now()).unwrap();
    engine.run(&mut ctx, None).unwrap();

    let orders: HashMap<String, f64> = engine
        .store
        .orders_window(ctx.window_start(), as_of())
        .unwrap()
        .into_iter()
        .map(|o| (o.order_id, o.revenue))
        .collect();
    let credited = engine.store.order_credit_totals(&ctx.run_id).unwrap();
    assert!(!credited.is_empty());

    for (order_id, total) in credited {
        let observed = orders[&order_id];
        assert!(
            (total - observed).abs() < 1e-6,
            "order {order_id}: credited {total}, observed {observed}"
        );
    }
}

/// Re-running the pipeline for the same period is idempotent: every
/// insight hash already exists, cooldown suppresses re-emission, and
/// no duplicate rows appear.
#[test]
fn rerun_same_period_is_suppressed() {
    let engine = seeded_engine(7);
    let mut ctx1 = engine.start_run(7, as_of(), now()).unwrap();
    let first = engine.run(&mut ctx1, None).unwrap();
    assert!(first.insights_emitted >= 2);
    let count_after_first = engine.store.insight_count().unwrap();

    let mut ctx2 = engine
        .start_run(7, as_of(), now() + Duration::hours(1))
        .unwrap();
    let second = engine.run(&mut ctx2, None).unwrap();

    assert_eq!(second.insights_emitted, 0);
    assert_eq!(
        second.insights_suppressed,
        first.insights_emitted + first.insights_suppressed
    );
    assert_eq!(engine.store.insight_count().unwrap(), count_after_first);
}

#[test]
fn incremental_run_completes() {
    let engine = seeded_engine(7);
    let mut ctx1 = engine.start_run(7, as_of(), now()).unwrap();
    engine.run(&mut ctx1, None).unwrap();

    let cutoff = as_of() - Duration::days(6);
    let mut ctx2 = engine
        .start_run(7, as_of(), now() + Duration::hours(2))
        .unwrap();
    let report = engine.run(&mut ctx2, Some(cutoff)).unwrap();
    assert_eq!(report.entities_processed, 4);

    let summary = engine.store.run_summary(&ctx2.run_id).unwrap();
    assert_eq!(summary.status, "completed");
}

#[test]
fn top_insights_are_ranked_by_priority() {
    let engine = seeded_engine(7);
    let mut ctx = engine.start_run(7, as_of(), now()).unwrap();
    engine.run(&mut ctx, None).unwrap();

    let top = engine.store.top_insights(10).unwrap();
    assert!(top.len() >= 2);
    for (i, insight) in top.iter().enumerate() {
        assert_eq!(insight.rank, Some(i + 1));
    }
    for pair in top.windows(2) {
        assert!(pair[0].priority_score >= pair[1].priority_score);
    }
}

#[test]
fn mmm_results_are_persisted_per_channel() {
    let engine = seeded_engine(7);
    let mut ctx = engine.start_run(7, as_of(), now()).unwrap();
    engine.run(&mut ctx, None).unwrap();

    let results = engine.store.mmm_results(&ctx.run_id).unwrap();
    // Sample data spans google, meta, and display.
    assert_eq!(results.len(), 3);
    for r in &results {
        assert!((0.0..=1.0).contains(&r.r_squared));
        assert_eq!(r.sample_size, 60);
    }
    assert_eq!(
        engine.store.latest_mmm_run_id().unwrap().as_deref(),
        Some(ctx.run_id.as_str())
    );
}
