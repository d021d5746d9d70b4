//! Signal -> reasoner -> suppressor tests: the waste scenario, signal
//! merging, idempotent hashing, cooldown, and escalation.

use chrono::{NaiveDate, TimeZone, Utc};
use decision_core::config::{default_rules, EngineConfig};
use decision_core::context::RunContext;
use decision_core::disagreement::DisagreementSummary;
use decision_core::reasoner::{insight_hash, reason, Severity};
use decision_core::signals::{build_window, rule_signals, MetricWindow, Signal};
use decision_core::store::EngineStore;
use decision_core::suppressor::{evaluate, SuppressionState, Verdict};
use decision_core::aggregator::{aggregate, RawMetricRow};
use chrono::Duration;

fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
}

fn ctx() -> RunContext {
    RunContext::new(
        "run-test".to_string(),
        as_of(),
        28,
        Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap(),
    )
}

/// An aggregated window with controllable spend/revenue and sessions
/// kept under the conversion-rate volume guard.
fn window(entity: &str, spend: f64, revenue: f64) -> MetricWindow {
    let rows: Vec<RawMetricRow> = (0..7)
        .map(|d| RawMetricRow {
            entity_id: entity.to_string(),
            date: as_of() - Duration::days(6 - d),
            channel: "display".to_string(),
            device: "all".to_string(),
            spend: spend / 7.0,
            clicks: 20.0,
            impressions: 400.0,
            conversions: if revenue > 0.0 { 1.0 } else { 0.0 },
            revenue: revenue / 7.0,
            sessions: 57.0,
        })
        .collect();
    let metric_rows = aggregate(&rows);
    build_window(entity, &metric_rows)
}

/// Channel A: spend 1000, revenue 0, min-spend guard satisfied -> a
/// high-severity "waste, zero revenue" insight.
#[test]
fn waste_scenario_produces_high_severity_insight() {
    let config = EngineConfig::default();
    let rules = default_rules();
    let w = window("cmp-a", 1000.0, 0.0);

    let signals = rule_signals(&rules, &[w.clone()], "2025-06-30");
    assert_eq!(signals.len(), 1, "only the waste rule should fire");
    assert_eq!(signals[0].signal_type, "waste_zero_revenue");

    let insights = reason(&signals, &[w], &ctx(), 0.8, &config);
    assert_eq!(insights.len(), 1);
    let insight = &insights[0];
    assert_eq!(insight.insight_type, "waste_zero_revenue");
    assert_eq!(insight.severity, Severity::High);
    assert_eq!(insight.expected_impact.metric, "savings");
    assert!((insight.expected_impact.estimate - 1000.0).abs() < 1e-6);
    assert!(insight.priority_score > 0.0 && insight.priority_score <= 1.0);
}

/// The min-spend volume guard keeps low-volume noise out.
#[test]
fn waste_rule_respects_min_spend_guard() {
    let rules = default_rules();
    let w = window("cmp-a", 50.0, 0.0);
    let signals = rule_signals(&rules, &[w], "2025-06-30");
    assert!(signals.is_empty());
}

/// Identical inputs produce identical insight_hash sets.
#[test]
fn reasoning_is_idempotent() {
    let config = EngineConfig::default();
    let rules = default_rules();
    let windows = vec![window("cmp-a", 1000.0, 0.0), window("cmp-b", 800.0, 0.0)];

    let run = || {
        let signals = rule_signals(&rules, &windows, "2025-06-30");
        let mut hashes: Vec<String> = reason(&signals, &windows, &ctx(), 0.8, &config)
            .into_iter()
            .map(|i| i.insight_hash)
            .collect();
        hashes.sort();
        hashes
    };
    assert_eq!(run(), run());
}

#[test]
fn hash_is_deterministic_and_distinct_per_entity() {
    let h1 = insight_hash("waste_zero_revenue", "campaign", "cmp-a", "2025-06-30");
    let h2 = insight_hash("waste_zero_revenue", "campaign", "cmp-a", "2025-06-30");
    let h3 = insight_hash("waste_zero_revenue", "campaign", "cmp-b", "2025-06-30");
    assert_eq!(h1, h2);
    assert_ne!(h1, h3);
    assert_eq!(h1.len(), 32);
}

/// Simultaneous ROAS and conversion drops merge into one insight with
/// a single root cause, not two independent alerts.
#[test]
fn related_signals_merge_to_one_insight() {
    let config = EngineConfig::default();
    let w = window("cmp-a", 1000.0, 400.0);
    let mk = |source: &str, signal_type: &str, metric: &str| Signal {
        source: source.to_string(),
        entity_id: "cmp-a".to_string(),
        signal_type: signal_type.to_string(),
        metric: metric.to_string(),
        observed: 0.4,
        baseline: Some(1.8),
        period: "2025-06-30".to_string(),
        certainty: 0.8,
    };
    let signals = vec![
        mk("rule:roas_decline_28d", "roas_decline", "roas_pct_delta_28d"),
        mk("rule:conversion_rate_drop", "conversion_drop", "conversion_rate"),
    ];

    let insights = reason(&signals, &[w], &ctx(), 0.8, &config);
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].insight_type, "traffic_quality");
    assert_eq!(insights[0].severity, Severity::High);
    assert_eq!(insights[0].detected_by.len(), 2);
}

/// Insights generated under flagged instability carry the score and a
/// reduced confidence.
#[test]
fn instability_penalizes_confidence() {
    let config = EngineConfig::default();
    let rules = default_rules();
    let w = window("cmp-a", 1000.0, 0.0);
    let signals = rule_signals(&rules, &[w.clone()], "2025-06-30");

    let calm = reason(&signals, &[w.clone()], &ctx(), 0.8, &config);

    let mut unstable_ctx = ctx();
    unstable_ctx.disagreement = Some(DisagreementSummary {
        score: 0.4,
        threshold: 0.25,
        instability_flagged: true,
        channel_alignment: vec![],
    });
    let flagged = reason(&signals, &[w], &unstable_ctx, 0.8, &config);

    assert!(flagged[0].confidence < calm[0].confidence);
    assert_eq!(flagged[0].disagreement_score, Some(0.4));
    assert_eq!(calm[0].disagreement_score, None);
}

// ── Suppression ──────────────────────────────────────────────────────

fn sample_insight() -> decision_core::reasoner::Insight {
    let config = EngineConfig::default();
    let rules = default_rules();
    let w = window("cmp-a", 1000.0, 0.0);
    let signals = rule_signals(&rules, &[w.clone()], "2025-06-30");
    reason(&signals, &[w], &ctx(), 0.8, &config)
        .into_iter()
        .next()
        .unwrap()
}

/// Severity S at t0, cooldown C: same severity at t0 + C/2 suppressed;
/// strictly higher severity at t0 + C/2 emitted.
#[test]
fn cooldown_suppresses_equal_severity_and_admits_escalation() {
    let config = EngineConfig::default();
    let t0 = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();
    let halfway = t0 + Duration::days(config.cooldown_days / 2);

    let insight = sample_insight();
    let state = SuppressionState {
        insight_hash: insight.insight_hash.clone(),
        last_emitted_at: t0,
        last_severity: Severity::High,
    };

    assert_eq!(
        evaluate(&insight, Some(&state), halfway, &config),
        Verdict::CooldownActive
    );

    let mut escalated = insight.clone();
    escalated.severity = Severity::Critical;
    assert_eq!(
        evaluate(&escalated, Some(&state), halfway, &config),
        Verdict::Emit
    );

    let mut downgraded = insight.clone();
    downgraded.severity = Severity::Medium;
    assert_eq!(
        evaluate(&downgraded, Some(&state), halfway, &config),
        Verdict::CooldownActive
    );
}

#[test]
fn cooldown_expires() {
    let config = EngineConfig::default();
    let t0 = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();
    let after = t0 + Duration::days(config.cooldown_days + 1);

    let insight = sample_insight();
    let state = SuppressionState {
        insight_hash: insight.insight_hash.clone(),
        last_emitted_at: t0,
        last_severity: Severity::High,
    };
    assert_eq!(evaluate(&insight, Some(&state), after, &config), Verdict::Emit);
}

/// Quality floors drop insights regardless of cooldown state.
#[test]
fn low_priority_and_low_impact_are_dropped() {
    let config = EngineConfig::default();
    let now = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();

    let mut weak = sample_insight();
    weak.priority_score = config.min_priority_score / 10.0;
    assert_eq!(evaluate(&weak, None, now, &config), Verdict::LowPriority);

    let mut tiny = sample_insight();
    tiny.expected_impact.estimate = config.impact_threshold / 10.0;
    assert_eq!(evaluate(&tiny, None, now, &config), Verdict::LowImpact);
}

/// insight_hash uniqueness is enforced by upsert, not duplicate rows.
#[test]
fn store_upserts_by_hash() {
    let store = EngineStore::in_memory().unwrap();
    store.migrate().unwrap();

    let insight = sample_insight();
    assert!(store.upsert_insight(&insight).unwrap(), "first write inserts");
    assert!(!store.upsert_insight(&insight).unwrap(), "second write updates");
    assert_eq!(store.insight_count().unwrap(), 1);

    let loaded = store
        .get_insight_by_hash(&insight.insight_hash)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.insight_id, insight.insight_id);
    assert_eq!(loaded.entity_id, insight.entity_id);
}
