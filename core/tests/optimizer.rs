//! Budget optimizer and simulator tests.

use decision_core::config::EngineConfig;
use decision_core::error::EngineError;
use decision_core::mmm::{MmmChannelResult, MmmFit, MODEL_VERSION};
use decision_core::optimizer::{marginal_returns, optimize, simulate};
use std::collections::BTreeMap;

fn channel_result(channel: &str, coefficient: Option<f64>) -> MmmChannelResult {
    MmmChannelResult {
        channel: channel.to_string(),
        coefficient,
        intercept: 10.0,
        adstock_half_life: 7.0,
        saturation_param: 0.0,
        r_squared: 0.9,
        sample_size: 60,
        low_confidence: false,
        model_version: MODEL_VERSION.to_string(),
    }
}

fn fit(coefs: &[(&str, Option<f64>)], confidence: f64) -> MmmFit {
    MmmFit {
        channels: coefs
            .iter()
            .map(|(c, v)| channel_result(c, *v))
            .collect(),
        r_squared: 0.9,
        sample_size: 60,
        low_confidence: false,
        confidence,
        dropped: vec![],
    }
}

fn spend(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(c, v)| (c.to_string(), *v)).collect()
}

/// Two concave, distinct response curves: the greedy allocation spends
/// the whole budget and lands where marginal returns are approximately
/// equal (the greedy-optimal condition).
#[test]
fn greedy_allocation_equalizes_marginal_returns() {
    let config = EngineConfig::default();
    let f = fit(&[("google", Some(3.0)), ("meta", Some(2.0))], 0.8);

    let plan = optimize(&f, 1000.0, &spend(&[]), &config).unwrap();
    assert!(plan.stable);

    let total: f64 = plan.allocations.values().sum();
    assert!((total - 1000.0).abs() < 1e-6, "budget fully allocated, got {total}");

    // The stronger channel earns the larger share.
    assert!(plan.allocations["google"] > plan.allocations["meta"]);

    let marginals = marginal_returns(&f, &plan.allocations, &config);
    let m1 = marginals["google"];
    let m2 = marginals["meta"];
    let rel_diff = (m1 - m2).abs() / m1.max(m2);
    assert!(
        rel_diff < 0.25,
        "marginal returns should converge: {m1} vs {m2}"
    );
}

#[test]
fn unavailable_channels_earn_no_budget() {
    let config = EngineConfig::default();
    let f = fit(&[("google", Some(2.0)), ("display", None)], 0.8);

    let plan = optimize(&f, 500.0, &spend(&[]), &config).unwrap();
    assert!(!plan.allocations.contains_key("display"));
    assert!((plan.allocations["google"] - 500.0).abs() < 1e-6);
}

/// An unstable fit refuses to reallocate: current spend comes back
/// unchanged, flagged as not stable.
#[test]
fn unstable_fit_keeps_current_allocation() {
    let config = EngineConfig::default();
    let f = fit(&[("google", Some(3.0)), ("meta", Some(2.0))], 0.1);
    let current = spend(&[("google", 300.0), ("meta", 700.0)]);

    let plan = optimize(&f, 1000.0, &current, &config).unwrap();
    assert!(!plan.stable);
    assert_eq!(plan.allocations, current);
}

/// No usable coefficients is a structured error, never a best-guess
/// allocation.
#[test]
fn optimizer_errors_without_usable_fit() {
    let config = EngineConfig::default();
    let f = fit(&[("google", None), ("meta", Some(-1.0))], 0.8);
    let result = optimize(&f, 1000.0, &spend(&[]), &config);
    assert!(matches!(result, Err(EngineError::DataGap { .. })));
}

#[test]
fn simulate_projects_delta_and_mutates_nothing() {
    let config = EngineConfig::default();
    let f = fit(&[("google", Some(3.0)), ("meta", Some(2.0))], 0.8);
    let current = spend(&[("google", 400.0), ("meta", 300.0)]);
    let deltas = spend(&[("google", 0.2)]);

    let first = simulate(&f, &current, &deltas, &config).unwrap();
    assert!(first.projected_delta > 0.0, "more spend on a positive curve");
    assert!((first.spend["google"] - 480.0).abs() < 1e-9);
    assert!((first.spend["meta"] - 300.0).abs() < 1e-9);

    // Pure function: a second evaluation returns identical numbers.
    let second = simulate(&f, &current, &deltas, &config).unwrap();
    assert_eq!(first.projected_delta, second.projected_delta);
    assert_eq!(first.baseline_revenue, second.baseline_revenue);
}

#[test]
fn simulate_cut_reduces_projection() {
    let config = EngineConfig::default();
    let f = fit(&[("google", Some(3.0))], 0.8);
    let current = spend(&[("google", 400.0)]);
    let deltas = spend(&[("google", -0.5)]);

    let result = simulate(&f, &current, &deltas, &config).unwrap();
    assert!(result.projected_delta < 0.0);
}

#[test]
fn simulate_errors_without_usable_fit() {
    let config = EngineConfig::default();
    let f = fit(&[("google", None)], 0.8);
    let result = simulate(&f, &spend(&[]), &spend(&[]), &config);
    assert!(matches!(result, Err(EngineError::DataGap { .. })));
}
