//! Disagreement monitor tests, including the worked scenario from the
//! product requirements.

use decision_core::config::EngineConfig;
use decision_core::disagreement::compare;
use std::collections::BTreeMap;

fn shares(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(c, v)| (c.to_string(), *v)).collect()
}

/// Attribution {A:0.5, B:0.3, C:0.2} vs MMM {A:0.3, B:0.3, C:0.4}:
/// score = mean(0.2, 0.0, 0.2) ~= 0.133, under the 0.25 threshold, so
/// no instability flag.
#[test]
fn worked_scenario_is_under_threshold() {
    let config = EngineConfig::default();
    let attribution = shares(&[("a", 0.5), ("b", 0.3), ("c", 0.2)]);
    let mmm = shares(&[("a", 0.3), ("b", 0.3), ("c", 0.4)]);

    let summary = compare(&attribution, &mmm, &config);
    assert!((summary.score - 0.1333).abs() < 0.001, "score = {}", summary.score);
    assert!(!summary.instability_flagged);
}

#[test]
fn large_divergence_flags_instability() {
    let config = EngineConfig::default();
    let attribution = shares(&[("a", 0.9), ("b", 0.1)]);
    let mmm = shares(&[("a", 0.2), ("b", 0.8)]);

    let summary = compare(&attribution, &mmm, &config);
    assert!(summary.score > config.disagreement_threshold);
    assert!(summary.instability_flagged);

    // Both channels diverge by 0.7, past the per-channel conflict bar.
    assert!(summary.channel_alignment.iter().all(|c| c.conflict));
}

/// A channel present on only one side contributes its full share.
#[test]
fn missing_channel_counts_as_full_delta() {
    let config = EngineConfig::default();
    let attribution = shares(&[("a", 1.0)]);
    let mmm = shares(&[("b", 1.0)]);

    let summary = compare(&attribution, &mmm, &config);
    assert!((summary.score - 1.0).abs() < 1e-9);
    assert!(summary.instability_flagged);
}

#[test]
fn identical_shares_score_zero() {
    let config = EngineConfig::default();
    let s = shares(&[("a", 0.6), ("b", 0.4)]);
    let summary = compare(&s, &s, &config);
    assert!(summary.score.abs() < 1e-12);
    assert!(!summary.instability_flagged);
}

#[test]
fn empty_inputs_do_not_flag() {
    let config = EngineConfig::default();
    let summary = compare(&BTreeMap::new(), &BTreeMap::new(), &config);
    assert_eq!(summary.score, 0.0);
    assert!(!summary.instability_flagged);
    assert!(summary.channel_alignment.is_empty());
}
