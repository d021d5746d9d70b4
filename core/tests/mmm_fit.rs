//! MMM tests: transform math, coefficient recovery, degradation on
//! short or degenerate history, and modeled shares.

use decision_core::config::{EngineConfig, SaturationKind};
use decision_core::error::EngineError;
use decision_core::mmm::{
    adstock, confidence_score, degraded_fit, fit, modeled_share, saturate, MmmDataset,
};

fn dataset(days: usize, spend: Vec<Vec<f64>>, revenue: Vec<f64>, channels: &[&str]) -> MmmDataset {
    let start = chrono::NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();
    MmmDataset {
        dates: (0..days)
            .map(|d| start + chrono::Duration::days(d as i64))
            .collect(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
        spend,
        revenue,
    }
}

#[test]
fn adstock_decay_matches_half_life() {
    // half_life = 1 means decay = 0.5 per day.
    let out = adstock(&[100.0, 0.0, 0.0], 1.0);
    assert!((out[0] - 100.0).abs() < 1e-9);
    assert!((out[1] - 50.0).abs() < 1e-9);
    assert!((out[2] - 25.0).abs() < 1e-9);
}

#[test]
fn adstock_disabled_for_nonpositive_half_life() {
    let xs = [10.0, 20.0, 30.0];
    assert_eq!(adstock(&xs, 0.0), xs.to_vec());
}

#[test]
fn saturation_is_concave_and_increasing() {
    let s1 = saturate(10.0, SaturationKind::Log);
    let s2 = saturate(100.0, SaturationKind::Log);
    let s3 = saturate(1000.0, SaturationKind::Log);
    assert!(s1 < s2 && s2 < s3);
    // Diminishing returns: equal multiplicative steps add less each time.
    assert!(s3 - s2 < s2 - s1 + 1e-9);
}

#[test]
fn hill_saturation_bounded_by_one() {
    let kind = SaturationKind::Hill {
        alpha: 2.0,
        half_saturation: 50.0,
    };
    assert!(saturate(1e9, kind) <= 1.0);
    let half = saturate(50.0, kind);
    assert!((half - 0.5).abs() < 1e-9);
}

/// Ridge regression recovers planted coefficients when revenue is an
/// exact function of the transformed spends.
#[test]
fn fit_recovers_planted_coefficients() {
    let config = EngineConfig {
        ridge_alpha: 0.001,
        ..EngineConfig::default()
    };
    let days = 60;
    let x1: Vec<f64> = (0..days).map(|t| 40.0 + ((t * 17) % 23) as f64 * 3.0).collect();
    let x2: Vec<f64> = (0..days).map(|t| 25.0 + ((t * 11) % 19) as f64 * 2.0).collect();

    let f1: Vec<f64> = adstock(&x1, config.adstock_half_life)
        .into_iter()
        .map(|x| saturate(x, config.saturation))
        .collect();
    let f2: Vec<f64> = adstock(&x2, config.adstock_half_life)
        .into_iter()
        .map(|x| saturate(x, config.saturation))
        .collect();
    let revenue: Vec<f64> = (0..days)
        .map(|t| 10.0 + 2.5 * f1[t] + 1.2 * f2[t])
        .collect();

    let ds = dataset(days, vec![x1, x2], revenue, &["google", "meta"]);
    let result = fit(&ds, &config, 0).unwrap();

    assert!(result.r_squared > 0.95, "r2 = {}", result.r_squared);
    assert!(!result.low_confidence);
    let c1 = result.coefficient("google").unwrap();
    let c2 = result.coefficient("meta").unwrap();
    assert!((c1 - 2.5).abs() < 0.3, "google coefficient = {c1}");
    assert!((c2 - 1.2).abs() < 0.3, "meta coefficient = {c2}");
}

/// Too little history is a DataGap, and the degraded fit keeps the
/// downstream shape stable without a single trusted coefficient.
#[test]
fn short_history_is_a_data_gap() {
    let config = EngineConfig::default();
    let ds = dataset(
        5,
        vec![vec![10.0; 5], vec![20.0; 5]],
        vec![100.0; 5],
        &["google", "meta"],
    );
    match fit(&ds, &config, 0) {
        Err(EngineError::DataGap { needed, got, .. }) => {
            assert_eq!(needed, config.mmm_min_samples);
            assert_eq!(got, 5);
        }
        other => panic!("expected DataGap, got {other:?}"),
    }

    let degraded = degraded_fit(&ds.channels, &config, ds.len());
    assert!(degraded.low_confidence);
    assert!(degraded.channels.iter().all(|c| c.coefficient.is_none()));
}

/// A zero-variance channel is dropped (coefficient unavailable) while
/// the other channels still fit.
#[test]
fn zero_variance_channel_marked_unavailable() {
    let config = EngineConfig {
        ridge_alpha: 0.001,
        ..EngineConfig::default()
    };
    let days = 40;
    let x1: Vec<f64> = (0..days).map(|t| 30.0 + ((t * 13) % 17) as f64 * 4.0).collect();
    let flat = vec![50.0; days];
    let f1: Vec<f64> = adstock(&x1, config.adstock_half_life)
        .into_iter()
        .map(|x| saturate(x, config.saturation))
        .collect();
    let revenue: Vec<f64> = (0..days).map(|t| 5.0 + 3.0 * f1[t]).collect();

    let ds = dataset(days, vec![x1, flat], revenue, &["google", "display"]);
    let result = fit(&ds, &config, 0).unwrap();

    assert!(result.coefficient("google").is_some());
    assert!(result.coefficient("display").is_none());
    assert_eq!(result.dropped, vec!["display".to_string()]);
}

/// Revenue unrelated to spend produces a pathologically low R² and the
/// fit is marked low-confidence rather than silently trusted.
#[test]
fn unrelated_revenue_is_low_confidence() {
    let config = EngineConfig::default();
    let days = 30;
    // A smooth spend ramp against revenue that only alternates: the
    // regression cannot explain the variance.
    let x1: Vec<f64> = (0..days).map(|t| 30.0 + t as f64).collect();
    let revenue: Vec<f64> = (0..days)
        .map(|t| if t % 2 == 0 { 100.0 } else { 1000.0 })
        .collect();
    let ds = dataset(days, vec![x1], revenue, &["google"]);
    let result = fit(&ds, &config, 0).unwrap();
    assert!(result.low_confidence, "r2 = {}", result.r_squared);
}

#[test]
fn confidence_rises_with_fit_and_sample_size() {
    let weak = confidence_score(0.1, 10, 0);
    let strong = confidence_score(0.9, 10, 0);
    assert!(strong > weak);

    let small = confidence_score(0.5, 5, 0);
    let large = confidence_score(0.5, 500, 0);
    assert!(large > small);

    let fresh = confidence_score(0.5, 100, 0);
    let stale = confidence_score(0.5, 100, 180);
    assert!(fresh > stale);

    for c in [weak, strong, small, large, fresh, stale] {
        assert!((0.0..=1.0).contains(&c));
    }
}

#[test]
fn modeled_share_normalizes_over_available_channels() {
    let config = EngineConfig {
        ridge_alpha: 0.001,
        ..EngineConfig::default()
    };
    let days = 40;
    let x1: Vec<f64> = (0..days).map(|t| 30.0 + ((t * 13) % 17) as f64 * 4.0).collect();
    let x2: Vec<f64> = (0..days).map(|t| 20.0 + ((t * 7) % 11) as f64 * 3.0).collect();
    let f = |xs: &[f64]| -> Vec<f64> {
        adstock(xs, config.adstock_half_life)
            .into_iter()
            .map(|x| saturate(x, config.saturation))
            .collect()
    };
    let (f1, f2) = (f(&x1), f(&x2));
    let revenue: Vec<f64> = (0..days).map(|t| 2.0 * f1[t] + 1.0 * f2[t]).collect();

    let ds = dataset(days, vec![x1, x2], revenue, &["google", "meta"]);
    let result = fit(&ds, &config, 0).unwrap();
    let share = modeled_share(&ds, &result, &config);

    let total: f64 = share.values().sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert!(share["google"] > share["meta"]);
}
