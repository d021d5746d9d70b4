//! Marketing-mix model — regression of revenue on adstock-transformed,
//! saturation-transformed spend per channel.
//!
//! The fit is re-estimated per run over a rolling lookback window, so
//! the model adapts to regime change. Confidence in any MMM-derived
//! claim is tied to R² and sample size; a fit on insufficient history
//! or with a pathologically low R² is marked low-confidence and
//! downstream consumers must treat it that way.

use crate::config::{EngineConfig, SaturationKind};
use crate::error::{EngineError, EngineResult};
use crate::types::Channel;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MODEL_VERSION: &str = "mmm-v2";

// ── Transforms ───────────────────────────────────────────────────────

/// Geometric adstock: out[t] = x[t] + decay * out[t-1], with
/// decay = 0.5^(1/half_life). A non-positive half-life disables carry.
pub fn adstock(xs: &[f64], half_life: f64) -> Vec<f64> {
    if half_life <= 0.0 || xs.is_empty() {
        return xs.to_vec();
    }
    let decay = 0.5f64.powf(1.0 / half_life);
    let mut out = Vec::with_capacity(xs.len());
    let mut carry = 0.0;
    for &x in xs {
        carry = x + decay * carry;
        out.push(carry);
    }
    out
}

/// Diminishing-returns transform applied after adstock.
pub fn saturate(x: f64, kind: SaturationKind) -> f64 {
    let x = x.max(0.0);
    match kind {
        SaturationKind::Log => x.ln_1p(),
        SaturationKind::Hill {
            alpha,
            half_saturation,
        } => {
            let xa = x.max(1e-10).powf(alpha);
            xa / (xa + half_saturation.powf(alpha))
        }
    }
}

// ── Dataset ──────────────────────────────────────────────────────────

/// Date-aligned spend-per-channel and total-revenue series over the
/// lookback window.
#[derive(Debug, Clone)]
pub struct MmmDataset {
    pub dates: Vec<NaiveDate>,
    pub channels: Vec<Channel>,
    /// spend[c][t] = channel c's spend on day t.
    pub spend: Vec<Vec<f64>>,
    pub revenue: Vec<f64>,
}

impl MmmDataset {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

// ── Fit output ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmmChannelResult {
    pub channel: Channel,
    /// None when the channel was dropped (zero variance or degenerate
    /// solve) — unavailable, not zero.
    pub coefficient: Option<f64>,
    pub intercept: f64,
    pub adstock_half_life: f64,
    pub saturation_param: f64,
    pub r_squared: f64,
    pub sample_size: usize,
    pub low_confidence: bool,
    pub model_version: String,
}

#[derive(Debug, Clone)]
pub struct MmmFit {
    pub channels: Vec<MmmChannelResult>,
    pub r_squared: f64,
    pub sample_size: usize,
    pub low_confidence: bool,
    /// Composite fit confidence in [0, 1] from R², sample size, and
    /// data recency.
    pub confidence: f64,
    pub dropped: Vec<Channel>,
}

impl MmmFit {
    pub fn coefficient(&self, channel: &str) -> Option<f64> {
        self.channels
            .iter()
            .find(|c| c.channel == channel)
            .and_then(|c| c.coefficient)
    }
}

// ── Fitting ──────────────────────────────────────────────────────────

/// Fit the MMM over the dataset. DataGap when history is too short to
/// attempt a fit at all; the caller degrades to a low-confidence
/// placeholder rather than crashing the run.
pub fn fit(dataset: &MmmDataset, config: &EngineConfig, data_age_days: i64) -> EngineResult<MmmFit> {
    let n = dataset.len();
    if n < config.mmm_min_samples {
        return Err(EngineError::DataGap {
            scope: "mmm".into(),
            needed: config.mmm_min_samples,
            got: n,
        });
    }

    // Drop zero-variance channels before the solve: their coefficient
    // is unidentifiable. Other channels proceed.
    let mut kept: Vec<usize> = Vec::new();
    let mut dropped: Vec<Channel> = Vec::new();
    for (c, series) in dataset.spend.iter().enumerate() {
        if variance(series) > 1e-12 {
            kept.push(c);
        } else {
            log::warn!(
                "mmm: channel '{}' has zero spend variance, marking unavailable",
                dataset.channels[c]
            );
            dropped.push(dataset.channels[c].clone());
        }
    }

    let transformed: Vec<Vec<f64>> = kept
        .iter()
        .map(|&c| {
            adstock(&dataset.spend[c], config.adstock_half_life)
                .into_iter()
                .map(|x| saturate(x, config.saturation))
                .collect()
        })
        .collect();

    let solved = if transformed.is_empty() {
        None
    } else {
        match ridge_solve(&transformed, &dataset.revenue, config.ridge_alpha) {
            Ok(s) => Some(s),
            Err(EngineError::ModelDivergence { reason, .. }) => {
                log::warn!("mmm: degenerate solve ({reason}); all channels marked unavailable");
                None
            }
            Err(e) => return Err(e),
        }
    };

    let (coefs, intercept, r_squared) = match solved {
        Some((coefs, intercept)) => {
            let r2 = r_squared_of(&transformed, &coefs, intercept, &dataset.revenue);
            (Some(coefs), intercept, r2)
        }
        None => (None, 0.0, 0.0),
    };

    let low_confidence = coefs.is_none() || r_squared < config.mmm_low_r2;
    let confidence = confidence_score(r_squared, n, data_age_days);

    let mut channels = Vec::with_capacity(dataset.channels.len());
    for (c, name) in dataset.channels.iter().enumerate() {
        let coefficient = kept
            .iter()
            .position(|&k| k == c)
            .and_then(|pos| coefs.as_ref().map(|cs| cs[pos]));
        channels.push(MmmChannelResult {
            channel: name.clone(),
            coefficient,
            intercept,
            adstock_half_life: config.adstock_half_life,
            saturation_param: config.saturation.param(),
            r_squared,
            sample_size: n,
            low_confidence,
            model_version: MODEL_VERSION.to_string(),
        });
    }

    Ok(MmmFit {
        channels,
        r_squared,
        sample_size: n,
        low_confidence,
        confidence,
        dropped,
    })
}

/// A degraded fit for when history is too short: every channel
/// unavailable, zero R², low confidence. Keeps downstream shape stable.
pub fn degraded_fit(channels: &[Channel], config: &EngineConfig, sample_size: usize) -> MmmFit {
    let channel_results = channels
        .iter()
        .map(|name| MmmChannelResult {
            channel: name.clone(),
            coefficient: None,
            intercept: 0.0,
            adstock_half_life: config.adstock_half_life,
            saturation_param: config.saturation.param(),
            r_squared: 0.0,
            sample_size,
            low_confidence: true,
            model_version: MODEL_VERSION.to_string(),
        })
        .collect();
    MmmFit {
        channels: channel_results,
        r_squared: 0.0,
        sample_size,
        low_confidence: true,
        confidence: 0.0,
        dropped: channels.to_vec(),
    }
}

/// Ridge-regularized least squares with an unpenalized intercept.
/// Returns (coefficients, intercept), or ModelDivergence when the
/// normal equations are singular or the solution is non-finite.
fn ridge_solve(features: &[Vec<f64>], y: &[f64], alpha: f64) -> EngineResult<(Vec<f64>, f64)> {
    let k = features.len();
    let n = y.len();
    let dim = k + 1; // + intercept column

    // Normal equations A β = b with A = XᵀX + αD (D zero for intercept).
    let mut a = vec![vec![0.0f64; dim]; dim];
    let mut b = vec![0.0f64; dim];
    let col = |j: usize, t: usize| -> f64 {
        if j < k {
            features[j][t]
        } else {
            1.0
        }
    };
    for i in 0..dim {
        for j in 0..dim {
            let mut s = 0.0;
            for t in 0..n {
                s += col(i, t) * col(j, t);
            }
            a[i][j] = s;
        }
        let mut s = 0.0;
        for t in 0..n {
            s += col(i, t) * y[t];
        }
        b[i] = s;
    }
    for (i, row) in a.iter_mut().enumerate().take(k) {
        row[i] += alpha;
    }

    // Gaussian elimination with partial pivoting.
    for p in 0..dim {
        let mut pivot = p;
        for r in p + 1..dim {
            if a[r][p].abs() > a[pivot][p].abs() {
                pivot = r;
            }
        }
        if a[pivot][p].abs() < 1e-12 {
            return Err(EngineError::ModelDivergence {
                channel: "joint".into(),
                reason: format!("singular normal equations at column {p}"),
            });
        }
        a.swap(p, pivot);
        b.swap(p, pivot);
        for r in p + 1..dim {
            let f = a[r][p] / a[p][p];
            for c in p..dim {
                a[r][c] -= f * a[p][c];
            }
            b[r] -= f * b[p];
        }
    }
    let mut beta = vec![0.0f64; dim];
    for p in (0..dim).rev() {
        let mut s = b[p];
        for c in p + 1..dim {
            s -= a[p][c] * beta[c];
        }
        beta[p] = s / a[p][p];
    }
    if beta.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::ModelDivergence {
            channel: "joint".into(),
            reason: "non-finite solution".into(),
        });
    }

    let intercept = beta[k];
    beta.truncate(k);
    Ok((beta, intercept))
}

fn r_squared_of(features: &[Vec<f64>], coefs: &[f64], intercept: f64, y: &[f64]) -> f64 {
    let n = y.len();
    if n == 0 {
        return 0.0;
    }
    let mean = y.iter().sum::<f64>() / n as f64;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for t in 0..n {
        let mut pred = intercept;
        for (j, c) in coefs.iter().enumerate() {
            pred += c * features[j][t];
        }
        ss_res += (y[t] - pred).powi(2);
        ss_tot += (y[t] - mean).powi(2);
    }
    if ss_tot < 1e-12 {
        return 0.0;
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

fn variance(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
    xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64
}

/// Composite confidence in [0, 1]: R² contributes up to 0.5, sample
/// size up to 0.3 on a log scale, recency up to 0.2 with a 90-day
/// half-life decay.
pub fn confidence_score(r2: f64, sample_size: usize, data_age_days: i64) -> f64 {
    let mut score = 0.5 * r2.clamp(0.0, 1.0);
    if sample_size > 0 {
        score += 0.3 * ((1.0 + sample_size as f64).ln() / 7.0).min(1.0);
    }
    score += 0.2 * 0.5f64.powf(data_age_days.max(0) as f64 / 90.0);
    score.clamp(0.0, 1.0)
}

/// Modeled revenue share per channel: contribution_c = coef_c times the
/// summed transformed spend series, floored at zero, normalized.
pub fn modeled_share(dataset: &MmmDataset, fit: &MmmFit, config: &EngineConfig) -> BTreeMap<Channel, f64> {
    let mut contributions: BTreeMap<Channel, f64> = BTreeMap::new();
    for (c, name) in dataset.channels.iter().enumerate() {
        let Some(coef) = fit.coefficient(name) else {
            continue;
        };
        let transformed_sum: f64 = adstock(&dataset.spend[c], config.adstock_half_life)
            .into_iter()
            .map(|x| saturate(x, config.saturation))
            .sum();
        contributions.insert(name.clone(), (coef * transformed_sum).max(0.0));
    }
    let total: f64 = contributions.values().sum();
    if total > 0.0 {
        for v in contributions.values_mut() {
            *v /= total;
        }
    }
    contributions
}
