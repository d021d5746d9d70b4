//! Budget optimizer and what-if simulator over the fitted MMM response
//! curves.
//!
//! The per-channel response is coefficient × saturation(steady-state
//! adstock of constant daily spend). Saturation is concave, so greedy
//! marginal allocation is optimal: keep assigning the next budget step
//! to the channel with the highest marginal return until exhaustion.
//! simulate() is a pure function of the already-fitted model.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::mmm::{adstock, saturate, MmmFit};
use crate::types::Channel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Days of constant spend used to reach steady-state adstock.
const ADSTOCK_HORIZON: usize = 30;

/// Finite-difference step for marginal returns in simulate().
const MARGINAL_DELTA: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub allocations: BTreeMap<Channel, f64>,
    pub projected_revenue: f64,
    /// False when the fit was too unstable to act on; allocations then
    /// echo the current spend unchanged.
    pub stable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub baseline_revenue: f64,
    pub projected_revenue: f64,
    pub projected_delta: f64,
    pub spend: BTreeMap<Channel, f64>,
}

/// One channel's fitted response curve.
#[derive(Debug, Clone)]
pub struct ResponseCurve {
    pub channel: Channel,
    pub coefficient: f64,
    pub half_life: f64,
    pub saturation: crate::config::SaturationKind,
}

impl ResponseCurve {
    /// Predicted revenue at a constant daily spend level.
    pub fn response(&self, spend: f64) -> f64 {
        if spend <= 0.0 {
            return 0.0;
        }
        let series = vec![spend; ADSTOCK_HORIZON];
        let carried = adstock(&series, self.half_life);
        self.coefficient * saturate(*carried.last().unwrap_or(&0.0), self.saturation)
    }

    /// Marginal return at a spend level (finite difference).
    pub fn marginal(&self, spend: f64, delta: f64) -> f64 {
        if delta <= 0.0 {
            return 0.0;
        }
        (self.response(spend + delta) - self.response(spend)) / delta
    }
}

/// Build usable response curves from a fit. Channels with unavailable
/// or non-positive coefficients cannot earn budget.
pub fn response_curves(fit: &MmmFit, config: &EngineConfig) -> Vec<ResponseCurve> {
    fit.channels
        .iter()
        .filter_map(|c| {
            let coef = c.coefficient?;
            if coef <= 0.0 {
                return None;
            }
            Some(ResponseCurve {
                channel: c.channel.clone(),
                coefficient: coef,
                half_life: c.adstock_half_life,
                saturation: config.saturation,
            })
        })
        .collect()
}

/// Greedy marginal-return allocation of `total_budget` across channels.
/// When the fit confidence is below the stability threshold the
/// optimizer refuses to move money and returns the current allocation
/// with stable=false.
pub fn optimize(
    fit: &MmmFit,
    total_budget: f64,
    current_spend: &BTreeMap<Channel, f64>,
    config: &EngineConfig,
) -> EngineResult<AllocationPlan> {
    let curves = response_curves(fit, config);
    if curves.is_empty() {
        return Err(EngineError::DataGap {
            scope: "optimizer".into(),
            needed: 1,
            got: 0,
        });
    }

    if fit.confidence < config.optimizer_stability_threshold {
        log::warn!(
            "optimizer: fit confidence {:.3} below threshold {:.3}, refusing to reallocate",
            fit.confidence,
            config.optimizer_stability_threshold
        );
        let projected = curves
            .iter()
            .map(|c| c.response(current_spend.get(&c.channel).copied().unwrap_or(0.0)))
            .sum();
        return Ok(AllocationPlan {
            allocations: current_spend.clone(),
            projected_revenue: projected,
            stable: false,
        });
    }

    let step = (total_budget * config.optimizer_step_pct).max(1.0);
    let mut allocations: BTreeMap<Channel, f64> =
        curves.iter().map(|c| (c.channel.clone(), 0.0)).collect();
    let mut remaining = total_budget;

    while remaining > 1e-6 {
        let add = step.min(remaining);
        let best = curves
            .iter()
            .map(|c| {
                let spend = allocations[&c.channel];
                (c, c.marginal(spend, add))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let Some((curve, marginal)) = best else {
            break;
        };
        if marginal <= 0.0 {
            break;
        }
        *allocations.entry(curve.channel.clone()).or_insert(0.0) += add;
        remaining -= add;
    }

    let projected_revenue = curves
        .iter()
        .map(|c| c.response(allocations[&c.channel]))
        .sum();

    Ok(AllocationPlan {
        allocations,
        projected_revenue,
        stable: true,
    })
}

/// Re-evaluate the fitted model at perturbed spend levels. `deltas` are
/// fractional changes per channel (0.2 = +20%). Pure: no state mutated.
/// A simulation without a usable fit is a structured error, never a
/// best-guess number.
pub fn simulate(
    fit: &MmmFit,
    current_spend: &BTreeMap<Channel, f64>,
    deltas: &BTreeMap<Channel, f64>,
    config: &EngineConfig,
) -> EngineResult<SimulationResult> {
    let curves = response_curves(fit, config);
    if curves.is_empty() {
        return Err(EngineError::DataGap {
            scope: "simulator".into(),
            needed: 1,
            got: 0,
        });
    }

    let mut baseline_revenue = 0.0;
    let mut projected_revenue = 0.0;
    let mut new_spend = BTreeMap::new();
    for curve in &curves {
        let spend = current_spend.get(&curve.channel).copied().unwrap_or(0.0);
        let factor = 1.0 + deltas.get(&curve.channel).copied().unwrap_or(0.0);
        let perturbed = (spend * factor).max(0.0);
        baseline_revenue += curve.response(spend);
        projected_revenue += curve.response(perturbed);
        new_spend.insert(curve.channel.clone(), perturbed);
    }

    Ok(SimulationResult {
        baseline_revenue,
        projected_revenue,
        projected_delta: projected_revenue - baseline_revenue,
        spend: new_spend,
    })
}

/// Marginal returns per channel at a given allocation. Exposed for the
/// equal-marginal convergence check.
pub fn marginal_returns(
    fit: &MmmFit,
    allocations: &BTreeMap<Channel, f64>,
    config: &EngineConfig,
) -> BTreeMap<Channel, f64> {
    response_curves(fit, config)
        .into_iter()
        .map(|c| {
            let spend = allocations.get(&c.channel).copied().unwrap_or(0.0);
            let m = c.marginal(spend, MARGINAL_DELTA);
            (c.channel, m)
        })
        .collect()
}
