//! Attribution estimator — allocates observed order revenue to channels.
//!
//! Two interchangeable strategies behind one capability interface:
//!   - WeightedCredit: spend share in the window preceding each
//!     conversion. Always available, needs no touchpoint data.
//!   - MarkovRemoval: removal-effect credit from session touchpoint
//!     paths; falls back to WeightedCredit when too few paths exist.
//!
//! Conservation invariant: per order, credited revenue across channels
//! sums to the order's observed revenue (weights sum to 1).

use crate::error::EngineResult;
use crate::types::{Channel, EntityId, RunId};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ── Inputs ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub entity_id: EntityId,
    pub date: NaiveDate,
    pub revenue: f64,
    pub conversions: f64,
}

#[derive(Debug, Clone)]
pub struct DailySpend {
    pub date: NaiveDate,
    pub channel: Channel,
    pub spend: f64,
}

/// One observed user path: the ordered channel touches of a session
/// journey, terminating in a conversion or not.
#[derive(Debug, Clone)]
pub struct TouchpointPath {
    pub path_id: String,
    pub entity_id: EntityId,
    pub order_id: Option<String>,
    pub channels: Vec<Channel>,
    pub converted: bool,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct AttributionInput {
    pub orders: Vec<Order>,
    pub daily_spend: Vec<DailySpend>,
    pub paths: Vec<TouchpointPath>,
}

// ── Output ───────────────────────────────────────────────────────────

/// One credited slice of one order's revenue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCredit {
    pub order_id: String,
    pub event_date: NaiveDate,
    pub channel: Channel,
    pub weight: f64,
    pub credited_revenue: f64,
}

/// The persisted row, grouped by run_id — never partially overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionEvent {
    pub run_id: RunId,
    pub order_id: String,
    pub channel: Channel,
    pub weight: f64,
    pub credited_revenue: f64,
    pub model_used: String,
    pub event_date: NaiveDate,
}

// ── Capability interface ─────────────────────────────────────────────

/// The single `allocate` contract. New strategies slot in without
/// touching callers.
pub trait AttributionModel {
    fn name(&self) -> &'static str;
    fn allocate(&self, input: &AttributionInput) -> EngineResult<Vec<OrderCredit>>;
}

// ── Weighted credit ──────────────────────────────────────────────────

/// Credits each channel proportionally to its spend share in the
/// attribution window preceding each conversion.
pub struct WeightedCredit {
    pub window_days: u32,
}

impl AttributionModel for WeightedCredit {
    fn name(&self) -> &'static str {
        "weighted_credit"
    }

    fn allocate(&self, input: &AttributionInput) -> EngineResult<Vec<OrderCredit>> {
        let mut out = Vec::new();
        for order in &input.orders {
            let window_start = order.date - Duration::days(self.window_days as i64 - 1);
            let mut by_channel: BTreeMap<&str, f64> = BTreeMap::new();
            for s in &input.daily_spend {
                if s.date >= window_start && s.date <= order.date {
                    *by_channel.entry(s.channel.as_str()).or_insert(0.0) += s.spend;
                }
            }
            let total: f64 = by_channel.values().sum();
            if total <= 0.0 {
                // No spend in window: nothing earns credit for this order.
                continue;
            }
            for (channel, spend) in by_channel {
                let weight = spend / total;
                if weight <= 0.0 {
                    continue;
                }
                out.push(OrderCredit {
                    order_id: order.order_id.clone(),
                    event_date: order.date,
                    channel: channel.to_string(),
                    weight,
                    credited_revenue: order.revenue * weight,
                });
            }
        }
        Ok(out)
    }
}

// ── Markov removal effect ────────────────────────────────────────────

/// Removal-effect attribution over a first-order Markov chain of
/// channel states with absorbing conversion and null states.
pub struct MarkovRemoval {
    pub min_paths: usize,
    pub fallback: WeightedCredit,
}

impl AttributionModel for MarkovRemoval {
    fn name(&self) -> &'static str {
        "markov_removal"
    }

    fn allocate(&self, input: &AttributionInput) -> EngineResult<Vec<OrderCredit>> {
        let usable: Vec<&TouchpointPath> =
            input.paths.iter().filter(|p| !p.channels.is_empty()).collect();
        if usable.len() < self.min_paths {
            log::info!(
                "markov: {} paths < {} minimum, falling back to {}",
                usable.len(),
                self.min_paths,
                self.fallback.name()
            );
            return self.fallback.allocate(input);
        }

        let weights = match removal_effect_weights(&usable) {
            Some(w) => w,
            None => return self.fallback.allocate(input),
        };

        let mut out = Vec::new();
        for order in &input.orders {
            for (channel, weight) in &weights {
                if *weight <= 0.0 {
                    // Never-pivotal channel: zero credit, no division error.
                    continue;
                }
                out.push(OrderCredit {
                    order_id: order.order_id.clone(),
                    event_date: order.date,
                    channel: channel.clone(),
                    weight: *weight,
                    credited_revenue: order.revenue * weight,
                });
            }
        }
        Ok(out)
    }
}

/// Per-channel removal-effect weights, normalized to sum to 1.
/// None when the chain never converts at all.
pub fn removal_effect_weights(paths: &[&TouchpointPath]) -> Option<BTreeMap<Channel, f64>> {
    let mut channel_set: BTreeSet<Channel> = BTreeSet::new();
    for p in paths {
        for c in &p.channels {
            channel_set.insert(c.clone());
        }
    }
    let channels: Vec<Channel> = channel_set.into_iter().collect();
    if channels.is_empty() {
        return None;
    }

    let matrix = transition_matrix(paths, &channels);
    let base = conversion_probability(&matrix, channels.len(), None);
    if base <= 0.0 {
        return None;
    }

    let mut effects = Vec::with_capacity(channels.len());
    for i in 0..channels.len() {
        let removed = conversion_probability(&matrix, channels.len(), Some(i));
        effects.push(((base - removed) / base).max(0.0));
    }

    let total: f64 = effects.iter().sum();
    let weights = if total > 0.0 {
        channels
            .iter()
            .cloned()
            .zip(effects.iter().map(|e| e / total))
            .collect()
    } else {
        // Degenerate: no channel is ever pivotal. Split evenly rather
        // than divide by zero.
        let even = 1.0 / channels.len() as f64;
        channels.iter().cloned().map(|c| (c, even)).collect()
    };
    Some(weights)
}

/// Row-normalized transition matrix. State layout:
/// 0..n = channels, n = start, n+1 = conversion (absorbing),
/// n+2 = null (absorbing).
fn transition_matrix(paths: &[&TouchpointPath], channels: &[Channel]) -> Vec<Vec<f64>> {
    let n = channels.len();
    let (start, conv, null) = (n, n + 1, n + 2);
    let idx: HashMap<&str, usize> = channels
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();

    let mut counts = vec![vec![0.0f64; n + 3]; n + 3];
    for p in paths {
        let mut prev = start;
        for c in &p.channels {
            if let Some(&i) = idx.get(c.as_str()) {
                counts[prev][i] += 1.0;
                prev = i;
            }
        }
        let terminal = if p.converted { conv } else { null };
        counts[prev][terminal] += 1.0;
    }

    // Absorbing states loop to themselves.
    counts[conv][conv] = 1.0;
    counts[null][null] = 1.0;

    for row in counts.iter_mut() {
        let sum: f64 = row.iter().sum();
        if sum > 0.0 {
            for v in row.iter_mut() {
                *v /= sum;
            }
        }
    }
    counts
}

/// Probability of absorption in the conversion state starting from the
/// start state, with an optional channel removed (its inbound mass
/// redirected to null).
fn conversion_probability(matrix: &[Vec<f64>], n_channels: usize, removed: Option<usize>) -> f64 {
    let (start, conv, null) = (n_channels, n_channels + 1, n_channels + 2);
    let size = n_channels + 3;

    let mut m: Vec<Vec<f64>> = matrix.to_vec();
    if let Some(r) = removed {
        for row in m.iter_mut().take(size) {
            row[null] += row[r];
            row[r] = 0.0;
        }
        for v in m[r].iter_mut() {
            *v = 0.0;
        }
    }

    // Power iteration from the start state; absorbing states capture
    // all mass within a bounded number of steps.
    let mut probs = vec![0.0f64; size];
    probs[start] = 1.0;
    for _ in 0..4 * size {
        let mut next = vec![0.0f64; size];
        for (i, p) in probs.iter().enumerate() {
            if *p == 0.0 {
                continue;
            }
            for (j, q) in m[i].iter().enumerate() {
                next[j] += p * q;
            }
        }
        let delta: f64 = next
            .iter()
            .zip(probs.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        probs = next;
        if delta < 1e-12 {
            break;
        }
    }
    probs[conv]
}

// ── Diagnostics ──────────────────────────────────────────────────────

/// Path pattern frequency ("meta>google>meta" -> count). Logged to the
/// event log for observability; not used in scoring.
pub fn path_frequency(paths: &[TouchpointPath]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for p in paths {
        if p.channels.is_empty() {
            continue;
        }
        *out.entry(p.channels.join(">")).or_insert(0) += 1;
    }
    out
}

/// Finalize order credits into persistable events for a run.
pub fn to_events(run_id: &str, model_used: &str, credits: Vec<OrderCredit>) -> Vec<AttributionEvent> {
    credits
        .into_iter()
        .map(|c| AttributionEvent {
            run_id: run_id.to_string(),
            order_id: c.order_id,
            channel: c.channel,
            weight: c.weight,
            credited_revenue: c.credited_revenue,
            model_used: model_used.to_string(),
            event_date: c.event_date,
        })
        .collect()
}

/// Revenue share per channel across a batch of events.
pub fn revenue_share(events: &[AttributionEvent]) -> BTreeMap<Channel, f64> {
    let mut by_channel: BTreeMap<Channel, f64> = BTreeMap::new();
    for e in events {
        *by_channel.entry(e.channel.clone()).or_insert(0.0) += e.credited_revenue;
    }
    let total: f64 = by_channel.values().sum();
    if total > 0.0 {
        for v in by_channel.values_mut() {
            *v /= total;
        }
    }
    by_channel
}
