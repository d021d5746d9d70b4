//! Disagreement monitor — compares attribution-derived and MMM-derived
//! channel revenue shares and flags instability when they diverge.
//!
//! The output is advisory metadata: every recommendation generated in a
//! run carries the disagreement score that was in effect when it was
//! generated, not a stale one.

use crate::config::EngineConfig;
use crate::types::Channel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAlignment {
    pub channel: Channel,
    pub attribution_pct: f64,
    pub mmm_pct: f64,
    pub delta: f64,
    /// Per-channel conflict at a stricter threshold than the overall
    /// instability flag.
    pub conflict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisagreementSummary {
    /// Mean absolute difference between the two share vectors.
    pub score: f64,
    pub threshold: f64,
    pub instability_flagged: bool,
    pub channel_alignment: Vec<ChannelAlignment>,
}

/// Compare the two share vectors over the union of channels. A channel
/// missing from one side contributes its full share as disagreement.
pub fn compare(
    attribution_share: &BTreeMap<Channel, f64>,
    mmm_share: &BTreeMap<Channel, f64>,
    config: &EngineConfig,
) -> DisagreementSummary {
    let channels: BTreeSet<&Channel> = attribution_share.keys().chain(mmm_share.keys()).collect();

    let mut alignment = Vec::with_capacity(channels.len());
    let mut deltas = Vec::with_capacity(channels.len());
    for channel in channels {
        let a = attribution_share.get(channel).copied().unwrap_or(0.0);
        let m = mmm_share.get(channel).copied().unwrap_or(0.0);
        let delta = (a - m).abs();
        deltas.push(delta);
        alignment.push(ChannelAlignment {
            channel: channel.clone(),
            attribution_pct: a,
            mmm_pct: m,
            delta,
            conflict: delta > config.channel_conflict_threshold,
        });
    }

    let score = if deltas.is_empty() {
        0.0
    } else {
        deltas.iter().sum::<f64>() / deltas.len() as f64
    };

    DisagreementSummary {
        score,
        threshold: config.disagreement_threshold,
        instability_flagged: score > config.disagreement_threshold,
        channel_alignment: alignment,
    }
}
