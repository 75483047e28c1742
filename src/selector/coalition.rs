use serde::{Deserialize, Serialize};

use super::activation::{ChannelActivation, ValidatedActivations};
use super::coupling::CouplingMatrix;
use crate::config::{ReadinessWeights, SelectorConfig};
use crate::privacy::{ClusterId, Pseudonymizer};

/// Channels co-active around one anchor, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub anchor: String,
    /// (channel index, strength), at least two entries.
    pub members: Vec<(usize, f64)>,
}

/// A scored coalition ("nexus"). Ephemeral per occasion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coalition {
    pub anchor: String,
    pub members: Vec<ChannelActivation>,
    pub coherence: f64,
    pub intersection_strength: f64,
    pub field_strength: f64,
    /// Weighted sum of the three scores above.
    pub readiness: f64,
    pub cluster_id: ClusterId,
    /// Consecutive cycles this anchor has spent outside the readiness window.
    pub deferrals: u32,
}

impl Coalition {
    pub fn channel_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.channel.as_str()).collect()
    }
}

/// Gate 1: per anchor, keep channels strictly above `threshold`; an anchor
/// needs at least two of them. Capped at `max_coalitions`.
pub fn intersection_gate(activations: &ValidatedActivations, threshold: f64, max_coalitions: usize) -> Vec<Candidate> {
    activations
        .anchors
        .iter()
        .filter_map(|(anchor, channels)| {
            let members: Vec<(usize, f64)> = channels
                .iter()
                .map(|&i| (i, activations.strengths[i]))
                .filter(|&(_, s)| s > threshold)
                .collect();
            (members.len() >= 2).then(|| Candidate { anchor: anchor.clone(), members })
        })
        .take(max_coalitions)
        .collect()
}

/// Scores a candidate against the current coupling matrix.
pub fn score(candidate: &Candidate, matrix: &CouplingMatrix, config: &SelectorConfig, pseudonymizer: &Pseudonymizer) -> Coalition {
    let strengths: Vec<f64> = candidate.members.iter().map(|&(_, s)| s).collect();
    let indices: Vec<usize> = candidate.members.iter().map(|&(i, _)| i).collect();

    let max = strengths.iter().cloned().fold(0.0_f64, f64::max);
    let min = strengths.iter().cloned().fold(f64::INFINITY, f64::min);
    let balance = if max > 0.0 { min / max } else { 0.0 };

    let mut pair_total = 0.0;
    let mut pairs = 0usize;
    for (a, s_a) in strengths.iter().enumerate() {
        for s_b in &strengths[a + 1..] {
            pair_total += s_a * s_b;
            pairs += 1;
        }
    }
    let intersection_strength = if pairs == 0 { 0.0 } else { pair_total / pairs as f64 };
    let field_strength = strengths.iter().sum::<f64>() / strengths.len().max(1) as f64;

    let lambda = config.coupling_influence;
    let coherence = (1.0 - lambda) * balance + lambda * matrix.mean_coupling(&indices);
    let readiness = readiness(&config.readiness_weights, coherence, intersection_strength, field_strength);

    let members: Vec<ChannelActivation> = candidate
        .members
        .iter()
        .map(|&(i, strength)| ChannelActivation { channel: config.channels[i].clone(), strength })
        .collect();
    let names: Vec<&str> = members.iter().map(|m| m.channel.as_str()).collect();

    Coalition {
        anchor: candidate.anchor.clone(),
        cluster_id: pseudonymizer.cluster_id(&names),
        members,
        coherence,
        intersection_strength,
        field_strength,
        readiness,
        deferrals: 0,
    }
}

pub fn readiness(weights: &ReadinessWeights, coherence: f64, intersection: f64, field: f64) -> f64 {
    weights.coherence * coherence + weights.intersection * intersection + weights.field * field
}

/// Gate 2: drop coalitions below the coherence threshold.
pub fn coherence_gate(coalitions: Vec<Coalition>, threshold: f64) -> Vec<Coalition> {
    coalitions.into_iter().filter(|c| c.coherence >= threshold).collect()
}

/// Gate 3: split into (in window, deferred). Deferred coalitions are not discarded here.
pub fn window_gate(coalitions: Vec<Coalition>, window_min: f64, window_max: f64) -> (Vec<Coalition>, Vec<Coalition>) {
    coalitions
        .into_iter()
        .partition(|c| c.readiness >= window_min && c.readiness <= window_max)
}

/// Highest readiness among surviving coalitions, 0 when none survive.
/// Every caller that needs nexus quality goes through here.
pub fn nexus_quality(survivors: &[Coalition]) -> f64 {
    survivors.iter().map(|c| c.readiness).fold(0.0, f64::max)
}
