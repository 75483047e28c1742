use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::coalition::Coalition;
use crate::config::SelectorConfig;
use crate::privacy::ClusterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionStrategy {
    Direct,
    Fusion,
    Fallback,
}

impl EmissionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionStrategy::Direct => "direct",
            EmissionStrategy::Fusion => "fusion",
            EmissionStrategy::Fallback => "fallback",
        }
    }
}

/// Gate 4. `template_match` says whether a sub-population template covers a survivor.
pub fn strategy_gate(nexus_quality: f64, template_match: bool, config: &SelectorConfig) -> EmissionStrategy {
    if nexus_quality >= config.direct_threshold {
        EmissionStrategy::Direct
    } else if nexus_quality >= config.fusion_threshold && template_match {
        EmissionStrategy::Fusion
    } else {
        EmissionStrategy::Fallback
    }
}

/// Family clusters that have reached their own k-threshold and may back a fusion emission.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    clusters: HashSet<ClusterId>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_clusters<I: IntoIterator<Item = ClusterId>>(clusters: I) -> Self {
        Self { clusters: clusters.into_iter().collect() }
    }

    pub fn register(&mut self, cluster: ClusterId) -> bool {
        self.clusters.insert(cluster)
    }

    pub fn contains(&self, cluster: &ClusterId) -> bool {
        self.clusters.contains(cluster)
    }

    pub fn matches_any(&self, survivors: &[Coalition]) -> bool {
        survivors.iter().any(|c| self.contains(&c.cluster_id))
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}
