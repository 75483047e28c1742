use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::privacy::{bucket_timestamp, UserDigest};
use crate::selector::EmissionStrategy;

/// Dimension name under which the emission strategy is counted.
pub const STRATEGY_DIMENSION: &str = "strategy";

const MAX_TAG_LEN: usize = 32;

/// Aggregate-eligible metrics produced by the selector. All live in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    NexusQuality,
    Coherence,
    FieldStrength,
    OutcomeQuality,
    ActiveRatio,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::NexusQuality,
        MetricKind::Coherence,
        MetricKind::FieldStrength,
        MetricKind::OutcomeQuality,
        MetricKind::ActiveRatio,
    ];

    /// Width of the value range; one contributor moves a mean by at most `range / n`.
    pub fn range(&self) -> f64 {
        1.0
    }
}

pub type MetricVector = BTreeMap<MetricKind, f64>;

/// Cohort = one bucketed hour window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CohortKey {
    pub window: DateTime<Utc>,
}

impl CohortKey {
    pub fn for_time(t: DateTime<Utc>) -> Self {
        Self { window: bucket_timestamp(t) }
    }
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.window.format("%Y-%m-%dT%H:00Z"))
    }
}

/// One occasion, already stripped of identity. Immutable once built and
/// consumed exactly once by aggregation; never persisted individually.
#[derive(Debug, Clone, PartialEq)]
pub struct OccasionRecord {
    hashed_user_id: UserDigest,
    bucketed_timestamp: DateTime<Utc>,
    metrics: MetricVector,
    tags: BTreeMap<String, String>,
    emission_strategy: EmissionStrategy,
}

impl OccasionRecord {
    /// `at` is bucketed here; the raw time is not retained.
    pub fn new(
        hashed_user_id: UserDigest,
        at: DateTime<Utc>,
        metrics: MetricVector,
        tags: BTreeMap<String, String>,
        emission_strategy: EmissionStrategy,
    ) -> Self {
        Self {
            hashed_user_id,
            bucketed_timestamp: bucket_timestamp(at),
            metrics,
            tags,
            emission_strategy,
        }
    }

    pub fn hashed_user_id(&self) -> &UserDigest {
        &self.hashed_user_id
    }

    pub fn bucketed_timestamp(&self) -> DateTime<Utc> {
        self.bucketed_timestamp
    }

    pub fn cohort_key(&self) -> CohortKey {
        CohortKey { window: self.bucketed_timestamp }
    }

    pub fn metrics(&self) -> &MetricVector {
        &self.metrics
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn emission_strategy(&self) -> EmissionStrategy {
        self.emission_strategy
    }

    /// Every categorical (dimension, value) pair, strategy included.
    pub fn categories(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .map(|(d, v)| (d.as_str(), v.as_str()))
            .chain(std::iter::once((STRATEGY_DIMENSION, self.emission_strategy.as_str())))
    }
}

/// Tags must be short lowercase tokens; anything resembling free text is refused.
pub fn is_valid_tag(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TAG_LEN
        && token.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}
