use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::record::MetricKind;
use crate::privacy::ClusterId;

/// Which aggregation track produced a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cluster", rename_all = "snake_case")]
pub enum Track {
    Cohort,
    Family(ClusterId),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub variance: f64,
}

/// Tracks a single record can be aggregated into: its hour cohort and its family.
pub const TRACKS_PER_RECORD: usize = 2;

/// Where a snapshot came from and under which guarantees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub mechanism: String,
    /// Budget spent by this snapshot on each reported value.
    pub epsilon: f64,
    /// Worst case a single record spends across every snapshot it can appear in
    /// (`epsilon` times `TRACKS_PER_RECORD`, sequential composition).
    #[serde(default)]
    pub per_record_epsilon: f64,
    /// Minimum number of distinct users behind the snapshot.
    pub k_threshold: usize,
}

impl Provenance {
    pub fn laplace(epsilon: f64, k_threshold: usize) -> Self {
        Self {
            source: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            mechanism: "laplace".to_string(),
            epsilon,
            per_record_epsilon: epsilon * TRACKS_PER_RECORD as f64,
            k_threshold,
        }
    }
}

/// Population-level summary of one drained cohort. Never edited after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizedSnapshot {
    pub id: Uuid,
    /// Logical timestamp; history is ordered by it.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub track: Track,
    /// Hour bucket of the cohort, for cohort-track snapshots.
    pub window: Option<DateTime<Utc>>,
    /// Records aggregated.
    pub cohort_size: usize,
    /// Distinct users behind `cohort_size`; the k-threshold applies here.
    #[serde(default)]
    pub contributors: usize,
    pub metrics: BTreeMap<MetricKind, MetricSummary>,
    /// dimension -> value -> proportion
    pub distributions: BTreeMap<String, BTreeMap<String, f64>>,
    pub privacy_noise_scale: f64,
    pub provenance: Provenance,
}
