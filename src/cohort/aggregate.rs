use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::record::{MetricKind, OccasionRecord};
use super::snapshot::{AnonymizedSnapshot, MetricSummary, Provenance, Track};
use crate::privacy::{LaplaceMechanism, UserDigest};

/// Noisy statistics over one drain, not yet stamped as a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortAggregate {
    /// Records in the drain.
    pub cohort_size: usize,
    /// Distinct users behind those records.
    pub contributors: usize,
    pub metrics: BTreeMap<MetricKind, MetricSummary>,
    pub distributions: BTreeMap<String, BTreeMap<String, f64>>,
    /// Largest Laplace scale applied to any reported value.
    pub privacy_noise_scale: f64,
}

impl CohortAggregate {
    pub fn into_snapshot(self, sequence: u64, track: Track, window: Option<DateTime<Utc>>, provenance: Provenance) -> AnonymizedSnapshot {
        AnonymizedSnapshot {
            id: Uuid::new_v4(),
            sequence,
            created_at: Utc::now(),
            track,
            window,
            cohort_size: self.cohort_size,
            contributors: self.contributors,
            metrics: self.metrics,
            distributions: self.distributions,
            privacy_noise_scale: self.privacy_noise_scale,
            provenance,
        }
    }
}

/// One user's records inside a drain, folded into a single contribution so that
/// no user moves any statistic by more than one contributor's worth.
#[derive(Debug, Default)]
struct Contribution {
    /// Per-metric mean over the user's records.
    metrics: BTreeMap<MetricKind, f64>,
    /// dimension -> value -> share of the user's records; each dimension sums to at most 1.
    categories: BTreeMap<String, BTreeMap<String, f64>>,
}

fn contributions(records: &[OccasionRecord]) -> Vec<Contribution> {
    let mut by_user: BTreeMap<&UserDigest, Vec<&OccasionRecord>> = BTreeMap::new();
    for record in records {
        by_user.entry(record.hashed_user_id()).or_default().push(record);
    }

    by_user
        .into_values()
        .map(|own| {
            let weight = 1.0 / own.len() as f64;
            let mut sums: BTreeMap<MetricKind, (f64, usize)> = BTreeMap::new();
            let mut categories: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
            for record in &own {
                for (&kind, &value) in record.metrics() {
                    let entry = sums.entry(kind).or_insert((0.0, 0));
                    entry.0 += value;
                    entry.1 += 1;
                }
                for (dimension, value) in record.categories() {
                    *categories
                        .entry(dimension.to_string())
                        .or_default()
                        .entry(value.to_string())
                        .or_insert(0.0) += weight;
                }
            }
            Contribution {
                metrics: sums.into_iter().map(|(kind, (sum, n))| (kind, sum / n as f64)).collect(),
                categories,
            }
        })
        .collect()
}

/// Mean, population variance and contributor count per metric, taken over
/// per-user means. Used only inside aggregation.
fn statistics(contributions: &[Contribution]) -> BTreeMap<MetricKind, (MetricSummary, usize)> {
    let mut sums: BTreeMap<MetricKind, (f64, f64, usize)> = BTreeMap::new();
    for contribution in contributions {
        for (&kind, &value) in &contribution.metrics {
            let entry = sums.entry(kind).or_insert((0.0, 0.0, 0));
            entry.0 += value;
            entry.1 += value * value;
            entry.2 += 1;
        }
    }
    sums.into_iter()
        .map(|(kind, (sum, sum_sq, users))| {
            let n = users as f64;
            let mean = sum / n;
            let variance = (sum_sq / n - mean * mean).max(0.0);
            (kind, (MetricSummary { mean, variance }, users))
        })
        .collect()
}

/// Exact per-metric statistics of a drain, each user weighted once.
pub fn exact_statistics(records: &[OccasionRecord]) -> BTreeMap<MetricKind, MetricSummary> {
    statistics(&contributions(records))
        .into_iter()
        .map(|(kind, (summary, _))| (kind, summary))
        .collect()
}

fn category_weights(contributions: &[Contribution]) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut totals: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for contribution in contributions {
        for (dimension, values) in &contribution.categories {
            let column = totals.entry(dimension.clone()).or_default();
            for (value, share) in values {
                *column.entry(value.clone()).or_insert(0.0) += share;
            }
        }
    }
    totals
}

/// Computes noisy statistics over a drained set. Returns `None` for an empty set;
/// the k-threshold is the caller's gate, this function never sees an under-threshold drain.
///
/// Records are first folded per hashed user, so `n` below is the number of
/// distinct users, however many turns each of them produced.
/// - metric means get Laplace noise with scale `range / (n·ε)`, variances `range² / (n·ε)`;
///   both are clamped back into their feasible range afterwards.
/// - categorical weights (one unit per user per dimension) get Laplace(`1/ε`),
///   are floored at 0 and reported as proportions.
pub fn aggregate<R: Rng + ?Sized>(records: &[OccasionRecord], mechanism: &LaplaceMechanism, rng: &mut R) -> Option<CohortAggregate> {
    if records.is_empty() {
        return None;
    }
    let folded = contributions(records);
    let mut max_scale: f64 = 0.0;

    let mut metrics = BTreeMap::new();
    for (kind, (exact, users)) in statistics(&folded) {
        let range = kind.range();
        let n = users.max(1) as f64;
        let (mean, mean_scale) = mechanism.perturb(rng, exact.mean, range / n);
        let (variance, var_scale) = mechanism.perturb(rng, exact.variance, range * range / n);
        max_scale = max_scale.max(mean_scale).max(var_scale);
        metrics.insert(
            kind,
            MetricSummary {
                mean: mean.clamp(0.0, range),
                variance: variance.clamp(0.0, range * range / 4.0),
            },
        );
    }

    let mut distributions = BTreeMap::new();
    for (dimension, weights) in category_weights(&folded) {
        let mut noisy = BTreeMap::new();
        for (value, weight) in weights {
            let (c, scale) = mechanism.perturb(rng, weight, 1.0);
            max_scale = max_scale.max(scale);
            noisy.insert(value, c.max(0.0));
        }
        let total: f64 = noisy.values().sum();
        if total <= 0.0 {
            continue;
        }
        let proportions = noisy.into_iter().map(|(v, c)| (v, c / total)).collect();
        distributions.insert(dimension, proportions);
    }

    Some(CohortAggregate {
        cohort_size: records.len(),
        contributors: folded.len(),
        metrics,
        distributions,
        privacy_noise_scale: max_scale,
    })
}
