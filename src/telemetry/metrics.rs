use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::event::{EngineEvent, TrackKind};
use crate::selector::EmissionStrategy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub occasions: OccasionStats,
    pub cohort: TrackStats,
    pub family: TrackStats,
    pub queue_saturations: u64,
    pub matrix_writes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OccasionStats {
    pub accepted: u64,
    pub skipped: u64,
    pub direct: u64,
    pub fusion: u64,
    pub fallback: u64,
    pub deferred_coalitions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackStats {
    pub below_threshold: u64,
    pub drains: u64,
    pub records_drained: u64,
    pub published: u64,
    pub persist_retries: u64,
    pub persist_failures: u64,
    pub records_restored: u64,
    pub records_expired: u64,
}

impl TrackStats {
    fn merge(&mut self, other: &TrackStats) {
        self.below_threshold += other.below_threshold;
        self.drains += other.drains;
        self.records_drained += other.records_drained;
        self.published += other.published;
        self.persist_retries += other.persist_retries;
        self.persist_failures += other.persist_failures;
        self.records_restored += other.records_restored;
        self.records_expired += other.records_expired;
    }
}

impl EngineStats {
    fn track(&mut self, kind: TrackKind) -> &mut TrackStats {
        match kind {
            TrackKind::Cohort => &mut self.cohort,
            TrackKind::Family => &mut self.family,
        }
    }

    pub fn apply(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::OccasionAccepted { strategy, deferred } => {
                self.occasions.accepted += 1;
                self.occasions.deferred_coalitions += *deferred as u64;
                match strategy {
                    EmissionStrategy::Direct => self.occasions.direct += 1,
                    EmissionStrategy::Fusion => self.occasions.fusion += 1,
                    EmissionStrategy::Fallback => self.occasions.fallback += 1,
                }
            }
            EngineEvent::OccasionSkipped { .. } => self.occasions.skipped += 1,
            EngineEvent::QueueSaturated => self.queue_saturations += 1,
            EngineEvent::BelowThreshold { track } => self.track(*track).below_threshold += 1,
            EngineEvent::Drained { track, records } => {
                let t = self.track(*track);
                t.drains += 1;
                t.records_drained += *records as u64;
            }
            EngineEvent::Published { track, retries } => {
                let t = self.track(*track);
                t.published += 1;
                t.persist_retries += *retries as u64;
            }
            EngineEvent::Restored { track, records } => self.track(*track).records_restored += *records as u64,
            EngineEvent::Expired { track, records } => self.track(*track).records_expired += *records as u64,
            EngineEvent::PersistFailed { track } => self.track(*track).persist_failures += 1,
            EngineEvent::MatrixPersisted => self.matrix_writes += 1,
        }
    }

    pub fn merge(&mut self, other: &EngineStats) {
        let o = &other.occasions;
        self.occasions.accepted += o.accepted;
        self.occasions.skipped += o.skipped;
        self.occasions.direct += o.direct;
        self.occasions.fusion += o.fusion;
        self.occasions.fallback += o.fallback;
        self.occasions.deferred_coalitions += o.deferred_coalitions;
        self.cohort.merge(&other.cohort);
        self.family.merge(&other.family);
        self.queue_saturations += other.queue_saturations;
        self.matrix_writes += other.matrix_writes;
    }
}

pub fn compute_stats(events: &VecDeque<EngineEvent>) -> EngineStats {
    let mut stats = EngineStats::default();
    for event in events {
        stats.apply(event);
    }
    stats
}
