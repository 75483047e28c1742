use serde::{Deserialize, Serialize};

use crate::error::SkipReason;
use crate::selector::EmissionStrategy;

// Allowed: enums, counts
// Forbidden: digests, cluster ids, tags, metric values, timestamps

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    OccasionAccepted {
        strategy: EmissionStrategy,
        deferred: usize,
    },

    OccasionSkipped {
        reason: SkipReason,
    },

    /// A submit was not followed by an immediate aggregation request because the queue was full.
    QueueSaturated,

    BelowThreshold {
        track: TrackKind,
    },

    Drained {
        track: TrackKind,
        records: usize,
    },

    Published {
        track: TrackKind,
        retries: u32,
    },

    /// Staged records went back to their bucket after a failed write.
    Restored {
        track: TrackKind,
        records: usize,
    },

    Expired {
        track: TrackKind,
        records: usize,
    },

    PersistFailed {
        track: TrackKind,
    },

    MatrixPersisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Cohort,
    Family,
}
