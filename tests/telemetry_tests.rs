use cohort_engine::error::SkipReason;
use cohort_engine::selector::EmissionStrategy;
use cohort_engine::telemetry::{compute_stats, EngineEvent, TelemetryRecorder, TrackKind};
use std::collections::VecDeque;

#[test]
fn test_stats_fold() {
    let events: VecDeque<EngineEvent> = vec![
        EngineEvent::OccasionAccepted { strategy: EmissionStrategy::Direct, deferred: 0 },
        EngineEvent::OccasionAccepted { strategy: EmissionStrategy::Fallback, deferred: 2 },
        EngineEvent::OccasionSkipped { reason: SkipReason::OutOfRange },
        EngineEvent::BelowThreshold { track: TrackKind::Cohort },
        EngineEvent::Drained { track: TrackKind::Cohort, records: 12 },
        EngineEvent::Published { track: TrackKind::Cohort, retries: 1 },
        EngineEvent::Drained { track: TrackKind::Family, records: 5 },
        EngineEvent::PersistFailed { track: TrackKind::Family },
        EngineEvent::Restored { track: TrackKind::Family, records: 5 },
        EngineEvent::MatrixPersisted,
    ]
    .into();

    let stats = compute_stats(&events);

    assert_eq!(stats.occasions.accepted, 2);
    assert_eq!(stats.occasions.direct, 1);
    assert_eq!(stats.occasions.fallback, 1);
    assert_eq!(stats.occasions.deferred_coalitions, 2);
    assert_eq!(stats.occasions.skipped, 1);
    assert_eq!(stats.cohort.records_drained, 12);
    assert_eq!(stats.cohort.published, 1);
    assert_eq!(stats.cohort.persist_retries, 1);
    assert_eq!(stats.family.persist_failures, 1);
    assert_eq!(stats.family.records_restored, 5);
    assert_eq!(stats.family.published, 0);
    assert_eq!(stats.matrix_writes, 1);
}

#[test]
fn test_counters_survive_ring_eviction() {
    let mut recorder = TelemetryRecorder::new();
    for _ in 0..25_000 {
        recorder.record(EngineEvent::OccasionAccepted { strategy: EmissionStrategy::Fusion, deferred: 0 });
    }

    let stats = recorder.snapshot();
    assert_eq!(stats.occasions.accepted, 25_000, "Evicted events still count");
    assert_eq!(stats.occasions.fusion, 25_000);
    assert_eq!(recorder.recent(3).len(), 3);
}
