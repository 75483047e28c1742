use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use cohort_engine::cohort::{MetricKind, Track};
use cohort_engine::error::OccasionError;
use cohort_engine::privacy::Pseudonymizer;
use cohort_engine::selector::{Activations, EmissionStrategy};
use cohort_engine::{Engine, EngineConfig, Occasion};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.selector.channels = ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect();
    config.store.dir = dir.join("state");
    config.store.max_retries = 1;
    config.store.backoff_ms = 1;
    config
}

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
}

// Helper: a fusion-band occasion inside the noon cohort
fn occasion(user: &str, outcome: f64) -> Occasion {
    Occasion::new(user, Activations::new([("A", 0.6), ("B", 0.55)]), outcome).at(noon() + ChronoDuration::minutes(7))
}

#[tokio::test]
async fn test_snapshot_appears_only_at_k() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();

    // 1. Nine occasions: nothing published
    for i in 0..9 {
        engine.record_occasion(occasion(&format!("user-{}", i), 0.8)).await.unwrap();
    }
    engine.flush().await;
    assert!(engine.get_current_snapshot().await.is_none(), "No snapshot below k");
    assert_eq!(engine.pending_records().await, 9);

    // 2. The tenth crosses k
    engine.record_occasion(occasion("user-9", 0.8)).await.unwrap();
    engine.flush().await;

    let snapshot = engine.get_current_snapshot().await.expect("snapshot at k");
    assert_eq!(snapshot.cohort_size, 10);
    assert!(snapshot.privacy_noise_scale > 0.0);
    assert_eq!(snapshot.track, Track::Cohort);
    assert_eq!(snapshot.window, Some(noon()));
    assert_eq!(snapshot.contributors, 10);
    assert_eq!(snapshot.provenance.k_threshold, 10);
    assert_eq!(snapshot.provenance.per_record_epsilon, 2.0 * snapshot.provenance.epsilon, "Cohort and family both spend on each record");
    assert_eq!(snapshot.metrics.len(), MetricKind::ALL.len());
    assert_eq!(engine.pending_records().await, 0, "Drained records leave the buffer");
    assert_eq!(engine.get_history(10).await.len(), 1);

    let stats = engine.stats().await;
    assert_eq!(stats.occasions.accepted, 10);
    assert_eq!(stats.cohort.published, 1);
    assert_eq!(stats.cohort.records_drained, 10);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_one_user_alone_never_publishes() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();

    // 1. Ten occasions from one user: one contributor, below k
    for turn in 0..10 {
        engine.record_occasion(occasion("alice", turn as f64 / 10.0)).await.unwrap();
    }
    engine.flush().await;

    assert!(engine.get_current_snapshot().await.is_none(), "One user is not a cohort");
    assert!(engine.get_families().await.is_empty(), "Nor a family");
    assert_eq!(engine.pending_records().await, 10);
    assert_eq!(engine.stats().await.cohort.published, 0);

    // 2. Nine more people: the cohort publishes, alice counted once
    for i in 0..9 {
        engine.record_occasion(occasion(&format!("user-{}", i), 0.5)).await.unwrap();
    }
    engine.flush().await;

    let snapshot = engine.get_current_snapshot().await.expect("snapshot at k users");
    assert_eq!(snapshot.contributors, 10);
    assert_eq!(snapshot.cohort_size, 19);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cohorts_are_independent_windows() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();

    for i in 0..5 {
        engine.record_occasion(occasion(&format!("a{}", i), 0.5)).await.unwrap();
        let later = occasion(&format!("b{}", i), 0.5).at(noon() + ChronoDuration::hours(1));
        engine.record_occasion(later).await.unwrap();
    }
    engine.flush().await;

    assert!(engine.get_current_snapshot().await.is_none(), "Two cohorts of five never add up to one of ten");
    assert_eq!(engine.pending_records().await, 10);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_tags_reach_the_distribution() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();

    for i in 0..10 {
        engine
            .record_occasion(occasion(&format!("user-{}", i), 0.5).with_tag("locale", "en"))
            .await
            .unwrap();
    }
    engine.flush().await;

    let snapshot = engine.get_current_snapshot().await.unwrap();
    let locale = &snapshot.distributions["locale"];
    assert_eq!(locale.len(), 1);
    assert!((locale["en"] - 1.0).abs() < 1e-9);
    let strategy: f64 = snapshot.distributions["strategy"].values().sum();
    assert!((strategy - 1.0).abs() < 1e-9);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_bad_occasions_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();

    let free_text = occasion("u", 0.5).with_tag("note", "I told the assistant my address");
    assert_eq!(engine.record_occasion(free_text).await.unwrap_err(), OccasionError::MalformedTag);

    let reserved = occasion("u", 0.5).with_tag("strategy", "direct");
    assert_eq!(engine.record_occasion(reserved).await.unwrap_err(), OccasionError::MalformedTag);

    let unknown = Occasion::new("u", Activations::new([("Z", 0.5)]), 0.5);
    assert!(matches!(engine.record_occasion(unknown).await, Err(OccasionError::UnknownChannel(_))));

    assert_eq!(engine.pending_records().await, 0);
    let stats = engine.stats().await;
    assert_eq!(stats.occasions.skipped, 3);
    assert_eq!(stats.occasions.accepted, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_zero_activation_occasion_still_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();

    let silent = Occasion::new("u", Activations::new([("A", 0.0), ("B", 0.0)]), 0.3).at(noon());
    let selection = engine.record_occasion(silent).await.unwrap();

    assert_eq!(selection.strategy, EmissionStrategy::Fallback);
    assert_eq!(selection.nexus_quality, 0.0);
    assert_eq!(engine.pending_records().await, 1, "Fallback occasions are aggregated too");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_family_template_enables_fusion() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.privacy.k_min = 100;
    let engine = Engine::start(config).await.unwrap();

    // Outcome 0 keeps the coupling matrix (and so the readiness) fixed.
    for i in 0..5 {
        let selection = engine.record_occasion(occasion(&format!("user-{}", i), 0.0)).await.unwrap();
        assert_eq!(selection.strategy, EmissionStrategy::Fallback, "No template yet");
    }
    engine.flush().await;

    let families = engine.get_families().await;
    assert_eq!(families.len(), 1);
    let family = families.values().next().unwrap();
    assert_eq!(family.generations, 1);
    assert_eq!(family.latest.cohort_size, 5);
    assert!(engine.get_current_snapshot().await.is_none(), "Family publication is not a cohort snapshot");

    let selection = engine.record_occasion(occasion("user-5", 0.0)).await.unwrap();
    assert_eq!(selection.strategy, EmissionStrategy::Fusion);
    assert_eq!(selection.family.as_ref(), Some(&family.cluster_id));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_coalition_query_is_read_only() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Engine::start(config(tmp.path())).await.unwrap();
    let before = engine.coupling_matrix().await;

    let signals = Activations::new([("A", 0.9), ("B", 0.85), ("C", 0.0)]);
    for _ in 0..20 {
        let coalitions = engine.get_coalitions_for_occasion(&signals).await.unwrap();
        assert_eq!(coalitions.len(), 1);
        assert_eq!(coalitions[0].channel_names(), vec!["A", "B"]);
    }

    assert_eq!(engine.coupling_matrix().await, before);
    assert_eq!(engine.pending_records().await, 0);
    assert_eq!(engine.stats().await.occasions.accepted, 0);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_never_lose_or_double_count() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::start(config(tmp.path())).await.unwrap());
    let sessions = 20;
    let turns = 10;

    let mut handles = Vec::new();
    for session in 0..sessions {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for turn in 0..turns {
                let o = occasion(&format!("session-{}", session), (turn as f64) / 10.0);
                engine.record_occasion(o).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    engine.flush().await;

    let history = engine.get_history(usize::MAX).await;
    let published: usize = history.iter().map(|s| s.cohort_size).sum();
    assert_eq!(published + engine.pending_records().await, sessions * turns);
    assert!(!history.is_empty(), "Flush publishes every ready cohort");
    assert!(history.iter().all(|s| s.contributors >= 10));
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let m = engine.coupling_matrix().await;
    assert!(m.is_symmetric());
    assert!(m.coupling("A", "B") > 0.0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_persist_restores_records() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let mut config = config(tmp.path());
    config.store.dir = blocker.join("state");
    let engine = Engine::start(config).await.unwrap();

    // 1. Store unwritable: nothing published, nothing lost
    for i in 0..10 {
        engine.record_occasion(occasion(&format!("user-{}", i), 0.5)).await.unwrap();
    }
    engine.flush().await;

    assert!(engine.get_current_snapshot().await.is_none());
    assert_eq!(engine.pending_records().await, 10);
    let stats = engine.stats().await;
    assert!(stats.cohort.persist_failures >= 1);
    assert!(stats.cohort.records_restored >= 10);
    assert_eq!(stats.cohort.published, 0);

    // 2. Store recovers: the same ten records are published once
    std::fs::remove_file(&blocker).unwrap();
    engine.flush().await;

    let snapshot = engine.get_current_snapshot().await.expect("published after recovery");
    assert_eq!(snapshot.cohort_size, 10);
    assert_eq!(engine.pending_records().await, 0);
    assert_eq!(engine.get_history(100).await.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_state() {
    let tmp = tempfile::tempdir().unwrap();

    // 1. First run: publish and learn
    let engine = Engine::start(config(tmp.path())).await.unwrap();
    for i in 0..10 {
        engine.record_occasion(occasion(&format!("user-{}", i), 1.0)).await.unwrap();
    }
    engine.flush().await;
    let first = engine.get_current_snapshot().await.unwrap();
    let learned = engine.coupling_matrix().await;
    assert!(learned.coupling("A", "B") > 0.0);
    engine.shutdown().await;
    drop(engine);

    // 2. Second run: same history, same matrix, clock continues
    let engine = Engine::start(config(tmp.path())).await.unwrap();
    let recovered = engine.get_current_snapshot().await.expect("current survives restart");
    assert_eq!(recovered.id, first.id);
    assert_eq!(recovered.sequence, first.sequence);
    assert_eq!(recovered.cohort_size, 10);
    assert_eq!(engine.get_history(10).await.len(), 1);
    let reloaded = engine.coupling_matrix().await;
    assert!((reloaded.coupling("A", "B") - learned.coupling("A", "B")).abs() < 1e-12);
    assert!(!engine.get_families().await.is_empty());

    for i in 10..20 {
        engine.record_occasion(occasion(&format!("user-{}", i), 1.0)).await.unwrap();
    }
    engine.flush().await;
    let second = engine.get_current_snapshot().await.unwrap();
    assert!(second.sequence > first.sequence);
    assert_eq!(engine.get_history(10).await.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_sequence_keeps_advancing_after_lost_history() {
    let tmp = tempfile::tempdir().unwrap();
    let state_dir = config(tmp.path()).store.dir;

    // 1. First run publishes
    let engine = Engine::start(config(tmp.path())).await.unwrap();
    for i in 0..10 {
        engine.record_occasion(occasion(&format!("user-{}", i), 0.5)).await.unwrap();
    }
    engine.flush().await;
    let first = engine.get_current_snapshot().await.unwrap();
    engine.shutdown().await;
    drop(engine);

    // 2. History and families are lost; only current survives
    std::fs::write(state_dir.join("history.json"), b"{ truncated").unwrap();
    std::fs::write(state_dir.join("families.json"), b"").unwrap();

    let engine = Engine::start(config(tmp.path())).await.unwrap();
    assert!(engine.get_history(10).await.is_empty());
    assert_eq!(engine.get_current_snapshot().await.unwrap().sequence, first.sequence);

    // 3. The next cohort is newer than the surviving current and replaces it
    for i in 10..20 {
        engine.record_occasion(occasion(&format!("user-{}", i), 0.5)).await.unwrap();
    }
    engine.flush().await;

    let second = engine.get_current_snapshot().await.unwrap();
    assert!(second.sequence > first.sequence, "clock ran back: {} after {}", second.sequence, first.sequence);
    assert_ne!(second.id, first.id);
    assert_eq!(engine.get_history(10).await.len(), 1);
    assert!(state_dir.join("history.json.corrupt").exists());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_no_identifier_reaches_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let digest = Pseudonymizer::new(config.privacy.salt.clone()).hash_identifier("alice-secret-id");
    let state_dir = config.store.dir.clone();

    let engine = Engine::start(config).await.unwrap();
    engine.record_occasion(occasion("alice-secret-id", 0.9)).await.unwrap();
    for i in 0..9 {
        engine.record_occasion(occasion(&format!("alice-friend-{}", i), 0.9)).await.unwrap();
    }
    engine.flush().await;
    assert!(engine.get_current_snapshot().await.is_some());
    engine.shutdown().await;

    let mut files = 0;
    for entry in std::fs::read_dir(&state_dir).unwrap() {
        let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        assert!(!content.contains("alice-secret"));
        assert!(!content.contains(digest.as_str()));
        files += 1;
    }
    assert!(files >= 3, "current, history and families were written");
}

#[tokio::test(start_paused = true)]
async fn test_stale_cohorts_expire_uncounted() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.privacy.retention_secs = 60;
    config.worker.sweep_secs = 10;
    config.store.matrix_persist_secs = 100_000;
    let engine = Engine::start(config).await.unwrap();

    for i in 0..3 {
        engine.record_occasion(occasion(&format!("user-{}", i), 0.0)).await.unwrap();
    }
    assert_eq!(engine.pending_records().await, 3);

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(engine.pending_records().await, 0);
    let stats = engine.stats().await;
    assert_eq!(stats.cohort.records_expired, 3);
    assert_eq!(stats.family.records_expired, 3);
    assert!(engine.get_current_snapshot().await.is_none());
}
