//! Engine facade: the upstream `record_occasion` contract and the downstream read surface.
//!
//! Producers (one per conversational session) call `record_occasion` concurrently.
//! It hashes the identifier, runs the selector, appends to the buffers and returns;
//! draining, aggregation and persistence happen on the single aggregation worker.

mod worker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cohort::{is_valid_tag, AnonymizedSnapshot, CohortKey, OccasionBuffer, OccasionRecord, STRATEGY_DIMENSION};
use crate::config::EngineConfig;
use crate::error::{ConfigError, OccasionError};
use crate::privacy::{ClusterId, LaplaceMechanism, Pseudonymizer};
use crate::selector::{Activations, Coalition, CouplingMatrix, EmissionSelector, Selection, TemplateRegistry};
use crate::store::{load_matrix, FamilyRecord, SnapshotStore};
use crate::telemetry::{EngineEvent, EngineStats, TelemetryRecorder};
use worker::{AggregationWorker, WorkerMsg};

/// One conversational turn as handed over by the session layer.
/// `user_id` is hashed on entry and dropped.
#[derive(Clone, Serialize, Deserialize)]
pub struct Occasion {
    pub user_id: String,
    #[serde(flatten)]
    pub signals: Activations,
    pub outcome_quality: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Defaults to arrival time.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

impl Occasion {
    pub fn new(user_id: impl Into<String>, signals: Activations, outcome_quality: f64) -> Self {
        Self {
            user_id: user_id.into(),
            signals,
            outcome_quality,
            tags: BTreeMap::new(),
            at: None,
        }
    }

    pub fn with_tag(mut self, dimension: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(dimension.into(), value.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }
}

// The raw identifier never reaches a log line.
impl fmt::Debug for Occasion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Occasion")
            .field("user_id", &"<redacted>")
            .field("signals", &self.signals)
            .field("outcome_quality", &self.outcome_quality)
            .field("tags", &self.tags.len())
            .finish()
    }
}

/// State shared between the producer-facing facade and the aggregation worker.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) pseudonymizer: Pseudonymizer,
    pub(crate) selector: EmissionSelector,
    pub(crate) cohorts: OccasionBuffer<CohortKey>,
    pub(crate) families: OccasionBuffer<ClusterId>,
    pub(crate) store: SnapshotStore,
    pub(crate) mechanism: LaplaceMechanism,
    telemetry: Mutex<TelemetryRecorder>,
    /// Logical timestamp of the last issued snapshot.
    clock: AtomicU64,
}

impl EngineCore {
    pub(crate) fn next_sequence(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn record(&self, event: EngineEvent) {
        self.telemetry.lock().await.record(event);
    }
}

pub struct Engine {
    core: Arc<EngineCore>,
    tx: mpsc::Sender<WorkerMsg>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Validates the config, recovers persisted state and spawns the aggregation worker.
    pub async fn start(config: EngineConfig) -> Result<Self, ConfigError> {
        let config = config.validate()?;

        let store = SnapshotStore::open(&config.store).await;
        let matrix = load_matrix(&store.layout().matrix, &config.selector.channels).await;
        let templates = TemplateRegistry::from_clusters(store.read_families().await.into_keys());
        let clock = AtomicU64::new(store.last_sequence().await);

        let pseudonymizer = Pseudonymizer::new(config.privacy.salt.clone());
        let selector = EmissionSelector::new(config.selector.clone(), pseudonymizer.clone(), matrix, templates);
        let mechanism = LaplaceMechanism::new(config.privacy.epsilon);

        let (tx, rx) = mpsc::channel(config.worker.queue_capacity);
        let cancel = CancellationToken::new();

        let core = Arc::new(EngineCore {
            config,
            pseudonymizer,
            selector,
            cohorts: OccasionBuffer::new(),
            families: OccasionBuffer::new(),
            store,
            mechanism,
            telemetry: Mutex::new(TelemetryRecorder::new()),
            clock,
        });

        let worker = AggregationWorker::new(core.clone(), rx, cancel.clone());
        let handle = tokio::spawn(worker.run());

        info!(
            "Cohort engine started (k_min {}, k_family {}, epsilon {})",
            core.config.privacy.k_min, core.config.privacy.k_family, core.config.privacy.epsilon
        );

        Ok(Self {
            core,
            tx,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Hashes the identifier, selects a strategy and buffers the record.
    /// Returns as soon as the record is buffered; aggregation runs on the worker.
    pub async fn record_occasion(&self, occasion: Occasion) -> Result<Selection, OccasionError> {
        let Occasion { user_id, signals, outcome_quality, tags, at } = occasion;
        let user = self.core.pseudonymizer.hash_identifier(&user_id);
        drop(user_id);

        let result = match validate_tags(&tags) {
            Ok(()) => self.core.selector.select(&user, &signals, outcome_quality).await,
            Err(e) => Err(e),
        };
        let selection = match result {
            Ok(selection) => selection,
            Err(e) => {
                warn!("occasion skipped: {}", e);
                self.core.record(EngineEvent::OccasionSkipped { reason: e.kind() }).await;
                return Err(e);
            }
        };

        let record = OccasionRecord::new(user, at.unwrap_or_else(Utc::now), selection.metrics.clone(), tags, selection.strategy);
        let key = record.cohort_key();

        // The one place a record feeds two snapshots: its family and its hour cohort.
        // Each snapshot spends epsilon on it; `Provenance::per_record_epsilon` reports the sum.
        if let Some(family) = &selection.family {
            self.core.families.submit(family.clone(), record.clone()).await;
            self.notify(WorkerMsg::AggregateFamily(family.clone())).await;
        }
        self.core.cohorts.submit(key, record).await;
        self.notify(WorkerMsg::Aggregate(key)).await;

        self.core
            .record(EngineEvent::OccasionAccepted {
                strategy: selection.strategy,
                deferred: selection.deferred,
            })
            .await;
        Ok(selection)
    }

    /// Never waits on the worker. A full queue is picked up by the next sweep or flush.
    async fn notify(&self, msg: WorkerMsg) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("aggregation queue full, deferring to sweep");
                self.core.record(EngineEvent::QueueSaturated).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("aggregation worker is not running; record stays buffered");
            }
        }
    }

    pub async fn get_current_snapshot(&self) -> Option<AnonymizedSnapshot> {
        self.core.store.read_current().await
    }

    /// The most recent `limit` snapshots, oldest first.
    pub async fn get_history(&self, limit: usize) -> Vec<AnonymizedSnapshot> {
        self.core.store.read_history(Some(limit)).await
    }

    /// Surviving coalitions for an occasion, against the current matrix. No learning, no buffering.
    pub async fn get_coalitions_for_occasion(&self, signals: &Activations) -> Result<Vec<Coalition>, OccasionError> {
        Ok(self.core.selector.evaluate(signals).await?.survivors)
    }

    pub async fn get_families(&self) -> BTreeMap<ClusterId, FamilyRecord> {
        self.core.store.read_families().await
    }

    pub async fn coupling_matrix(&self) -> CouplingMatrix {
        self.core.selector.matrix().await
    }

    pub async fn pending_records(&self) -> usize {
        self.core.cohorts.pending().await
    }

    pub async fn stats(&self) -> EngineStats {
        self.core.telemetry.lock().await.snapshot()
    }

    /// Waits until every aggregation request queued so far has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WorkerMsg::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Stops the worker; the coupling matrix is persisted on the way out.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("aggregation worker ended abnormally: {}", e);
            }
        }
        info!("Cohort engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn validate_tags(tags: &BTreeMap<String, String>) -> Result<(), OccasionError> {
    for (dimension, value) in tags {
        if dimension == STRATEGY_DIMENSION || !is_valid_tag(dimension) {
            return Err(OccasionError::MalformedTag);
        }
        if !is_valid_tag(value) {
            return Err(OccasionError::MalformedTag);
        }
    }
    Ok(())
}
