use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EngineCore;
use crate::cohort::{aggregate, CohortKey, Drain, Provenance, Track};
use crate::privacy::ClusterId;
use crate::store::save_matrix;
use crate::telemetry::{EngineEvent, TrackKind};

#[derive(Debug)]
pub(crate) enum WorkerMsg {
    Aggregate(CohortKey),
    AggregateFamily(ClusterId),
    Flush(oneshot::Sender<()>),
}

/// Single aggregation task: serializes drains, snapshot writes and matrix persistence.
pub(crate) struct AggregationWorker {
    core: Arc<EngineCore>,
    rx: mpsc::Receiver<WorkerMsg>,
    cancel: CancellationToken,
    rng: StdRng,
}

impl AggregationWorker {
    pub(crate) fn new(core: Arc<EngineCore>, rx: mpsc::Receiver<WorkerMsg>, cancel: CancellationToken) -> Self {
        Self {
            core,
            rx,
            cancel,
            rng: StdRng::from_entropy(),
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Aggregation worker started");

        let mut sweep = interval(Duration::from_secs(self.core.config.worker.sweep_secs.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        sweep.tick().await;

        let mut matrix_cadence = interval(Duration::from_secs(self.core.config.store.matrix_persist_secs.max(1)));
        matrix_cadence.set_missed_tick_behavior(MissedTickBehavior::Skip);
        matrix_cadence.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(WorkerMsg::Aggregate(key)) => self.try_aggregate(key).await,
                    Some(WorkerMsg::AggregateFamily(cluster)) => self.try_aggregate_family(cluster).await,
                    Some(WorkerMsg::Flush(done)) => {
                        self.aggregate_ready().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
                _ = matrix_cadence.tick() => self.persist_matrix().await,
            }
        }

        self.persist_matrix().await;
        info!("Aggregation worker stopped");
    }

    /// Drains the cohort once k_min distinct users are in it and publishes one snapshot for the whole drain.
    pub(crate) async fn try_aggregate(&mut self, key: CohortKey) {
        let core = &self.core;
        let k_min = core.config.privacy.k_min;

        let batch = match core.cohorts.drain_if_ready(&key, k_min).await {
            Drain::BelowThreshold(n) => {
                debug!("cohort {} has {} of {} contributors, nothing aggregated", key, n, k_min);
                core.record(EngineEvent::BelowThreshold { track: TrackKind::Cohort }).await;
                return;
            }
            Drain::Drained(batch) => batch,
        };
        core.record(EngineEvent::Drained { track: TrackKind::Cohort, records: batch.len() }).await;

        let Some(stats) = aggregate(&batch.records, &core.mechanism, &mut self.rng) else {
            return;
        };
        let snapshot = stats.into_snapshot(
            core.next_sequence(),
            Track::Cohort,
            Some(key.window),
            Provenance::laplace(core.mechanism.epsilon(), k_min),
        );
        let sequence = snapshot.sequence;

        match core.store.write_snapshot(snapshot).await {
            Ok(retries) => {
                info!("published cohort snapshot #{} ({} records, window {})", sequence, batch.len(), key);
                core.record(EngineEvent::Published { track: TrackKind::Cohort, retries }).await;
            }
            Err(e) => {
                let records = batch.len();
                error!("cohort snapshot #{} not persisted, {} records restored: {}", sequence, records, e);
                core.cohorts.restore(key, batch).await;
                core.record(EngineEvent::PersistFailed { track: TrackKind::Cohort }).await;
                core.record(EngineEvent::Restored { track: TrackKind::Cohort, records }).await;
            }
        }
    }

    /// Family track: same discipline, own k, own collection. A published family becomes a fusion template.
    pub(crate) async fn try_aggregate_family(&mut self, cluster: ClusterId) {
        let core = &self.core;
        let k_family = core.config.privacy.k_family;

        let batch = match core.families.drain_if_ready(&cluster, k_family).await {
            Drain::BelowThreshold(_) => {
                core.record(EngineEvent::BelowThreshold { track: TrackKind::Family }).await;
                return;
            }
            Drain::Drained(batch) => batch,
        };
        core.record(EngineEvent::Drained { track: TrackKind::Family, records: batch.len() }).await;

        let Some(stats) = aggregate(&batch.records, &core.mechanism, &mut self.rng) else {
            return;
        };
        let snapshot = stats.into_snapshot(
            core.next_sequence(),
            Track::Family(cluster.clone()),
            None,
            Provenance::laplace(core.mechanism.epsilon(), k_family),
        );

        match core.store.write_family(snapshot).await {
            Ok(retries) => {
                if core.selector.register_template(cluster).await {
                    info!("new family template registered ({} total)", core.selector.template_count().await);
                }
                core.record(EngineEvent::Published { track: TrackKind::Family, retries }).await;
            }
            Err(e) => {
                let records = batch.len();
                error!("family snapshot not persisted, {} records restored: {}", records, e);
                core.families.restore(cluster, batch).await;
                core.record(EngineEvent::PersistFailed { track: TrackKind::Family }).await;
                core.record(EngineEvent::Restored { track: TrackKind::Family, records }).await;
            }
        }
    }

    /// Picks up buckets that reached k without a queued request (saturated queue, restored batches).
    async fn aggregate_ready(&mut self) {
        let cohorts = self.core.cohorts.ready_keys(self.core.config.privacy.k_min).await;
        for key in cohorts {
            self.try_aggregate(key).await;
        }
        let families = self.core.families.ready_keys(self.core.config.privacy.k_family).await;
        for cluster in families {
            self.try_aggregate_family(cluster).await;
        }
    }

    async fn sweep(&mut self) {
        let core = &self.core;
        let retention = core.config.privacy.retention();

        let expired = core.cohorts.expire(retention, core.config.privacy.k_min).await;
        if expired > 0 {
            info!("{} under-threshold cohort records aged out uncounted", expired);
            core.record(EngineEvent::Expired { track: TrackKind::Cohort, records: expired }).await;
        }
        let expired = core.families.expire(retention, core.config.privacy.k_family).await;
        if expired > 0 {
            info!("{} under-threshold family records aged out uncounted", expired);
            core.record(EngineEvent::Expired { track: TrackKind::Family, records: expired }).await;
        }

        let pruned = core.selector.prune_deferrals(core.config.selector.deferral_ttl()).await;
        if pruned > 0 {
            debug!("{} stale deferrals pruned", pruned);
        }

        self.aggregate_ready().await;
    }

    async fn persist_matrix(&self) {
        let core = &self.core;
        if !core.selector.take_matrix_dirty() {
            return;
        }
        let matrix = core.selector.matrix().await;
        match save_matrix(&core.store.layout().matrix, &matrix, core.store.policy()).await {
            Ok(_) => core.record(EngineEvent::MatrixPersisted).await,
            Err(e) => {
                warn!("coupling matrix not persisted, will retry next cycle: {}", e);
                core.selector.mark_matrix_dirty();
            }
        }
    }
}
