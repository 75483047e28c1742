use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::atomic::{persist_with_retry, read_json_tolerant, Recovered};
use crate::cohort::{AnonymizedSnapshot, Track};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::privacy::ClusterId;

/// Latest published snapshot of one pseudonymized family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub cluster_id: ClusterId,
    /// Number of snapshots published for this family so far.
    pub generations: u64,
    pub latest: AnonymizedSnapshot,
}

/// File names inside the store directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub current: PathBuf,
    pub history: PathBuf,
    pub families: PathBuf,
    pub matrix: PathBuf,
}

impl StoreLayout {
    pub fn new(dir: &std::path::Path) -> Self {
        Self {
            current: dir.join("current.json"),
            history: dir.join("history.json"),
            families: dir.join("families.json"),
            matrix: dir.join("coupling.json"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    current: Option<AnonymizedSnapshot>,
    history: Vec<AnonymizedSnapshot>,
    families: BTreeMap<ClusterId, FamilyRecord>,
}

/// Durable current snapshot, append-only history and family collection.
/// In-memory state only advances after the disk write is confirmed, so reads
/// always serve the last known good state.
pub struct SnapshotStore {
    layout: StoreLayout,
    policy: StoreConfig,
    state: RwLock<StoreState>,
    write_gate: Mutex<()>,
    /// Set when a file could neither be read nor moved aside at open.
    held: HeldFiles,
}

#[derive(Debug, Clone, Copy, Default)]
struct HeldFiles {
    history: bool,
    families: bool,
}

impl SnapshotStore {
    /// Loads whatever is recoverable. Never fails: missing, corrupt or unreadable files
    /// become empty state. A file that cannot be moved aside is held and never overwritten.
    pub async fn open(policy: &StoreConfig) -> Self {
        let layout = StoreLayout::new(&policy.dir);
        let mut held = HeldFiles::default();

        let history: Recovered<Vec<AnonymizedSnapshot>> = read_json_tolerant(&layout.history, "snapshot history").await;
        held.history = history.is_held();
        let mut history = history.value().unwrap_or_default();
        history.sort_by_key(|s| s.sequence);
        history.dedup_by_key(|s| s.sequence);

        let mut current: Option<AnonymizedSnapshot> = read_json_tolerant(&layout.current, "current snapshot").await.value();
        // A crash between the history and current renames leaves history ahead.
        if let Some(last) = history.last() {
            let behind = current.as_ref().map(|c| c.sequence < last.sequence).unwrap_or(true);
            if behind {
                warn!("current snapshot behind history, reconciling to sequence {}", last.sequence);
                current = Some(last.clone());
            }
        }

        let families: Recovered<BTreeMap<ClusterId, FamilyRecord>> = read_json_tolerant(&layout.families, "family records").await;
        held.families = families.is_held();
        let families = families.value().unwrap_or_default();

        info!(
            "snapshot store opened: {} history entries, {} families, current {}",
            history.len(),
            families.len(),
            current.as_ref().map(|c| c.sequence.to_string()).unwrap_or_else(|| "none".into())
        );

        Self {
            layout,
            policy: policy.clone(),
            state: RwLock::new(StoreState { current, history, families }),
            write_gate: Mutex::new(()),
            held,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn policy(&self) -> &StoreConfig {
        &self.policy
    }

    /// Persists the snapshot into history (ordered by sequence) and, unless an
    /// older snapshot arrives late, as the new current. Returns retries used.
    pub async fn write_snapshot(&self, snapshot: AnonymizedSnapshot) -> Result<u32, StoreError> {
        check_publishable(&snapshot)?;
        if snapshot.track != Track::Cohort {
            return Err(StoreError::Rejected("family snapshot written to cohort history".into()));
        }
        if self.held.history {
            return Err(StoreError::Held(self.layout.history.clone()));
        }

        let _gate = self.write_gate.lock().await;
        let (mut history, current) = {
            let state = self.state.read().await;
            (state.history.clone(), state.current.clone())
        };
        if history.iter().any(|s| s.sequence == snapshot.sequence) {
            return Err(StoreError::Rejected(format!("sequence {} already in history", snapshot.sequence)));
        }

        let at = history.partition_point(|s| s.sequence < snapshot.sequence);
        history.insert(at, snapshot.clone());

        // The history rename is the commit point; `open` reconciles current from it.
        let mut retries = persist_with_retry(&self.layout.history, &history, &self.policy).await?;

        let supersedes = current.as_ref().map(|c| c.sequence < snapshot.sequence).unwrap_or(true);
        let next_current = if supersedes {
            match persist_with_retry(&self.layout.current, &snapshot, &self.policy).await {
                Ok(r) => retries += r,
                Err(e) => warn!("history committed but current snapshot write failed, reconciled on next open: {}", e),
            }
            Some(snapshot)
        } else {
            current
        };

        let mut state = self.state.write().await;
        state.history = history;
        state.current = next_current;
        Ok(retries)
    }

    pub async fn read_current(&self) -> Option<AnonymizedSnapshot> {
        self.state.read().await.current.clone()
    }

    /// The most recent `limit` entries (all when `None`), oldest first.
    pub async fn read_history(&self, limit: Option<usize>) -> Vec<AnonymizedSnapshot> {
        let state = self.state.read().await;
        let skip = limit.map(|l| state.history.len().saturating_sub(l)).unwrap_or(0);
        state.history[skip..].to_vec()
    }

    pub async fn last_sequence(&self) -> u64 {
        let state = self.state.read().await;
        // Current can outlive a lost history; the clock must not run behind it.
        let current = state.current.as_ref().map(|s| s.sequence).unwrap_or(0);
        let history_max = state.history.last().map(|s| s.sequence).unwrap_or(0);
        let family_max = state.families.values().map(|f| f.latest.sequence).max().unwrap_or(0);
        current.max(history_max).max(family_max)
    }

    /// Replaces the family's latest snapshot. Same atomic write discipline as cohorts.
    pub async fn write_family(&self, snapshot: AnonymizedSnapshot) -> Result<u32, StoreError> {
        check_publishable(&snapshot)?;
        let cluster_id = match &snapshot.track {
            Track::Family(id) => id.clone(),
            Track::Cohort => return Err(StoreError::Rejected("cohort snapshot written as family".into())),
        };
        if self.held.families {
            return Err(StoreError::Held(self.layout.families.clone()));
        }

        let _gate = self.write_gate.lock().await;
        let mut families = self.state.read().await.families.clone();
        let generations = families.get(&cluster_id).map(|f| f.generations).unwrap_or(0) + 1;
        families.insert(
            cluster_id.clone(),
            FamilyRecord {
                cluster_id,
                generations,
                latest: snapshot,
            },
        );

        let retries = persist_with_retry(&self.layout.families, &families, &self.policy).await?;
        self.state.write().await.families = families;
        Ok(retries)
    }

    pub async fn read_families(&self) -> BTreeMap<ClusterId, FamilyRecord> {
        self.state.read().await.families.clone()
    }
}

fn check_publishable(snapshot: &AnonymizedSnapshot) -> Result<(), StoreError> {
    if !(snapshot.privacy_noise_scale > 0.0) {
        return Err(StoreError::Rejected("privacy noise scale must be positive".into()));
    }
    if snapshot.contributors < snapshot.provenance.k_threshold {
        return Err(StoreError::Rejected(format!(
            "{} contributors below k {}",
            snapshot.contributors, snapshot.provenance.k_threshold
        )));
    }
    Ok(())
}
