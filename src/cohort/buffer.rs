use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::record::OccasionRecord;

#[derive(Debug)]
struct Bucket {
    records: Vec<OccasionRecord>,
    opened_at: Instant,
}

impl Bucket {
    /// Distinct users behind the records. k is measured in these, not in records.
    fn contributors(&self) -> usize {
        contributors(&self.records)
    }
}

/// Number of distinct hashed users in `records`.
pub fn contributors(records: &[OccasionRecord]) -> usize {
    records.iter().map(|r| r.hashed_user_id()).collect::<HashSet<_>>().len()
}

/// Outcome of a drain attempt.
#[derive(Debug)]
pub enum Drain {
    /// Fewer than k distinct users buffered; nothing left the buffer.
    BelowThreshold(usize),
    /// Every record buffered at drain time, moved out in one step.
    Drained(DrainedBatch),
}

/// Records staged for aggregation. Handed back via `OccasionBuffer::restore`
/// if the resulting snapshot cannot be persisted.
#[derive(Debug)]
pub struct DrainedBatch {
    pub records: Vec<OccasionRecord>,
    opened_at: Instant,
}

impl DrainedBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contributors(&self) -> usize {
        contributors(&self.records)
    }
}

/// Concurrent accumulator of pending records, one bucket per key.
/// A drain swaps the bucket out under the lock, so a submit racing a drain
/// lands in a fresh bucket: never lost, never counted twice.
#[derive(Debug)]
pub struct OccasionBuffer<K> {
    buckets: Mutex<HashMap<K, Bucket>>,
}

impl<K: Eq + Hash + Clone> Default for OccasionBuffer<K> {
    fn default() -> Self {
        Self { buckets: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone> OccasionBuffer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends and returns the bucket's new size.
    pub async fn submit(&self, key: K, record: OccasionRecord) -> usize {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key).or_insert_with(|| Bucket {
            records: Vec::new(),
            opened_at: Instant::now(),
        });
        bucket.records.push(record);
        bucket.records.len()
    }

    pub async fn len(&self, key: &K) -> usize {
        self.buckets.lock().await.get(key).map(|b| b.records.len()).unwrap_or(0)
    }

    pub async fn contributors(&self, key: &K) -> usize {
        self.buckets.lock().await.get(key).map(|b| b.contributors()).unwrap_or(0)
    }

    /// Records pending across every bucket.
    pub async fn pending(&self) -> usize {
        self.buckets.lock().await.values().map(|b| b.records.len()).sum()
    }

    /// Takes the whole bucket if at least `k` distinct users contributed to it.
    /// One session repeating itself never fills a cohort.
    pub async fn drain_if_ready(&self, key: &K, k: usize) -> Drain {
        let mut buckets = self.buckets.lock().await;
        let users = buckets.get(key).map(|b| b.contributors()).unwrap_or(0);
        if users < k || users == 0 {
            return Drain::BelowThreshold(users);
        }
        match buckets.remove(key) {
            Some(bucket) => Drain::Drained(DrainedBatch {
                records: bucket.records,
                opened_at: bucket.opened_at,
            }),
            None => Drain::BelowThreshold(0),
        }
    }

    /// Puts a staged batch back in front of anything submitted since the drain.
    pub async fn restore(&self, key: K, batch: DrainedBatch) {
        let mut buckets = self.buckets.lock().await;
        match buckets.get_mut(&key) {
            Some(bucket) => {
                let newer = std::mem::replace(&mut bucket.records, batch.records);
                bucket.records.extend(newer);
                bucket.opened_at = bucket.opened_at.min(batch.opened_at);
            }
            None => {
                buckets.insert(
                    key,
                    Bucket {
                        records: batch.records,
                        opened_at: batch.opened_at,
                    },
                );
            }
        }
    }

    /// Keys whose bucket has reached `k` distinct users.
    pub async fn ready_keys(&self, k: usize) -> Vec<K> {
        self.buckets
            .lock()
            .await
            .iter()
            .filter(|(_, b)| b.contributors() >= k.max(1))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Discards under-threshold buckets opened longer than `retention` ago, uncounted.
    /// Buckets that reached `k` are kept for aggregation. Returns the number of records dropped.
    pub async fn expire(&self, retention: Duration, k: usize) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let mut dropped = 0;
        buckets.retain(|_, bucket| {
            let keep = bucket.contributors() >= k || now.duration_since(bucket.opened_at) < retention;
            if !keep {
                dropped += bucket.records.len();
            }
            keep
        });
        dropped
    }
}
