use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::activation::{Activations, ValidatedActivations};
use super::coalition::{coherence_gate, intersection_gate, nexus_quality, score, window_gate, Coalition};
use super::coupling::CouplingMatrix;
use super::strategy::{strategy_gate, EmissionStrategy, TemplateRegistry};
use crate::cohort::{MetricKind, MetricVector};
use crate::config::SelectorConfig;
use crate::error::OccasionError;
use crate::privacy::{ClusterId, Pseudonymizer, UserDigest};

/// Gates 1-3 applied to one occasion.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Coalitions inside the readiness window.
    pub survivors: Vec<Coalition>,
    /// Coherent coalitions outside the window.
    pub deferred: Vec<Coalition>,
}

/// Result of running one occasion through all four gates.
#[derive(Debug, Clone)]
pub struct Selection {
    pub strategy: EmissionStrategy,
    pub nexus_quality: f64,
    pub coalitions: Vec<Coalition>,
    pub deferred: usize,
    pub metrics: MetricVector,
    /// Family of the strongest surviving coalition.
    pub family: Option<ClusterId>,
}

/// Pure evaluation: no learning, no deferral bookkeeping.
pub fn evaluate(
    activations: &ValidatedActivations,
    matrix: &CouplingMatrix,
    config: &SelectorConfig,
    pseudonymizer: &Pseudonymizer,
) -> Evaluation {
    let candidates = intersection_gate(activations, config.intersection_threshold, config.max_coalitions);
    let scored = candidates.iter().map(|c| score(c, matrix, config, pseudonymizer)).collect();
    let coherent = coherence_gate(scored, config.coherence_threshold);
    let (survivors, deferred) = window_gate(coherent, config.window_min, config.window_max);
    Evaluation { survivors, deferred }
}

#[derive(Debug, Clone, Copy)]
struct Deferral {
    count: u32,
    at: Instant,
}

/// Per (user digest, anchor) deferral counts.
#[derive(Debug, Default)]
struct DeferralBook {
    by_user: HashMap<UserDigest, HashMap<String, Deferral>>,
}

/// Threshold-gated emission strategy selector with a learned coupling matrix.
pub struct EmissionSelector {
    config: SelectorConfig,
    pseudonymizer: Pseudonymizer,
    matrix: RwLock<CouplingMatrix>,
    deferrals: Mutex<DeferralBook>,
    templates: RwLock<TemplateRegistry>,
    matrix_dirty: AtomicBool,
}

impl EmissionSelector {
    pub fn new(config: SelectorConfig, pseudonymizer: Pseudonymizer, matrix: CouplingMatrix, templates: TemplateRegistry) -> Self {
        Self {
            config,
            pseudonymizer,
            matrix: RwLock::new(matrix),
            deferrals: Mutex::new(DeferralBook::default()),
            templates: RwLock::new(templates),
            matrix_dirty: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Coalitions for an occasion against the current matrix. Read-only.
    pub async fn evaluate(&self, raw: &Activations) -> Result<Evaluation, OccasionError> {
        let activations = ValidatedActivations::validate(raw, &self.config)?;
        let matrix = self.matrix.read().await;
        Ok(evaluate(&activations, &matrix, &self.config, &self.pseudonymizer))
    }

    /// Runs all four gates, records deferrals and applies the Hebbian update.
    pub async fn select(&self, user: &UserDigest, raw: &Activations, outcome_quality: f64) -> Result<Selection, OccasionError> {
        if !(0.0..=1.0).contains(&outcome_quality) {
            return Err(OccasionError::OutcomeOutOfRange(outcome_quality));
        }
        let activations = ValidatedActivations::validate(raw, &self.config)?;

        let coherent = {
            let matrix = self.matrix.read().await;
            let candidates = intersection_gate(&activations, self.config.intersection_threshold, self.config.max_coalitions);
            let scored = candidates.iter().map(|c| score(c, &matrix, &self.config, &self.pseudonymizer)).collect();
            coherence_gate(scored, self.config.coherence_threshold)
        };

        let (survivors, deferred) = self.apply_window(user, coherent).await;

        let quality = nexus_quality(&survivors);
        let template_match = self.templates.read().await.matches_any(&survivors);
        let strategy = strategy_gate(quality, template_match, &self.config);

        if !survivors.is_empty() {
            self.learn(&survivors, outcome_quality).await;
        }

        let metrics = self.metrics(&activations, &survivors, quality, outcome_quality);
        let family = survivors
            .iter()
            .fold(None::<&Coalition>, |best, c| match best {
                Some(b) if b.readiness >= c.readiness => Some(b),
                _ => Some(c),
            })
            .map(|c| c.cluster_id.clone());

        debug!(
            "selector: {} survivors, {} deferred, nexus_quality {:.3} -> {}",
            survivors.len(),
            deferred,
            quality,
            strategy.as_str()
        );

        Ok(Selection {
            strategy,
            nexus_quality: quality,
            coalitions: survivors,
            deferred,
            metrics,
            family,
        })
    }

    /// Gate 3 with deferral carry-over. Anchors that do not reappear lose their deferral.
    async fn apply_window(&self, user: &UserDigest, coherent: Vec<Coalition>) -> (Vec<Coalition>, usize) {
        let mut book = self.deferrals.lock().await;
        let previous = book.by_user.remove(user).unwrap_or_default();

        let carried: Vec<Coalition> = coherent
            .into_iter()
            .map(|mut c| {
                c.deferrals = previous.get(&c.anchor).map(|d| d.count).unwrap_or(0);
                c
            })
            .collect();

        let (survivors, outside) = window_gate(carried, self.config.window_min, self.config.window_max);

        let now = Instant::now();
        let mut still_deferred = HashMap::new();
        for c in outside {
            let count = c.deferrals + 1;
            if count >= self.config.max_deferrals {
                debug!("selector: coalition deferred {} times, discarded", count);
                continue;
            }
            still_deferred.insert(c.anchor, Deferral { count, at: now });
        }

        let deferred = still_deferred.len();
        if !still_deferred.is_empty() {
            book.by_user.insert(user.clone(), still_deferred);
        }
        (survivors, deferred)
    }

    /// Single writer: the whole read-modify-write happens under the write lock.
    async fn learn(&self, survivors: &[Coalition], outcome_quality: f64) {
        let mut matrix = self.matrix.write().await;
        for coalition in survivors {
            let members: Vec<(usize, f64)> = coalition
                .members
                .iter()
                .filter_map(|m| matrix.index_of(&m.channel).map(|i| (i, m.strength)))
                .collect();
            matrix.reinforce(&members, outcome_quality, self.config.learning_rate);
        }
        self.matrix_dirty.store(true, Ordering::Release);
    }

    fn metrics(&self, activations: &ValidatedActivations, survivors: &[Coalition], quality: f64, outcome_quality: f64) -> MetricVector {
        let threshold = self.config.intersection_threshold;
        let active: Vec<f64> = activations.strengths.iter().cloned().filter(|&s| s > threshold).collect();
        let field = if active.is_empty() { 0.0 } else { active.iter().sum::<f64>() / active.len() as f64 };
        let coherence = survivors.iter().map(|c| c.coherence).fold(0.0, f64::max);
        let active_ratio = active.len() as f64 / activations.strengths.len().max(1) as f64;

        let mut metrics = MetricVector::new();
        metrics.insert(MetricKind::NexusQuality, quality.clamp(0.0, 1.0));
        metrics.insert(MetricKind::Coherence, coherence.clamp(0.0, 1.0));
        metrics.insert(MetricKind::FieldStrength, field.clamp(0.0, 1.0));
        metrics.insert(MetricKind::OutcomeQuality, outcome_quality);
        metrics.insert(MetricKind::ActiveRatio, active_ratio);
        metrics
    }

    pub async fn register_template(&self, cluster: ClusterId) -> bool {
        self.templates.write().await.register(cluster)
    }

    pub async fn template_count(&self) -> usize {
        self.templates.read().await.len()
    }

    pub async fn matrix(&self) -> CouplingMatrix {
        self.matrix.read().await.clone()
    }

    /// Clears and returns the dirty flag set by learning.
    pub fn take_matrix_dirty(&self) -> bool {
        self.matrix_dirty.swap(false, Ordering::AcqRel)
    }

    pub fn mark_matrix_dirty(&self) {
        self.matrix_dirty.store(true, Ordering::Release);
    }

    /// Drops deferrals untouched for longer than `ttl`. Returns how many went.
    pub async fn prune_deferrals(&self, ttl: Duration) -> usize {
        let mut book = self.deferrals.lock().await;
        let now = Instant::now();
        let mut removed = 0;
        book.by_user.retain(|_, anchors| {
            let before = anchors.len();
            anchors.retain(|_, d| now.duration_since(d.at) <= ttl);
            removed += before - anchors.len();
            !anchors.is_empty()
        });
        removed
    }

    pub async fn pending_deferrals(&self) -> usize {
        self.deferrals.lock().await.by_user.values().map(|m| m.len()).sum()
    }
}
