use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Below this the intersection gate admits near-silent channels and the
/// coalition count explodes.
pub const MIN_INTERSECTION_THRESHOLD: f64 = 0.01;

/// Single source of truth for every tunable in the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub privacy: PrivacyConfig,
    pub selector: SelectorConfig,
    pub store: StoreConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Minimum cohort size before a snapshot may leave the buffer.
    pub k_min: usize,
    /// Minimum size of a pseudonymized family (sub-population) snapshot.
    pub k_family: usize,
    /// Differential-privacy budget per reported aggregate.
    pub epsilon: f64,
    /// Deployment pepper mixed into every identifier digest.
    pub salt: String,
    /// Under-threshold buckets older than this are discarded uncounted.
    pub retention_secs: u64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            k_min: 10,
            k_family: 5,
            epsilon: 10.0,
            salt: "cohort-engine".to_string(),
            retention_secs: 6 * 60 * 60,
        }
    }
}

impl PrivacyConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Weights of the emission readiness score. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadinessWeights {
    pub coherence: f64,
    pub intersection: f64,
    pub field: f64,
}

impl Default for ReadinessWeights {
    fn default() -> Self {
        Self { coherence: 0.25, intersection: 0.25, field: 0.5 }
    }
}

impl ReadinessWeights {
    pub fn sum(&self) -> f64 {
        self.coherence + self.intersection + self.field
    }
}

/// Gate thresholds and learning parameters for the emission strategy selector.
/// The selector, the nexus-quality computation and the strategy gate all read this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Ordered organ names; fixes the coupling matrix dimension.
    pub channels: Vec<String>,
    /// Channels every activation map must mention (strength may be zero).
    pub required_channels: Vec<String>,
    pub intersection_threshold: f64,
    pub coherence_threshold: f64,
    pub direct_threshold: f64,
    pub fusion_threshold: f64,
    pub window_min: f64,
    pub window_max: f64,
    pub max_deferrals: u32,
    /// Deferrals idle for longer than this are forgotten.
    pub deferral_ttl_secs: u64,
    /// Share of coherence taken from learned coupling rather than activation balance.
    pub coupling_influence: f64,
    pub readiness_weights: ReadinessWeights,
    /// Hebbian learning rate (eta).
    pub learning_rate: f64,
    pub max_coalitions: usize,
}

impl SelectorConfig {
    pub fn deferral_ttl(&self) -> Duration {
        Duration::from_secs(self.deferral_ttl_secs)
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            channels: ["affect", "memory", "language", "attention", "rhythm", "curiosity"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_channels: Vec::new(),
            intersection_threshold: 0.02,
            coherence_threshold: 0.4,
            direct_threshold: 0.50,
            fusion_threshold: 0.45,
            window_min: 0.2,
            window_max: 1.0,
            max_deferrals: 3,
            deferral_ttl_secs: 60 * 60,
            coupling_influence: 0.5,
            readiness_weights: ReadinessWeights::default(),
            learning_rate: 0.02,
            max_coalitions: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub io_timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub matrix_persist_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cohort_state"),
            io_timeout_ms: 2000,
            max_retries: 3,
            backoff_ms: 50,
            matrix_persist_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based): `backoff · 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub sweep_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024, sweep_secs: 60 }
    }
}

impl EngineConfig {
    /// Reads a JSON config. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default().validate();
        }
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()
    }

    /// Normalizes what can be normalized, rejects what cannot.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let p = &self.privacy;
        if p.k_min == 0 || p.k_family == 0 {
            return Err(ConfigError::Invalid("k thresholds must be at least 1".into()));
        }
        if !(p.epsilon.is_finite() && p.epsilon > 0.0) {
            return Err(ConfigError::Invalid(format!("epsilon must be finite and > 0, got {}", p.epsilon)));
        }

        let s = &mut self.selector;
        if s.channels.is_empty() {
            return Err(ConfigError::Invalid("at least one channel is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = s.channels.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(ConfigError::Invalid(format!("duplicate channel `{}`", dup)));
        }
        if let Some(missing) = s.required_channels.iter().find(|c| !s.channels.contains(*c)) {
            return Err(ConfigError::Invalid(format!("required channel `{}` is not a configured channel", missing)));
        }
        if s.intersection_threshold < MIN_INTERSECTION_THRESHOLD {
            warn!(
                "intersection_threshold {} below floor, raised to {}",
                s.intersection_threshold, MIN_INTERSECTION_THRESHOLD
            );
            s.intersection_threshold = MIN_INTERSECTION_THRESHOLD;
        }
        if s.fusion_threshold > s.direct_threshold {
            return Err(ConfigError::Invalid(format!(
                "fusion_threshold {} exceeds direct_threshold {}",
                s.fusion_threshold, s.direct_threshold
            )));
        }
        if s.window_min > s.window_max {
            return Err(ConfigError::Invalid("readiness window is empty".into()));
        }
        if !(0.0..=1.0).contains(&s.coupling_influence) || !(0.0..=1.0).contains(&s.learning_rate) {
            return Err(ConfigError::Invalid("coupling_influence and learning_rate must lie in [0, 1]".into()));
        }

        let w = s.readiness_weights;
        if w.coherence < 0.0 || w.intersection < 0.0 || w.field < 0.0 || w.sum() <= 0.0 {
            return Err(ConfigError::Invalid("readiness weights must be non-negative and not all zero".into()));
        }
        if (w.sum() - 1.0).abs() > 1e-9 {
            warn!("readiness weights sum to {}, renormalizing", w.sum());
            let total = w.sum();
            s.readiness_weights = ReadinessWeights {
                coherence: w.coherence / total,
                intersection: w.intersection / total,
                field: w.field / total,
            };
        }

        if self.worker.queue_capacity == 0 {
            return Err(ConfigError::Invalid("worker queue capacity must be positive".into()));
        }
        Ok(self)
    }
}
