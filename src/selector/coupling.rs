use serde::{Deserialize, Serialize};

/// Symmetric NxN coupling between channels, values in [0, 1].
/// `reinforce` is the only mutation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingMatrix {
    channels: Vec<String>,
    /// Row-major, `channels.len()²` entries.
    weights: Vec<f64>,
}

impl CouplingMatrix {
    pub fn identity(channels: &[String]) -> Self {
        let n = channels.len();
        let mut weights = vec![0.0; n * n];
        for i in 0..n {
            weights[i * n + i] = 1.0;
        }
        Self { channels: channels.to_vec(), weights }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn dim(&self) -> usize {
        self.channels.len()
    }

    pub fn index_of(&self, channel: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == channel)
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        let n = self.dim();
        if i >= n || j >= n {
            return 0.0;
        }
        self.weights[i * n + j]
    }

    pub fn coupling(&self, a: &str, b: &str) -> f64 {
        match (self.index_of(a), self.index_of(b)) {
            (Some(i), Some(j)) => self.get(i, j),
            _ => 0.0,
        }
    }

    /// Mean off-diagonal coupling over every pair of `members`.
    pub fn mean_coupling(&self, members: &[usize]) -> f64 {
        let mut total = 0.0;
        let mut pairs = 0usize;
        for (a, &i) in members.iter().enumerate() {
            for &j in &members[a + 1..] {
                total += self.get(i, j);
                pairs += 1;
            }
        }
        if pairs == 0 {
            0.0
        } else {
            total / pairs as f64
        }
    }

    /// Hebbian update for one co-activated group:
    /// `M[i][j] += eta · s_i · s_j · outcome · (1 − M[i][j])`, mirrored to `M[j][i]`.
    pub fn reinforce(&mut self, members: &[(usize, f64)], outcome_quality: f64, eta: f64) {
        let n = self.dim();
        let outcome = outcome_quality.clamp(0.0, 1.0);
        for (a, &(i, s_i)) in members.iter().enumerate() {
            for &(j, s_j) in &members[a + 1..] {
                if i == j || i >= n || j >= n {
                    continue;
                }
                let current = self.weights[i * n + j];
                let next = (current + eta * s_i * s_j * outcome * (1.0 - current)).clamp(0.0, 1.0);
                self.weights[i * n + j] = next;
                self.weights[j * n + i] = next;
            }
        }
    }

    pub fn is_symmetric(&self) -> bool {
        let n = self.dim();
        (0..n).all(|i| (0..i).all(|j| self.weights[i * n + j] == self.weights[j * n + i]))
    }

    /// Checks a deserialized matrix before it is trusted.
    pub fn check_against(&self, channels: &[String]) -> Result<(), String> {
        if self.channels != channels {
            return Err("channel list differs from configuration".into());
        }
        if self.weights.len() != self.dim() * self.dim() {
            return Err(format!("expected {} weights, found {}", self.dim() * self.dim(), self.weights.len()));
        }
        if self.weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err("weight outside [0, 1]".into());
        }
        if !self.is_symmetric() {
            return Err("matrix is not symmetric".into());
        }
        Ok(())
    }
}
