use rand::Rng;
use rand_distr::{Distribution, Exp};

/// Laplace scale for a query of the given sensitivity under budget `epsilon`.
pub fn noise_scale(sensitivity: f64, epsilon: f64) -> f64 {
    sensitivity / epsilon
}

/// One draw from Laplace(0, scale), built as the difference of two
/// exponentials with rate `1 / scale`. A non-positive scale adds nothing.
pub fn laplace_noise<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    if !(scale.is_finite() && scale > 0.0) {
        return 0.0;
    }
    match Exp::new(1.0 / scale) {
        Ok(exp) => exp.sample(rng) - exp.sample(rng),
        Err(_) => 0.0,
    }
}

/// Laplace mechanism bound to one privacy budget.
#[derive(Debug, Clone, Copy)]
pub struct LaplaceMechanism {
    epsilon: f64,
}

impl LaplaceMechanism {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn scale(&self, sensitivity: f64) -> f64 {
        noise_scale(sensitivity, self.epsilon)
    }

    /// Returns the noisy value and the scale that was applied.
    pub fn perturb<R: Rng + ?Sized>(&self, rng: &mut R, value: f64, sensitivity: f64) -> (f64, f64) {
        let scale = self.scale(sensitivity);
        (value + laplace_noise(rng, scale), scale)
    }
}
