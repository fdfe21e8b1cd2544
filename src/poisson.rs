use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::time::Duration;

/// Poisson process driving when a processor issues its next request.
pub struct Poisson<R: Rng + ?Sized> {
    pub rng: Box<R>,
    pub rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rng: Box::new(SmallRng::seed_from_u64(seed)),
            rate,
        }
    }
}

impl<R: Rng + ?Sized> Poisson<R> {
    /// Seconds until the next event.
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    /// Next inter-request gap, never longer than `bound`.
    pub fn next_interval(&mut self, bound: Duration) -> Duration {
        let secs = self.time_for_next_event();
        if !secs.is_finite() || secs < 0.0 {
            return bound;
        }
        Duration::from_secs_f64(secs).min(bound)
    }
}
