use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Produces values jittered around a base by a bounded deviation, used to
/// spread out expiry times that would otherwise align.
pub struct Unstable {
    deviation: f64,
    rng: Mutex<SmallRng>,
}

impl Unstable {
    pub fn new(deviation: f64) -> Self {
        Self {
            deviation: deviation.clamp(0.0, 1.0),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// A duration drawn uniformly from `base * [1 - deviation, 1 + deviation]`.
    pub fn around_duration(&self, base: Duration) -> Duration {
        let factor = self.factor();
        Duration::from_nanos((base.as_nanos() as f64 * factor) as u64)
    }

    fn factor(&self) -> f64 {
        let draw = self.rng.lock().gen::<f64>();
        1.0 + self.deviation - 2.0 * self.deviation * draw
    }
}
