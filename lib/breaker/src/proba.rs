use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// A mutex-wrapped PRNG answering "true with probability p".
pub(crate) struct Proba {
    rng: Mutex<SmallRng>,
}

impl Proba {
    pub(crate) fn new() -> Self {
        Self {
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub(crate) fn true_on(&self, proba: f64) -> bool {
        self.rng.lock().gen::<f64>() < proba
    }
}
