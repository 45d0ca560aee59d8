use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metric::{Observation, Observer};

#[derive(Clone, Debug, Default)]
pub struct Counter {
    state: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl Observer for Counter {
    type Options = ();

    fn create(_: &Self::Options) -> Self {
        Self::default()
    }

    fn observe(&self) -> Observation {
        Observation::Counter(self.fetch())
    }
}
