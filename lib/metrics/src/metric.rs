use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attributes::Attributes;
use crate::histogram::HistogramObservation;

#[derive(Clone, Debug)]
pub enum Observation {
    Counter(u64),
    Histogram(HistogramObservation),
}

/// A recordable metric kind; a [`Metric`] family keeps one observer per
/// unique set of attributes.
pub trait Observer: Clone + Send + 'static {
    type Options: Send + Sync;

    fn create(options: &Self::Options) -> Self;

    fn observe(&self) -> Observation;
}

/// A named family of observers, one per label set.
#[derive(Clone)]
pub struct Metric<T: Observer> {
    pub(crate) name: &'static str,
    pub(crate) help: &'static str,
    pub(crate) options: Arc<T::Options>,
    pub(crate) shard: Arc<Mutex<BTreeMap<Attributes, T>>>,
}

impl<T: Observer> Metric<T> {
    /// Returns the observer for `attrs`, creating it on first use. The
    /// returned handle records without any family-level locking.
    pub fn recorder(&self, attrs: Attributes) -> T {
        self.shard
            .lock()
            .entry(attrs)
            .or_insert_with(|| T::create(&self.options))
            .clone()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
