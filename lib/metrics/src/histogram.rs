use std::iter::once;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::metric::{Observation, Observer};

/// A bucketed observation.
#[derive(Clone, Debug)]
pub struct ObservationBucket {
    pub le: f64,
    pub count: u64,
}

#[derive(Clone, Debug)]
pub struct HistogramObservation {
    pub buckets: Vec<ObservationBucket>,
    pub sum: f64,
    pub count: u64,
}

#[derive(Clone, Debug)]
pub struct Histogram {
    state: Arc<Mutex<HistogramObservation>>,
}

impl Histogram {
    pub fn new(buckets: impl IntoIterator<Item = f64>) -> Self {
        let buckets = buckets
            .into_iter()
            .chain(once(f64::INFINITY))
            .map(|le| ObservationBucket { le, count: 0 })
            .collect::<Vec<_>>();

        Self {
            state: Arc::new(Mutex::new(HistogramObservation {
                buckets,
                sum: 0.0,
                count: 0,
            })),
        }
    }

    pub fn record(&self, value: f64) {
        let mut state = self.state.lock();

        if let Some(bucket) = state.buckets.iter_mut().find(|b| value <= b.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.sum += value;
            state.count += 1;
        }
    }

    pub fn get(&self) -> HistogramObservation {
        self.state.lock().clone()
    }
}

impl Observer for Histogram {
    type Options = Vec<f64>;

    fn create(buckets: &Self::Options) -> Self {
        Self::new(buckets.iter().copied())
    }

    fn observe(&self) -> Observation {
        Observation::Histogram(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_into_the_right_bucket() {
        let histogram = Histogram::new([1.0, 5.0, 10.0]);

        histogram.record(0.5);
        histogram.record(3.0);
        histogram.record(100.0);

        let observation = histogram.get();
        let counts: Vec<u64> = observation.buckets.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 1, 0, 1]);
        assert_eq!(observation.count, 3);
        assert!((observation.sum - 103.5).abs() < f64::EPSILON);
    }
}
