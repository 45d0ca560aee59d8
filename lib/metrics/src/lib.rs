#![forbid(unsafe_code)]

mod attributes;
mod counter;
mod histogram;
mod metric;
mod registry;

pub use attributes::Attributes;
pub use counter::Counter;
pub use histogram::{Histogram, HistogramObservation, ObservationBucket};
pub use metric::{Metric, Observation, Observer};
pub use registry::{global_registry, register_counter, register_histogram, Registry, Reporter};
