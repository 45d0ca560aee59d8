use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::attributes::Attributes;
use crate::counter::Counter;
use crate::histogram::Histogram;
use crate::metric::{Metric, Observation, Observer};

#[derive(Default)]
pub struct Registry {
    counters: Mutex<BTreeMap<&'static str, Metric<Counter>>>,
    histograms: Mutex<BTreeMap<&'static str, Metric<Histogram>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(&self, name: &'static str, help: &'static str) -> Metric<Counter> {
        self.counters
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                help,
                options: Arc::new(()),
                shard: Arc::new(Mutex::new(BTreeMap::new())),
            })
            .clone()
    }

    /// Registering the same name twice keeps the first bucket layout.
    pub fn register_histogram(
        &self,
        name: &'static str,
        help: &'static str,
        buckets: impl IntoIterator<Item = f64>,
    ) -> Metric<Histogram> {
        let buckets = buckets.into_iter().collect::<Vec<_>>();

        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                help,
                options: Arc::new(buckets),
                shard: Arc::new(Mutex::new(BTreeMap::new())),
            })
            .clone()
    }

    /// Walks every registered family and hands each observation to the
    /// reporter, which owns the exposition format.
    pub fn report(&self, reporter: &mut impl Reporter) {
        report_kind(reporter, &self.counters);
        report_kind(reporter, &self.histograms);
    }
}

fn report_kind<T: Observer>(
    reporter: &mut impl Reporter,
    metrics: &Mutex<BTreeMap<&'static str, Metric<T>>>,
) {
    for metric in metrics.lock().values() {
        reporter.start_metric(metric.name, metric.help);
        for (attrs, observer) in metric.shard.lock().iter() {
            reporter.report(attrs, observer.observe());
        }
        reporter.finish_metric();
    }
}

pub trait Reporter {
    fn start_metric(&mut self, name: &'static str, help: &'static str);

    fn report(&mut self, attrs: &Attributes, observation: Observation);

    fn finish_metric(&mut self);
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

pub fn global_registry() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

pub fn register_counter(name: &'static str, help: &'static str) -> Metric<Counter> {
    global_registry().register_counter(name, help)
}

pub fn register_histogram(
    name: &'static str,
    help: &'static str,
    buckets: impl IntoIterator<Item = f64>,
) -> Metric<Histogram> {
    global_registry().register_histogram(name, help, buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_with_same_attrs_share_state() {
        let registry = Registry::new();
        let family = registry.register_counter("requests_total", "requests");

        let attrs = Attributes::new().with("method", "ping");
        family.recorder(attrs.clone()).inc(1);
        family.recorder(attrs.clone()).inc(2);

        assert_eq!(family.recorder(attrs).fetch(), 3);
    }

    #[test]
    fn re_registration_returns_the_same_family() {
        let registry = Registry::new();
        let first = registry.register_counter("dupes_total", "");
        let second = registry.register_counter("dupes_total", "ignored");

        first.recorder(Attributes::new()).inc(5);
        assert_eq!(second.recorder(Attributes::new()).fetch(), 5);
    }

    #[test]
    fn report_visits_every_family() {
        struct Collect(Vec<(String, String)>);

        impl Reporter for Collect {
            fn start_metric(&mut self, name: &'static str, _help: &'static str) {
                self.0.push(("start".into(), name.into()));
            }

            fn report(&mut self, attrs: &Attributes, observation: Observation) {
                let labels = attrs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                let value = match observation {
                    Observation::Counter(v) => v.to_string(),
                    Observation::Histogram(h) => format!("count={}", h.count),
                };
                self.0.push((labels, value));
            }

            fn finish_metric(&mut self) {}
        }

        let registry = Registry::new();
        registry
            .register_counter("a_total", "")
            .recorder(Attributes::new().with("code", "0"))
            .inc(7);
        registry
            .register_histogram("b_ms", "", [1.0, 10.0])
            .recorder(Attributes::new())
            .record(3.0);

        let mut reporter = Collect(Vec::new());
        registry.report(&mut reporter);

        assert!(reporter.0.contains(&("code=0".into(), "7".into())));
        assert!(reporter.0.contains(&("".into(), "count=1".into())));
    }
}
