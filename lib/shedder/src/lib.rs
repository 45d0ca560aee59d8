//! Adaptive, CPU-aware load shedding for inbound requests.
//!
//! The shedder learns the service's sustainable concurrency from recent
//! throughput and latency, and starts dropping only when the CPU is
//! saturated (or was within the cool-off period) *and* the in-flight count
//! sits above that ceiling.

#[macro_use]
extern crate tracing;

mod stat;

pub use stat::SheddingStat;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rolling::RollingWindow;

const DEFAULT_BUCKETS: usize = 50;
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
// 900 per-mille, i.e. 90% of the CPU quota
const DEFAULT_CPU_THRESHOLD: i64 = 900;
const DEFAULT_MIN_RT_MS: f64 = 1000.0;
// moving average hyperparameter for the in-flight estimate
const FLYING_BETA: f64 = 0.9;
const COOL_OFF: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("service overloaded")]
pub struct Overloaded;

/// An admission controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub enum Shedder {
    Adaptive(Arc<Adaptive>),
    Nop,
}

impl Shedder {
    /// An adaptive shedder with the default window, buckets and CPU
    /// threshold. Must be created inside a tokio runtime: the CPU probe
    /// loop starts with the first adaptive shedder.
    pub fn adaptive() -> Self {
        Builder::default().build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A shedder that admits everything.
    pub fn nop() -> Self {
        Self::Nop
    }

    /// Admission check. On success the caller must resolve the promise
    /// with `pass` (served) or `fail` (errored), exactly once.
    pub fn allow(&self) -> Result<Promise, Overloaded> {
        match self {
            Shedder::Adaptive(adaptive) => {
                if adaptive.should_drop() {
                    adaptive.dropped_recently.store(true, Ordering::Relaxed);
                    return Err(Overloaded);
                }

                adaptive.add_flying(1);
                Ok(Promise {
                    start: Instant::now(),
                    shedder: Some(Arc::clone(adaptive)),
                })
            }
            Shedder::Nop => Ok(Promise {
                start: Instant::now(),
                shedder: None,
            }),
        }
    }
}

pub struct Builder {
    window: Duration,
    buckets: usize,
    cpu_threshold: i64,
    cpu: Option<Box<dyn Fn() -> i64 + Send + Sync>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            buckets: DEFAULT_BUCKETS,
            cpu_threshold: DEFAULT_CPU_THRESHOLD,
            cpu: None,
        }
    }
}

impl Builder {
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn cpu_threshold(mut self, threshold: i64) -> Self {
        self.cpu_threshold = threshold;
        self
    }

    /// Replaces the CPU usage source, mainly to pin saturation in tests.
    pub fn cpu_usage<F>(mut self, f: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.cpu = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Shedder {
        let cpu = match self.cpu {
            Some(cpu) => cpu,
            None => {
                sysload::start();
                Box::new(sysload::cpu_usage)
            }
        };

        let bucket_duration = self.window / self.buckets as u32;
        Shedder::Adaptive(Arc::new(Adaptive {
            cpu_threshold: self.cpu_threshold,
            windows: (Duration::from_secs(1).as_nanos() / bucket_duration.as_nanos()) as i64,
            flying: AtomicI64::new(0),
            avg_flying: Mutex::new(0.0),
            overload_time: Mutex::new(None),
            dropped_recently: AtomicBool::new(false),
            pass_counter: RollingWindow::new(self.buckets, bucket_duration).ignore_current(),
            rt_counter: RollingWindow::new(self.buckets, bucket_duration).ignore_current(),
            cpu,
        }))
    }
}

pub struct Adaptive {
    cpu_threshold: i64,
    // buckets per second, used to project the pass counter into QPS
    windows: i64,
    flying: AtomicI64,
    avg_flying: Mutex<f64>,
    overload_time: Mutex<Option<Instant>>,
    dropped_recently: AtomicBool,
    pass_counter: RollingWindow,
    rt_counter: RollingWindow,
    cpu: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Adaptive {
    fn add_flying(&self, delta: i64) {
        let flying = self.flying.fetch_add(delta, Ordering::Relaxed) + delta;
        // update only on completion: the average deliberately lags the
        // instantaneous count, so short spikes in either direction are
        // absorbed and only sustained pressure latches high_thru
        if delta < 0 {
            let mut avg = self.avg_flying.lock();
            *avg = *avg * FLYING_BETA + flying as f64 * (1.0 - FLYING_BETA);
        }
    }

    fn high_thru(&self) -> bool {
        let avg_flying = *self.avg_flying.lock();
        let max_flight = self.max_flight();

        avg_flying as i64 > max_flight && self.flying.load(Ordering::Relaxed) > max_flight
    }

    fn max_flight(&self) -> i64 {
        // maxQPS = maxPass * windows; ceiling = maxQPS * minRt / 1000ms
        let max = (self.max_pass() * self.windows) as f64 * (self.min_rt() / 1e3);
        max.max(1.0) as i64
    }

    fn max_pass(&self) -> i64 {
        let mut result = 1.0f64;
        self.pass_counter.reduce(|b| {
            if b.sum > result {
                result = b.sum;
            }
        });

        result as i64
    }

    fn min_rt(&self) -> f64 {
        let mut result = DEFAULT_MIN_RT_MS;
        self.rt_counter.reduce(|b| {
            if b.count == 0 {
                return;
            }

            let avg = (b.sum / b.count as f64).round();
            if avg < result {
                result = avg;
            }
        });

        result
    }

    fn should_drop(&self) -> bool {
        if (self.system_overloaded() || self.still_hot()) && self.high_thru() {
            let flying = self.flying.load(Ordering::Relaxed);
            let avg_flying = *self.avg_flying.lock();
            error!(
                message = "dropping request",
                cpu = (self.cpu)(),
                max_pass = self.max_pass(),
                min_rt = self.min_rt(),
                hot = self.still_hot(),
                flying,
                avg_flying,
            );
            return true;
        }

        false
    }

    fn still_hot(&self) -> bool {
        if !self.dropped_recently.load(Ordering::Relaxed) {
            return false;
        }

        let overload_time = self.overload_time.lock();
        let Some(at) = *overload_time else {
            return false;
        };
        if at.elapsed() < COOL_OFF {
            return true;
        }
        drop(overload_time);

        self.dropped_recently.store(false, Ordering::Relaxed);
        false
    }

    fn system_overloaded(&self) -> bool {
        if (self.cpu)() < self.cpu_threshold {
            return false;
        }

        *self.overload_time.lock() = Some(Instant::now());
        true
    }

    #[cfg(test)]
    fn flying(&self) -> i64 {
        self.flying.load(Ordering::Relaxed)
    }
}

/// Completion callback for an admitted request.
pub struct Promise {
    start: Instant,
    shedder: Option<Arc<Adaptive>>,
}

impl Promise {
    /// The request was served; record its latency and count it as passed.
    pub fn pass(self) {
        if let Some(shedder) = self.shedder {
            let rt = self.start.elapsed().as_secs_f64() * 1e3;
            shedder.add_flying(-1);
            shedder.rt_counter.add(rt.ceil());
            shedder.pass_counter.add(1.0);
        }
    }

    /// The request failed; it only releases the in-flight slot.
    pub fn fail(self) {
        if let Some(shedder) = self.shedder {
            shedder.add_flying(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptive(shedder: &Shedder) -> &Arc<Adaptive> {
        match shedder {
            Shedder::Adaptive(inner) => inner,
            Shedder::Nop => panic!("expected an adaptive shedder"),
        }
    }

    #[test]
    fn idle_cpu_admits_everything() {
        let shedder = Shedder::builder().cpu_usage(|| 100).build();

        for _ in 0..10_000 {
            let promise = shedder.allow().expect("idle service must admit");
            promise.pass();
        }
    }

    #[test]
    fn nop_always_admits() {
        let shedder = Shedder::nop();
        for _ in 0..1000 {
            shedder.allow().expect("nop admits").pass();
        }
    }

    #[test]
    fn saturated_cpu_with_high_concurrency_drops() {
        let shedder = Shedder::builder().cpu_usage(|| 950).build();

        // pile up in-flight requests well above the default ceiling of 10
        let mut promises = Vec::new();
        for _ in 0..100 {
            match shedder.allow() {
                Ok(promise) => promises.push(promise),
                // avg_flying still lags; no drops expected yet, but
                // tolerate them in case of scheduling delays
                Err(Overloaded) => {}
            }
        }

        // completions drag avg_flying up towards the in-flight count
        for promise in promises.drain(..50) {
            promise.pass();
        }

        let dropped = (0..100)
            .filter(|_| match shedder.allow() {
                Ok(promise) => {
                    promise.fail();
                    false
                }
                Err(Overloaded) => true,
            })
            .count();
        assert!(dropped >= 50, "only {dropped} of 100 dropped");

        for promise in promises {
            promise.fail();
        }
    }

    #[test]
    fn cool_off_keeps_dropping_after_cpu_recovers() {
        let cpu = Arc::new(AtomicI64::new(950));
        let cpu_reader = Arc::clone(&cpu);
        let shedder = Shedder::builder()
            .cpu_usage(move || cpu_reader.load(Ordering::Relaxed))
            .build();

        let mut promises = Vec::new();
        for _ in 0..100 {
            if let Ok(promise) = shedder.allow() {
                promises.push(promise);
            }
        }
        for promise in promises.drain(..40) {
            promise.pass();
        }
        // trip the shedder while the cpu is hot
        assert!(shedder.allow().is_err());

        // cpu recovers but the cool-off window has not elapsed
        cpu.store(100, Ordering::Relaxed);
        assert!(shedder.allow().is_err(), "cool-off must keep dropping");

        std::thread::sleep(COOL_OFF + Duration::from_millis(100));
        let promise = shedder.allow().expect("cooled-off shedder must admit");
        promise.fail();

        for promise in promises {
            promise.fail();
        }
    }

    #[test]
    fn flying_balances_out() {
        let shedder = Shedder::builder().cpu_usage(|| 0).build();

        let mut promises = Vec::new();
        for _ in 0..32 {
            promises.push(shedder.allow().unwrap());
        }
        assert_eq!(adaptive(&shedder).flying(), 32);

        for (i, promise) in promises.into_iter().enumerate() {
            if i % 2 == 0 {
                promise.pass();
            } else {
                promise.fail();
            }
        }
        assert_eq!(adaptive(&shedder).flying(), 0);
    }
}
