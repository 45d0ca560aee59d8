use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// A bucket holds the additions made during one interval of the window.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bucket {
    pub sum: f64,
    pub count: u64,
}

impl Bucket {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// A `RollingWindow` approximates a sliding time range with a ring of
/// `size` buckets, each covering `interval`. Sliding is lazy: expired
/// buckets are reset on the next `add`, and `reduce` simply skips them.
pub struct RollingWindow {
    size: usize,
    interval: Duration,
    ignore_current: bool,
    inner: RwLock<Inner>,
}

struct Inner {
    buckets: Vec<Bucket>,
    offset: usize,
    // start time of the bucket at `offset`, aligned to interval boundaries
    last_time: Instant,
}

impl RollingWindow {
    /// # Panics
    ///
    /// Panics if `size` is zero or `interval` is zero.
    pub fn new(size: usize, interval: Duration) -> Self {
        assert!(size > 0, "window must have at least one bucket");
        assert!(!interval.is_zero(), "bucket interval must be positive");

        Self {
            size,
            interval,
            ignore_current: false,
            inner: RwLock::new(Inner {
                buckets: vec![Bucket::default(); size],
                offset: 0,
                last_time: Instant::now(),
            }),
        }
    }

    /// Makes `reduce` skip the live bucket when the window has not just
    /// slid, so partially filled data does not bias aggregates.
    pub fn ignore_current(mut self) -> Self {
        self.ignore_current = true;
        self
    }

    /// Adds `v` to the current bucket, sliding the window first.
    pub fn add(&self, v: f64) {
        let mut inner = self.inner.write();
        self.slide(&mut inner);
        let offset = inner.offset;
        inner.buckets[offset].add(v);
    }

    /// Runs `f` over every bucket still inside the window, oldest first.
    pub fn reduce<F>(&self, mut f: F)
    where
        F: FnMut(&Bucket),
    {
        let inner = self.inner.read();
        let span = self.span(&inner);

        // the live bucket holds partial data; callers may opt out of it
        let visited = if span == 0 && self.ignore_current {
            self.size - 1
        } else {
            self.size - span
        };

        if visited > 0 {
            let start = (inner.offset + span + 1) % self.size;
            for i in 0..visited {
                f(&inner.buckets[(start + i) % self.size]);
            }
        }
    }

    fn span(&self, inner: &Inner) -> usize {
        let elapsed = inner.last_time.elapsed();
        let offset = (elapsed.as_nanos() / self.interval.as_nanos()) as usize;
        if offset < self.size {
            offset
        } else {
            self.size
        }
    }

    fn slide(&self, inner: &mut Inner) {
        let span = self.span(inner);
        if span == 0 {
            return;
        }

        let offset = inner.offset;
        for i in 0..span {
            let idx = (offset + i + 1) % self.size;
            inner.buckets[idx].reset();
        }
        inner.offset = (offset + span) % self.size;

        // snap to the interval boundary so buckets stay aligned
        let elapsed = inner.last_time.elapsed();
        let intervals = elapsed.as_nanos() / self.interval.as_nanos();
        inner.last_time += Duration::from_nanos((self.interval.as_nanos() * intervals) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    const INTERVAL: Duration = Duration::from_millis(50);

    fn sum(window: &RollingWindow) -> f64 {
        let mut total = 0.0;
        window.reduce(|b| total += b.sum);
        total
    }

    fn count(window: &RollingWindow) -> u64 {
        let mut total = 0;
        window.reduce(|b| total += b.count);
        total
    }

    #[test]
    #[should_panic]
    fn zero_buckets_rejected() {
        let _ = RollingWindow::new(0, INTERVAL);
    }

    #[test]
    fn add_within_one_bucket() {
        let window = RollingWindow::new(5, INTERVAL);
        window.add(1.0);
        window.add(2.0);

        assert_eq!(sum(&window), 3.0);
        assert_eq!(count(&window), 2);
    }

    #[test]
    fn slide_resets_expired_buckets() {
        let window = RollingWindow::new(5, INTERVAL);
        window.add(1.0);
        // land two and a half intervals later, in the third bucket
        sleep(INTERVAL * 2 + INTERVAL / 2);
        window.add(2.0);

        assert_eq!(sum(&window), 3.0);
        assert_eq!(count(&window), 2);
    }

    #[test]
    fn data_expires_after_full_window() {
        let window = RollingWindow::new(3, INTERVAL);
        window.add(5.0);
        sleep(INTERVAL * 4);

        assert_eq!(sum(&window), 0.0);
        assert_eq!(count(&window), 0);
    }

    #[test]
    fn ignore_current_skips_live_bucket() {
        let window = RollingWindow::new(5, INTERVAL).ignore_current();
        window.add(1.0);

        // no slide happened since the add, so the live bucket is skipped
        assert_eq!(sum(&window), 0.0);

        sleep(INTERVAL + INTERVAL / 2);
        assert_eq!(sum(&window), 1.0);
    }

    #[test]
    fn reduce_sees_every_retained_bucket() {
        let window = RollingWindow::new(4, INTERVAL);
        for i in 0..3 {
            if i > 0 {
                sleep(INTERVAL);
            }
            window.add(f64::from(i + 1));
        }

        // 1 + 2 + 3 spread over three buckets, none expired yet
        assert_eq!(sum(&window), 6.0);
        assert_eq!(count(&window), 3);
    }
}
