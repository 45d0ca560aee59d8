//! Power-of-two-choices picking over EWMA latency and success scores.
//!
//! Each sub-connection tracks an exponentially decayed latency (`lag`) and
//! success score; a pick samples two distinct candidates and takes the less
//! loaded, except that a candidate which has not been picked for a second
//! is taken unconditionally so its decayed stats can recover.

#[macro_use]
extern crate tracing;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

// decay constant from finagle
const DECAY_TIME: u64 = Duration::from_secs(10).as_nanos() as u64;
const FORCE_PICK: u64 = Duration::from_secs(1).as_nanos() as u64;
const LOG_INTERVAL: u64 = Duration::from_secs(60).as_nanos() as u64;
const INIT_SUCCESS: u64 = 1000;
// a conn is healthy while its success score stays above half the initial
const THROTTLE_SUCCESS: u64 = INIT_SUCCESS / 2;
const PENALTY: u64 = i32::MAX as u64;
const PICK_TIMES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no sub-connection available")]
pub struct NoSubConnAvailable;

impl<C> std::fmt::Debug for SubConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubConn").field("addr", &self.addr).finish()
    }
}

/// One remote backend plus its load statistics.
pub struct SubConn<C> {
    // ewma of request latency in nanoseconds
    lag: AtomicU64,
    inflight: AtomicI64,
    // ewma success score in [0, 1000]
    success: AtomicU64,
    requests: AtomicI64,
    // completion timestamp of the most recent request, nanos since epoch
    last: AtomicU64,
    // when this conn was last chosen by a pick
    pick: AtomicU64,
    addr: String,
    conn: C,
}

impl<C> SubConn<C> {
    fn new(addr: String, conn: C) -> Self {
        Self {
            lag: AtomicU64::new(0),
            inflight: AtomicI64::new(0),
            success: AtomicU64::new(INIT_SUCCESS),
            requests: AtomicI64::new(0),
            last: AtomicU64::new(0),
            pick: AtomicU64::new(0),
            addr,
            conn,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    fn healthy(&self) -> bool {
        self.success.load(Ordering::Relaxed) > THROTTLE_SUCCESS
    }

    fn load(&self) -> u64 {
        // plus one to avoid multiplying by zero
        let lag = (self.lag.load(Ordering::Relaxed) + 1) as f64;
        let lag = lag.sqrt() as u64;
        let inflight = self.inflight.load(Ordering::Relaxed) + 1;
        let load = lag.saturating_mul(inflight.max(0) as u64);
        if load == 0 {
            return PENALTY;
        }

        load
    }
}

/// A P2C + EWMA picker over a fixed set of ready sub-connections. Rebuild
/// the picker when the address set changes.
pub struct P2cPicker<C, E> {
    inner: Arc<Inner<C, E>>,
}

impl<C, E> Clone for P2cPicker<C, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C, E> {
    conns: Vec<Arc<SubConn<C>>>,
    // one mutex serializes the whole pick; the rng lives inside it so its
    // draws are covered by the same critical section
    lock: Mutex<SmallRng>,
    stamp: AtomicU64,
    epoch: Instant,
    acceptable: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<C, E> P2cPicker<C, E>
where
    C: Send + Sync + 'static,
    E: 'static,
{
    /// `acceptable` classifies a completion error: acceptable errors still
    /// count towards the success score.
    pub fn new<A>(conns: Vec<(String, C)>, acceptable: A) -> Self
    where
        A: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let conns = conns
            .into_iter()
            .map(|(addr, conn)| Arc::new(SubConn::new(addr, conn)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                conns,
                lock: Mutex::new(SmallRng::from_entropy()),
                stamp: AtomicU64::new(0),
                epoch: Instant::now(),
                acceptable: Arc::new(acceptable),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.conns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.conns.len()
    }

    /// Picks a sub-connection. The returned [`Completion`] must be resolved
    /// with `done` when the request finishes; dropping it without calling
    /// `done` leaves the conn's in-flight count inflated.
    pub fn pick(&self) -> Result<(Arc<SubConn<C>>, Completion<C, E>), NoSubConnAvailable> {
        let inner = &self.inner;
        // held for the full pick: sampling, comparison and the counter
        // updates all sit in one critical section
        let mut rng = inner.lock.lock();

        let chosen = match inner.conns.len() {
            0 => return Err(NoSubConnAvailable),
            1 => inner.choose(&inner.conns[0], None),
            2 => inner.choose(&inner.conns[0], Some(&inner.conns[1])),
            n => {
                let mut node1 = &inner.conns[0];
                let mut node2 = &inner.conns[1];
                for _ in 0..PICK_TIMES {
                    let a = rng.gen_range(0..n);
                    let mut b = rng.gen_range(0..n - 1);
                    if b >= a {
                        b += 1;
                    }
                    node1 = &inner.conns[a];
                    node2 = &inner.conns[b];
                    if node1.healthy() && node2.healthy() {
                        break;
                    }
                }

                inner.choose(node1, Some(node2))
            }
        };

        chosen.inflight.fetch_add(1, Ordering::Relaxed);
        chosen.requests.fetch_add(1, Ordering::Relaxed);

        let completion = Completion {
            conn: Arc::clone(&chosen),
            inner: Arc::clone(inner),
            start: inner.now(),
        };
        drop(rng);

        Ok((chosen, completion))
    }
}

impl<C, E> Inner<C, E> {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn choose(&self, c1: &Arc<SubConn<C>>, c2: Option<&Arc<SubConn<C>>>) -> Arc<SubConn<C>> {
        let start = self.now();
        let Some(c2) = c2 else {
            c1.pick.store(start, Ordering::Relaxed);
            return Arc::clone(c1);
        };

        let (c1, c2) = if c1.load() > c2.load() {
            (c2, c1)
        } else {
            (c1, c2)
        };

        // force a probe of the loser if it has idled past the window, so
        // its decayed stats get fresh samples
        let pick = c2.pick.load(Ordering::Relaxed);
        if start.saturating_sub(pick) > FORCE_PICK
            && c2
                .pick
                .compare_exchange(pick, start, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Arc::clone(c2);
        }

        c1.pick.store(start, Ordering::Relaxed);
        Arc::clone(c1)
    }

    fn log_stats(&self) {
        let mut stats = String::new();
        for (i, conn) in self.conns.iter().enumerate() {
            if i > 0 {
                stats.push_str("; ");
            }
            let _ = write!(
                stats,
                "conn: {}, load: {}, reqs: {}",
                conn.addr,
                conn.load(),
                conn.requests.swap(0, Ordering::Relaxed),
            );
        }

        info!(message = "p2c pick", stats = %stats);
    }
}

impl<C, E> std::fmt::Debug for Completion<C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("conn", &self.conn)
            .field("start", &self.start)
            .finish()
    }
}

/// The completion half of a pick; feeds latency and success samples back
/// into the sub-connection's EWMAs.
pub struct Completion<C, E> {
    conn: Arc<SubConn<C>>,
    inner: Arc<Inner<C, E>>,
    start: u64,
}

impl<C, E> Completion<C, E> {
    pub fn done(self, err: Option<&E>) {
        let conn = &self.conn;
        conn.inflight.fetch_add(-1, Ordering::Relaxed);

        let now = self.inner.now();
        let last = conn.last.swap(now, Ordering::Relaxed);
        let td = now.saturating_sub(last);

        // Newton's law of cooling: the longer the gap since the previous
        // completion, the less the old average weighs
        let mut w = (-(td as f64) / DECAY_TIME as f64).exp();
        let lag = now.saturating_sub(self.start);
        let old_lag = conn.lag.load(Ordering::Relaxed);
        if old_lag == 0 {
            // first sample replaces the initial value outright
            w = 0.0;
        }
        conn.lag.store(
            (old_lag as f64 * w + lag as f64 * (1.0 - w)) as u64,
            Ordering::Relaxed,
        );

        let success = match err {
            Some(err) if !(self.inner.acceptable)(err) => 0,
            _ => INIT_SUCCESS,
        };
        let old_success = conn.success.load(Ordering::Relaxed);
        conn.success.store(
            (old_success as f64 * w + success as f64 * (1.0 - w)) as u64,
            Ordering::Relaxed,
        );

        let stamp = self.inner.stamp.load(Ordering::Relaxed);
        if now.saturating_sub(stamp) >= LOG_INTERVAL
            && self
                .inner
                .stamp
                .compare_exchange(stamp, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.inner.log_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picker(addrs: &[&str]) -> P2cPicker<(), ()> {
        let conns = addrs.iter().map(|a| (a.to_string(), ())).collect();
        P2cPicker::new(conns, |_: &()| false)
    }

    #[test]
    fn empty_picker_errors() {
        let picker = picker(&[]);
        assert_eq!(picker.pick().unwrap_err(), NoSubConnAvailable);
    }

    #[test]
    fn single_conn_always_chosen() {
        let picker = picker(&["a"]);
        for _ in 0..10 {
            let (conn, completion) = picker.pick().unwrap();
            assert_eq!(conn.addr(), "a");
            completion.done(None);
        }
    }

    #[test]
    fn inflight_returns_to_zero_when_every_pick_is_done() {
        let picker = picker(&["a", "b", "c"]);

        let completions: Vec<_> = (0..64).map(|_| picker.pick().unwrap()).collect();
        let total: i64 = picker
            .inner
            .conns
            .iter()
            .map(|c| c.inflight.load(Ordering::Relaxed))
            .sum();
        assert_eq!(total, 64);

        for (_, completion) in completions {
            completion.done(None);
        }
        for conn in &picker.inner.conns {
            assert_eq!(conn.inflight.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn first_sample_replaces_initial_lag() {
        let picker = picker(&["a"]);
        let (conn, completion) = picker.pick().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        completion.done(None);

        let lag = conn.lag.load(Ordering::Relaxed);
        assert!(lag >= 15_000_000, "lag {lag} too small");
        assert!(lag <= 200_000_000, "lag {lag} too large");
    }

    #[test]
    fn unacceptable_errors_pull_success_down() {
        let picker = picker(&["a"]);

        for _ in 0..64 {
            let (_, completion) = picker.pick().unwrap();
            completion.done(Some(&()));
        }

        let conn = &picker.inner.conns[0];
        assert!(!conn.healthy(), "success {:?}", conn.success);
    }

    #[test]
    fn acceptable_errors_keep_success_up() {
        let conns = vec![("a".to_string(), ())];
        let picker: P2cPicker<(), ()> = P2cPicker::new(conns, |_: &()| true);

        for _ in 0..64 {
            let (_, completion) = picker.pick().unwrap();
            completion.done(Some(&()));
        }

        assert!(picker.inner.conns[0].healthy());
    }

    #[test]
    fn lower_load_wins_the_comparison() {
        let picker = picker(&["slow", "fast"]);
        let slow = &picker.inner.conns[0];
        let fast = &picker.inner.conns[1];
        slow.lag.store(100_000_000, Ordering::Relaxed);
        fast.lag.store(1_000_000, Ordering::Relaxed);
        // keep both freshly picked so the stale-probe rule stays out
        let now = picker.inner.now();
        slow.pick.store(now, Ordering::Relaxed);
        fast.pick.store(now, Ordering::Relaxed);

        for _ in 0..10 {
            let (conn, completion) = picker.pick().unwrap();
            assert_eq!(conn.addr(), "fast");
            completion.done(None);
            let now = picker.inner.now();
            slow.pick.store(now, Ordering::Relaxed);
            fast.pick.store(now, Ordering::Relaxed);
        }
    }

    #[test]
    fn idle_conn_gets_force_probed() {
        let picker = picker(&["lagging", "quick"]);
        let lagging = &picker.inner.conns[0];
        let quick = &picker.inner.conns[1];
        lagging.lag.store(100_000_000, Ordering::Relaxed);
        quick.lag.store(1_000_000, Ordering::Relaxed);

        // the lagging conn has not been picked for over a second
        std::thread::sleep(Duration::from_millis(1100));

        let mut probed = false;
        for _ in 0..10 {
            let (conn, completion) = picker.pick().unwrap();
            if conn.addr() == "lagging" {
                probed = true;
            }
            completion.done(None);
        }
        assert!(probed, "stale conn must be probed within 10 picks");
    }
}
