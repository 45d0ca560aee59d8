//! Process lifecycle: wrap-up and shutdown listener lists plus the signal
//! task that drives them.
//!
//! On SIGTERM/SIGINT the wrap-up listeners run first (deregistration,
//! lease revocation) with a second of headroom, then the shutdown
//! listeners (servers, stores), and after a configurable grace the
//! process is force-quit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

use parking_lot::Mutex;

const WRAP_UP_TIME: Duration = Duration::from_secs(1);
// most blocking consumers give up within 5s; leave them that plus slack
const DEFAULT_WAIT_TIME_MS: u64 = 5500;

static FORCE_QUIT_DELAY_MS: AtomicU64 = AtomicU64::new(DEFAULT_WAIT_TIME_MS);

static WRAP_UP: ListenerManager = ListenerManager::new();
static SHUTDOWN: ListenerManager = ListenerManager::new();

struct ListenerManager {
    listeners: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ListenerManager {
    const fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, f: Box<dyn FnOnce() + Send>) {
        self.listeners.lock().push(f);
    }

    /// Runs every registered listener on its own thread and waits for all
    /// of them. Listeners only fire once.
    fn notify(&self) {
        let listeners: Vec<_> = self.listeners.lock().drain(..).collect();
        let handles: Vec<_> = listeners.into_iter().map(std::thread::spawn).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!(message = "shutdown listener panicked");
            }
        }
    }
}

/// Registers `f` to run when graceful shutdown begins, before the
/// shutdown listeners.
pub fn add_wrap_up_listener<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    WRAP_UP.add(Box::new(f));
}

/// Registers `f` to run during shutdown, after the wrap-up phase.
pub fn add_shutdown_listener<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    SHUTDOWN.add(Box::new(f));
}

/// Overrides the delay between the shutdown signal and the forced quit.
pub fn set_time_to_force_quit(delay: Duration) {
    FORCE_QUIT_DELAY_MS.store(delay.as_millis() as u64, Ordering::Relaxed);
}

/// Runs the wrap-up listeners now. Exposed for tests and for embedders
/// that manage signals themselves.
pub fn wrap_up() {
    WRAP_UP.notify();
}

/// Runs the shutdown listeners now.
pub fn shutdown() {
    SHUTDOWN.notify();
}

/// Installs the SIGTERM/SIGINT handler. Idempotent; must be called from
/// within a tokio runtime.
pub fn setup_signals() {
    static SETUP: Once = Once::new();
    SETUP.call_once(|| {
        tokio::spawn(signal_loop());
    });
}

#[cfg(unix)]
async fn signal_loop() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to set up SIGTERM handle");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handle");

    tokio::select! {
        _ = sigterm.recv() => graceful_stop("SIGTERM").await,
        _ = sigint.recv() => graceful_stop("SIGINT").await,
    }
}

#[cfg(not(unix))]
async fn signal_loop() {
    if tokio::signal::ctrl_c().await.is_ok() {
        graceful_stop("ctrl-c").await;
    }
}

async fn graceful_stop(signal: &str) {
    info!(message = "got signal, shutting down", signal);

    tokio::task::spawn_blocking(wrap_up);
    tokio::time::sleep(WRAP_UP_TIME).await;

    tokio::task::spawn_blocking(shutdown);

    let grace = Duration::from_millis(FORCE_QUIT_DELAY_MS.load(Ordering::Relaxed));
    tokio::time::sleep(grace.saturating_sub(WRAP_UP_TIME)).await;

    // clean shutdown should have exited the process by now
    error!(message = "still alive after grace period, forcing quit", grace_ms = grace.as_millis() as u64);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // the listener lists are process-wide; keep the tests serialized
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn listeners_run_once_in_both_phases() {
        let _guard = TEST_LOCK.lock();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&calls);
        add_wrap_up_listener(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let counted = Arc::clone(&calls);
        add_shutdown_listener(move || {
            counted.fetch_add(10, Ordering::SeqCst);
        });

        wrap_up();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 11);

        // both lists drained; a second notification is a no-op
        wrap_up();
        shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panicking_listener_does_not_block_the_rest() {
        let _guard = TEST_LOCK.lock();
        let calls = Arc::new(AtomicUsize::new(0));

        add_wrap_up_listener(|| panic!("bad listener"));
        let counted = Arc::clone(&calls);
        add_wrap_up_listener(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        wrap_up();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
