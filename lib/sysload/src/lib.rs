//! Container-aware CPU utilization, published as a process-wide EWMA.
//!
//! A background task samples cgroup and `/proc/stat` counters every 250ms
//! and folds them into a smoothed per-mille value readable without
//! blocking. On platforms without procfs/cgroups the probe publishes 0.

#[macro_use]
extern crate tracing;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Once;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod cgroup;
#[cfg(target_os = "linux")]
mod proc_stat;

const REFRESH_INTERVAL: Duration = Duration::from_millis(250);
const STAT_INTERVAL: Duration = Duration::from_secs(60);
// 250ms at beta 0.95 averages the cpu load over roughly the past 5s
const BETA: f64 = 0.95;

static CPU_USAGE: AtomicI64 = AtomicI64::new(0);
static START: Once = Once::new();

/// Current smoothed CPU usage in per-mille of the quota (0..=1000).
/// Never blocks.
pub fn cpu_usage() -> i64 {
    CPU_USAGE.load(Ordering::Relaxed)
}

/// Starts the sampling loop. Idempotent; must be called from within a
/// tokio runtime the first time.
pub fn start() {
    START.call_once(|| {
        tokio::spawn(refresh_loop());
    });
}

async fn refresh_loop() {
    let mut probe = Probe::new();
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    let mut stat_ticker = tokio::time::interval(STAT_INTERVAL);
    // both tickers complete immediately once; consume those ticks
    ticker.tick().await;
    stat_ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = probe.refresh();
                let previous = CPU_USAGE.load(Ordering::Relaxed);
                let usage = (previous as f64 * BETA + current as f64 * (1.0 - BETA)) as i64;
                CPU_USAGE.store(usage, Ordering::Relaxed);
            }
            _ = stat_ticker.tick() => {
                info!(message = "cpu usage", permille = cpu_usage());
            }
        }
    }
}

#[cfg(target_os = "linux")]
struct Probe {
    state: Option<ProbeState>,
}

#[cfg(target_os = "linux")]
struct ProbeState {
    cg: cgroup::CGroup,
    cores: u64,
    // min(cores, cfs_quota / cfs_period), the share of the machine this
    // process is actually allowed to burn
    quota: f64,
    pre_system: u64,
    pre_total: u64,
}

#[cfg(target_os = "linux")]
impl Probe {
    fn new() -> Self {
        let state = match ProbeState::init() {
            Ok(state) => Some(state),
            Err(err) => {
                // e.g. wsl without a full procfs; shedding falls back to
                // concurrency-only signals
                warn!(message = "cpu probe disabled", %err);
                None
            }
        };

        Self { state }
    }

    /// Returns the instantaneous usage in per-mille since the last call.
    fn refresh(&mut self) -> u64 {
        let Some(state) = self.state.as_mut() else {
            return 0;
        };

        let (total, system) = match (state.cg.usage_nanos(), proc_stat::system_cpu_nanos()) {
            (Ok(total), Ok(system)) => (total, system),
            _ => return 0,
        };

        let cpu_delta = total.saturating_sub(state.pre_total);
        let system_delta = system.saturating_sub(state.pre_system);
        let mut usage = 0;
        if cpu_delta > 0 && system_delta > 0 {
            usage = ((cpu_delta * state.cores) as f64 * 1e3 / (system_delta as f64 * state.quota))
                as u64;
        }
        state.pre_total = total;
        state.pre_system = system;

        usage
    }
}

#[cfg(target_os = "linux")]
impl ProbeState {
    fn init() -> Result<Self, Error> {
        let cg = cgroup::CGroup::detect()?;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);

        let mut quota = cores as f64;
        if let Some(limit) = cg.cpu_limit()? {
            if limit < quota {
                quota = limit;
            }
        }

        let pre_total = cg.usage_nanos()?;
        let pre_system = proc_stat::system_cpu_nanos()?;

        Ok(Self {
            cg,
            cores,
            quota,
            pre_system,
            pre_total,
        })
    }
}

#[cfg(not(target_os = "linux"))]
struct Probe;

#[cfg(not(target_os = "linux"))]
impl Probe {
    fn new() -> Self {
        Self
    }

    fn refresh(&mut self) -> u64 {
        0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("bad format in {path}: {line}")]
    Format { path: String, line: String },
    #[error("no cgroup hierarchy found")]
    NoCgroup,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_starts_at_zero() {
        assert_eq!(cpu_usage(), 0);
    }

    #[test]
    fn ewma_converges_towards_samples() {
        let mut value = 0f64;
        for _ in 0..200 {
            value = value * BETA + 800.0 * (1.0 - BETA);
        }
        assert!(value > 790.0);
    }
}
