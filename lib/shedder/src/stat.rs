use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STAT_INTERVAL: Duration = Duration::from_secs(60);

/// Per-service shedding counters, reset and logged once a minute.
#[derive(Clone)]
pub struct SheddingStat {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    total: AtomicI64,
    pass: AtomicI64,
    drop: AtomicI64,
}

struct Snapshot {
    total: i64,
    pass: i64,
    drop: i64,
}

impl SheddingStat {
    /// Must be created inside a tokio runtime; the reporting loop is
    /// spawned here.
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            total: AtomicI64::new(0),
            pass: AtomicI64::new(0),
            drop: AtomicI64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STAT_INTERVAL);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                let snapshot = inner.reset();
                if snapshot.drop == 0 {
                    info!(
                        message = "shedding stats",
                        name = %inner.name,
                        cpu = sysload::cpu_usage(),
                        total = snapshot.total,
                        pass = snapshot.pass,
                        drop = snapshot.drop,
                    );
                } else {
                    error!(
                        message = "shedding stats with drops",
                        name = %inner.name,
                        cpu = sysload::cpu_usage(),
                        total = snapshot.total,
                        pass = snapshot.pass,
                        drop = snapshot.drop,
                    );
                }
            }
        });

        Self { inner }
    }

    pub fn increment_total(&self) {
        self.inner.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pass(&self) {
        self.inner.pass.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_drop(&self) {
        self.inner.drop.fetch_add(1, Ordering::Relaxed);
    }
}

impl Inner {
    fn reset(&self) -> Snapshot {
        Snapshot {
            total: self.total.swap(0, Ordering::Relaxed),
            pass: self.pass.swap(0, Ordering::Relaxed),
            drop: self.drop.swap(0, Ordering::Relaxed),
        }
    }
}
