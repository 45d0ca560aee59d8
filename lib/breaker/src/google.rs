use std::time::Duration;

use rolling::RollingWindow;

use crate::proba::Proba;
use crate::ServiceUnavailable;

// 10s window over 40 buckets, 250ms each
const WINDOW: Duration = Duration::from_secs(10);
const BUCKETS: usize = 40;
const K: f64 = 1.5;
const PROTECTION: u64 = 5;

/// Client-side throttling from the SRE book's "Handling Overload" chapter.
/// `stat.sum` counts accepted requests, `stat.count` counts every request.
pub(crate) struct GoogleBreaker {
    k: f64,
    stat: RollingWindow,
    proba: Proba,
}

impl GoogleBreaker {
    pub(crate) fn new() -> Self {
        Self::with_window(BUCKETS, WINDOW / BUCKETS as u32)
    }

    fn with_window(buckets: usize, interval: Duration) -> Self {
        Self {
            k: K,
            stat: RollingWindow::new(buckets, interval),
            proba: Proba::new(),
        }
    }

    pub(crate) fn accept(&self) -> Result<(), ServiceUnavailable> {
        let (accepts, total) = self.history();
        let weighted_accepts = self.k * accepts as f64;
        // https://sre.google/sre-book/handling-overload/#eq2101
        let drop_ratio =
            ((total as f64 - PROTECTION as f64) - weighted_accepts) / (total + 1) as f64;
        if drop_ratio <= 0.0 {
            return Ok(());
        }

        if self.proba.true_on(drop_ratio) {
            return Err(ServiceUnavailable);
        }

        Ok(())
    }

    pub(crate) fn mark_success(&self) {
        self.stat.add(1.0);
    }

    pub(crate) fn mark_failure(&self) {
        self.stat.add(0.0);
    }

    fn history(&self) -> (u64, u64) {
        let mut accepts = 0u64;
        let mut total = 0u64;
        self.stat.reduce(|b| {
            accepts += b.sum as u64;
            total += b.count;
        });

        (accepts, total)
    }
}
