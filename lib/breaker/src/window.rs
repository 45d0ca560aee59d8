use std::fmt;

use parking_lot::Mutex;

const NUM_HISTORY_REASONS: usize = 5;
const TIME_FORMAT: &str = "%H:%M:%S";

/// Ring buffer of the most recent rejection reasons, surfaced when the
/// breaker stays open so operators can see what tripped it.
#[derive(Default)]
pub(crate) struct ErrorWindow {
    inner: Mutex<Reasons>,
}

#[derive(Default)]
struct Reasons {
    reasons: [String; NUM_HISTORY_REASONS],
    index: usize,
    count: usize,
}

impl ErrorWindow {
    pub(crate) fn add(&self, reason: &str) {
        let mut inner = self.inner.lock();
        let stamp = chrono::Local::now().format(TIME_FORMAT);
        let index = inner.index;
        inner.reasons[index] = format!("{stamp} {reason}");
        inner.index = (index + 1) % NUM_HISTORY_REASONS;
        inner.count = (inner.count + 1).min(NUM_HISTORY_REASONS);
    }
}

impl fmt::Display for ErrorWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();

        // newest first
        let mut first = true;
        for i in 0..inner.count {
            let slot =
                (inner.index + NUM_HISTORY_REASONS - 1 - i) % NUM_HISTORY_REASONS;
            if !first {
                f.write_str("\n")?;
            }
            f.write_str(&inner.reasons[slot])?;
            first = false;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_latest_reasons() {
        let window = ErrorWindow::default();
        for i in 0..7 {
            window.add(&format!("reason-{i}"));
        }

        let rendered = window.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("reason-6"));
        assert!(lines[4].ends_with("reason-2"));
    }

    #[test]
    fn empty_window_renders_empty() {
        let window = ErrorWindow::default();
        assert_eq!(window.to_string(), "");
    }
}
