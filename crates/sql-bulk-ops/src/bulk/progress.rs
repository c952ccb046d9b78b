//! Row-count progress reporting for bulk transports.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ProgressCallback = dyn Fn(f64) + Send + Sync;

/// Thread-safe progress reporter.
///
/// Transports call [`add_rows`](Self::add_rows) as rows go out; the callback
/// receives the completed fraction (0.0 to 1.0, four decimals) each time another
/// `notify_after` rows have been sent. Clones share the same counters.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Arc<ProgressCallback>,
    total: u64,
    notify_after: u64,
    rows: Arc<AtomicU64>,
    last_notified: Arc<AtomicU64>,
}

impl ProgressReporter {
    /// Create a reporter that notifies once per row.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            total: 0,
            notify_after: 1,
            rows: Arc::new(AtomicU64::new(0)),
            last_notified: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the notification interval in rows (minimum 1).
    pub fn with_notify_after(mut self, rows: usize) -> Self {
        self.notify_after = rows.max(1) as u64;
        self
    }

    /// Scope the reporter to one operation of `total` rows, resetting the counters.
    pub fn for_total(&self, total: usize) -> Self {
        Self {
            callback: self.callback.clone(),
            total: total as u64,
            notify_after: self.notify_after,
            rows: Arc::new(AtomicU64::new(0)),
            last_notified: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record `count` more rows sent.
    pub fn add_rows(&self, count: u64) {
        let rows = self.rows.fetch_add(count, Ordering::Relaxed) + count;
        let last = self.last_notified.load(Ordering::Relaxed);
        if rows - last >= self.notify_after
            && self
                .last_notified
                .compare_exchange(last, rows, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            (self.callback)(self.fraction(rows));
        }
    }

    /// Rows recorded so far.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    fn fraction(&self, rows: u64) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let fraction = (rows as f64 / self.total as f64).min(1.0);
        (fraction * 10_000.0).round() / 10_000.0
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("total", &self.total)
            .field("notify_after", &self.notify_after)
            .field("rows", &self.rows())
            .finish()
    }
}
