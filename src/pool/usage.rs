//! Usage window shared by pool implementations
//!
//! Every open lease is a span `[start, end)` measured in microseconds since the
//! tracker was created. Timestamps handed out by the tracker are strictly
//! increasing, even when several tasks read the clock at the same instant, so
//! spans never collide in the ordered map.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Trailing windows reported by pools, longest first
pub const STANDARD_WINDOWS: [Duration; 3] = [
    Duration::from_secs(300),
    Duration::from_secs(60),
    Duration::from_secs(5),
];

const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Ticket returned by [`UsageTracker::begin`]; hand it back to [`UsageTracker::end`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsageKey(u64);

/// Rolling record of when leases were open
#[derive(Debug)]
pub struct UsageTracker {
    epoch: Instant,
    last: AtomicU64,
    retention: Duration,
    spans: Mutex<BTreeMap<u64, Option<u64>>>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    /// Tracker keeping 30 minutes of history
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Tracker keeping `retention` of history for closed spans
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
            retention,
            spans: Mutex::new(BTreeMap::new()),
        }
    }

    /// Next timestamp, strictly greater than every one handed out before
    fn tick(&self) -> u64 {
        let now = self.epoch.elapsed().as_micros() as u64;
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Record that a lease opened now
    pub fn begin(&self) -> UsageKey {
        let start = self.tick();
        self.spans.lock().insert(start, None);
        UsageKey(start)
    }

    /// Record that the lease identified by `key` closed now
    pub fn end(&self, key: UsageKey) {
        let end = self.tick();
        let horizon = end.saturating_sub(self.retention.as_micros() as u64);
        let mut spans = self.spans.lock();
        if let Some(slot) = spans.get_mut(&key.0) {
            *slot = Some(end);
        }
        spans.retain(|_, stop| stop.map_or(true, |stop| stop >= horizon));
    }

    /// Number of spans still open
    pub fn open_spans(&self) -> usize {
        self.spans.lock().values().filter(|end| end.is_none()).count()
    }

    /// Fraction of each trailing window covered by leases, summed over leases
    pub fn ratios(&self, windows: &[Duration]) -> Vec<f64> {
        let now = self.tick();
        let spans: Vec<(u64, Option<u64>)> = self
            .spans
            .lock()
            .iter()
            .map(|(start, end)| (*start, *end))
            .collect();
        let windows: Vec<u64> = windows.iter().map(|w| w.as_micros() as u64).collect();
        ratios_at(&spans, now, &windows)
    }
}

/// Usage ratios for `spans` observed at `now`
///
/// Each span contributes its overlap with `[now - window, now]`; an open span
/// (`None` end) runs until `now`. Overlapping spans add up, so the result can
/// exceed 1.0. A zero-length window reports 0.0.
pub fn ratios_at(spans: &[(u64, Option<u64>)], now: u64, windows: &[u64]) -> Vec<f64> {
    windows
        .iter()
        .map(|&window| {
            if window == 0 {
                return 0.0;
            }
            let from = now.saturating_sub(window);
            let covered: u64 = spans
                .iter()
                .map(|&(start, end)| {
                    let end = end.unwrap_or(now).min(now);
                    let start = start.max(from);
                    end.saturating_sub(start)
                })
                .sum();
            covered as f64 / window as f64
        })
        .collect()
}
