//! Window arithmetic for the admission drivers.
//!
//! Pure functions over timestamps (epoch milliseconds) and counters. The
//! drivers run these inside a store transaction.

use serde::{Deserialize, Serialize};

/// Start of the fixed window of length `interval_ms` containing `now`.
pub fn window_start(now: i64, interval_ms: i64) -> i64 {
    now - now.rem_euclid(interval_ms)
}

/// Stored state of one sliding-window counter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    /// Requests admitted in the window before `current_window_start`.
    pub previous_count: u64,
    /// Requests admitted since `current_window_start`.
    pub current_count: u64,
    pub current_window_start: i64,
}

impl SlidingWindowState {
    /// A fresh counter whose previous window is empty.
    pub fn starting_at(window_start: i64) -> Self {
        Self {
            previous_count: 0,
            current_count: 0,
            current_window_start: window_start,
        }
    }

    /// Move the fixed windows forward so that `now` falls in the current one.
    ///
    /// Crossing exactly one boundary shifts the current count into the
    /// previous slot. Skipping further means every skipped window was empty.
    pub fn roll_forward(self, now: i64, interval_ms: i64) -> Self {
        let start = window_start(now, interval_ms);
        if start <= self.current_window_start {
            return self;
        }

        let previous_count = if start - self.current_window_start == interval_ms {
            self.current_count
        } else {
            0
        };

        Self {
            previous_count,
            current_count: 0,
            current_window_start: start,
        }
    }

    /// Weighted occupancy of the rolling interval ending at `now`.
    pub fn estimate(&self, now: i64, interval_ms: i64) -> f64 {
        let elapsed = (now - self.current_window_start) as f64;
        let overlap = (1.0 - elapsed / interval_ms as f64).clamp(0.0, 1.0);
        self.current_count as f64 + self.previous_count as f64 * overlap
    }
}

/// Stored state of one leaky bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    /// Units currently queued in the bucket.
    pub level: f64,
    pub last_leak_at: i64,
}

impl LeakyBucketState {
    pub fn empty(now: i64) -> Self {
        Self {
            level: 0.0,
            last_leak_at: now,
        }
    }

    /// Drain whatever leaked out between `last_leak_at` and `now`.
    ///
    /// `fill_rate` is in units per second. A timestamp older than
    /// `last_leak_at` (a replica with a lagging clock) drains nothing.
    pub fn leak(self, now: i64, fill_rate: f64) -> Self {
        let elapsed_secs = (now - self.last_leak_at).max(0) as f64 / 1000.0;
        Self {
            level: (self.level - elapsed_secs * fill_rate).max(0.0),
            last_leak_at: self.last_leak_at.max(now),
        }
    }

    /// Whether one more unit fits into a bucket of `bucket_size`.
    pub fn has_room(&self, bucket_size: f64) -> bool {
        self.level + 1.0 <= bucket_size
    }
}
