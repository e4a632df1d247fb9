//! Admission driver trait shared by every rate limiting strategy.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;

/// Limiter state observed while making a decision, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterSnapshot {
    SlidingWindow {
        previous_count: u64,
        current_count: u64,
        current_window_start: i64,
        /// Weighted occupancy of the rolling interval.
        estimated: f64,
    },
    LeakyBucket {
        level: f64,
        last_leak_at: i64,
    },
}

impl fmt::Display for LimiterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterSnapshot::SlidingWindow {
                previous_count,
                current_count,
                current_window_start,
                estimated,
            } => write!(
                f,
                "sliding window at {}: previous={}, current={}, estimated={:.2}",
                current_window_start, previous_count, current_count, estimated
            ),
            LimiterSnapshot::LeakyBucket { level, last_leak_at } => {
                write!(f, "leaky bucket: level={:.2}, last leak at {}", level, last_leak_at)
            }
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub admitted: bool,
    /// State after the decision was applied.
    pub snapshot: LimiterSnapshot,
}

/// Decides admit/reject for one named limiter.
///
/// Both the sliding-window counter and the leaky bucket implement this, so
/// the [`Policy`](crate::policy::Policy) wrapper never needs to know which
/// strategy backs a limiter.
#[async_trait]
pub trait AdmissionDriver: Send + Sync {
    /// Limiter identity shared by every replica.
    fn hash(&self) -> &str;

    /// Decide whether one call may proceed, consuming capacity if it may.
    async fn admit(&self) -> Result<Admission, StoreError>;

    /// Read the current limiter state without consuming capacity.
    async fn snapshot(&self) -> Result<LimiterSnapshot, StoreError>;
}
