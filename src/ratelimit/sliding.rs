//! Sliding-window counter driver.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::driver::{Admission, AdmissionDriver, LimiterSnapshot};
use super::window::{window_start, SlidingWindowState};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError, TollgateError};
use crate::store::{SharedStore, StateKind};

/// Construction options for a [`SlidingWindowCounterDriver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowOptions {
    /// Limiter identity shared by every replica.
    pub hash: String,
    /// Requests allowed per rolling interval.
    pub max_window_request_count: u64,
    /// Length of the rolling interval.
    pub interval_in_seconds: f64,
}

/// Bounds requests per rolling interval by blending the current fixed window
/// with the weighted tail of the previous one.
pub struct SlidingWindowCounterDriver {
    options: SlidingWindowOptions,
    interval_ms: i64,
    key: String,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowCounterDriver {
    /// Create a driver reading and writing its counters in `store`.
    pub fn new(options: SlidingWindowOptions, store: SharedStore) -> Result<Self> {
        if options.max_window_request_count == 0 {
            return Err(TollgateError::Config(format!(
                "sliding window {}: max_window_request_count must be greater than 0",
                options.hash
            )));
        }
        if !(options.interval_in_seconds.is_finite() && options.interval_in_seconds > 0.0) {
            return Err(TollgateError::Config(format!(
                "sliding window {}: interval_in_seconds must be greater than 0, got {}",
                options.hash, options.interval_in_seconds
            )));
        }

        let interval_ms = ((options.interval_in_seconds * 1000.0).round() as i64).max(1);
        let key = store.key(StateKind::SlidingWindow, &options.hash);

        Ok(Self {
            options,
            interval_ms,
            key,
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &SlidingWindowOptions {
        &self.options
    }
}

fn snapshot_of(state: &SlidingWindowState, estimated: f64) -> LimiterSnapshot {
    LimiterSnapshot::SlidingWindow {
        previous_count: state.previous_count,
        current_count: state.current_count,
        current_window_start: state.current_window_start,
        estimated,
    }
}

#[async_trait]
impl AdmissionDriver for SlidingWindowCounterDriver {
    fn hash(&self) -> &str {
        &self.options.hash
    }

    async fn admit(&self) -> std::result::Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let interval_ms = self.interval_ms;
        let limit = self.options.max_window_request_count as f64;

        let admission = self
            .store
            .transact(&self.key, |state: Option<SlidingWindowState>| {
                let mut state = match state {
                    Some(state) => state.roll_forward(now, interval_ms),
                    None => SlidingWindowState::starting_at(window_start(now, interval_ms)),
                };

                let estimated = state.estimate(now, interval_ms);
                let admitted = estimated < limit;
                if admitted {
                    state.current_count += 1;
                }

                let snapshot = snapshot_of(&state, estimated);
                (state, Admission { admitted, snapshot })
            })
            .await?;

        trace!(
            hash = %self.options.hash,
            admitted = admission.admitted,
            snapshot = %admission.snapshot,
            "Checked sliding window"
        );
        if !admission.admitted {
            debug!(
                hash = %self.options.hash,
                limit = self.options.max_window_request_count,
                "Sliding window limit exceeded"
            );
        }

        Ok(admission)
    }

    async fn snapshot(&self) -> std::result::Result<LimiterSnapshot, StoreError> {
        let now = self.clock.now_ms();
        let state = match self.store.load::<SlidingWindowState>(&self.key).await? {
            Some(state) => state.roll_forward(now, self.interval_ms),
            None => SlidingWindowState::starting_at(window_start(now, self.interval_ms)),
        };
        Ok(snapshot_of(&state, state.estimate(now, self.interval_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreSettings};
    use std::time::Duration;

    fn options(max: u64, interval_in_seconds: f64) -> SlidingWindowOptions {
        SlidingWindowOptions {
            hash: "abc".to_string(),
            max_window_request_count: max,
            interval_in_seconds,
        }
    }

    fn driver(store: &SharedStore, clock: &Arc<ManualClock>) -> SlidingWindowCounterDriver {
        SlidingWindowCounterDriver::new(options(5, 60.0), store.clone())
            .unwrap()
            .with_clock(clock.clone())
    }

    fn shared_store() -> SharedStore {
        SharedStore::with_settings(
            Arc::new(MemoryStore::new()),
            StoreSettings {
                max_attempts: 1_000,
                ..StoreSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_rejects_after_limit() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(120_000));
        let driver = driver(&store, &clock);

        for i in 1..=5 {
            let admission = driver.admit().await.unwrap();
            assert!(admission.admitted, "Request {} should be admitted", i);
        }

        let admission = driver.admit().await.unwrap();
        assert!(!admission.admitted);
        match admission.snapshot {
            LimiterSnapshot::SlidingWindow { current_count, estimated, .. } => {
                assert_eq!(current_count, 5);
                assert_eq!(estimated, 5.0);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_previous_window_decays() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(120_000));
        let driver = driver(&store, &clock);

        for _ in 0..5 {
            assert!(driver.admit().await.unwrap().admitted);
        }

        // On the boundary the previous window still weighs fully
        clock.set(180_000);
        assert!(!driver.admit().await.unwrap().admitted);

        // Once the previous window has fully decayed the limit frees up again
        clock.set(240_000);
        assert!(driver.admit().await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_partial_decay_admits_proportionally() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(120_000));
        let driver = driver(&store, &clock);

        for _ in 0..5 {
            assert!(driver.admit().await.unwrap().admitted);
        }

        // Halfway through the next window: 5 * 0.5 = 2.5 still in view
        clock.set(210_000);
        assert!(driver.admit().await.unwrap().admitted); // 2.5
        assert!(driver.admit().await.unwrap().admitted); // 3.5
        assert!(driver.admit().await.unwrap().admitted); // 4.5
        assert!(!driver.admit().await.unwrap().admitted); // 5.5
    }

    #[tokio::test]
    async fn test_replicas_share_one_limit() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(120_000));
        let replica_a = driver(&store, &clock);
        let replica_b = driver(&store, &clock);

        for _ in 0..3 {
            assert!(replica_a.admit().await.unwrap().admitted);
        }
        assert!(replica_b.admit().await.unwrap().admitted);
        assert!(replica_b.admit().await.unwrap().admitted);
        assert!(!replica_a.admit().await.unwrap().admitted);
        assert!(!replica_b.admit().await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_consume() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(120_000));
        let driver = driver(&store, &clock);

        driver.admit().await.unwrap();
        clock.advance(Duration::from_secs(1));

        for _ in 0..3 {
            let snapshot = driver.snapshot().await.unwrap();
            assert!(matches!(
                snapshot,
                LimiterSnapshot::SlidingWindow { current_count: 1, .. }
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(120_000));

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let driver = driver(&store, &clock);
                tokio::spawn(async move { driver.admit().await })
            })
            .collect();

        let mut admitted = 0;
        for result in futures::future::join_all(tasks).await {
            if result.unwrap().unwrap().admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_invalid_options() {
        let store = shared_store();
        assert!(matches!(
            SlidingWindowCounterDriver::new(options(0, 60.0), store.clone()),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            SlidingWindowCounterDriver::new(options(5, 0.0), store.clone()),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            SlidingWindowCounterDriver::new(options(5, f64::NAN), store),
            Err(TollgateError::Config(_))
        ));
    }
}
