//! Leaky-bucket driver.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::driver::{Admission, AdmissionDriver, LimiterSnapshot};
use super::window::LeakyBucketState;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError, TollgateError};
use crate::store::{SharedStore, StateKind};

/// Construction options for a [`LeakyBucketDriver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketOptions {
    /// Limiter identity shared by every replica.
    pub hash: String,
    /// Maximum queued units. Zero rejects every call.
    pub bucket_size: f64,
    /// Units drained per second.
    pub fill_rate: f64,
}

/// Admits bursts up to `bucket_size`, draining at a steady `fill_rate`.
pub struct LeakyBucketDriver {
    options: LeakyBucketOptions,
    key: String,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketDriver {
    pub fn new(options: LeakyBucketOptions, store: SharedStore) -> Result<Self> {
        for (name, value) in [
            ("bucket_size", options.bucket_size),
            ("fill_rate", options.fill_rate),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(TollgateError::Config(format!(
                    "leaky bucket {}: {} must be a non-negative number, got {}",
                    options.hash, name, value
                )));
            }
        }

        let key = store.key(StateKind::LeakyBucket, &options.hash);
        Ok(Self {
            options,
            key,
            store,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &LeakyBucketOptions {
        &self.options
    }
}

fn snapshot_of(state: &LeakyBucketState) -> LimiterSnapshot {
    LimiterSnapshot::LeakyBucket {
        level: state.level,
        last_leak_at: state.last_leak_at,
    }
}

#[async_trait]
impl AdmissionDriver for LeakyBucketDriver {
    fn hash(&self) -> &str {
        &self.options.hash
    }

    async fn admit(&self) -> std::result::Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let bucket_size = self.options.bucket_size;
        let fill_rate = self.options.fill_rate;

        let admission = self
            .store
            .transact(&self.key, |state: Option<LeakyBucketState>| {
                let mut state = state
                    .unwrap_or_else(|| LeakyBucketState::empty(now))
                    .leak(now, fill_rate);

                let admitted = state.has_room(bucket_size);
                if admitted {
                    state.level += 1.0;
                }

                let snapshot = snapshot_of(&state);
                (state, Admission { admitted, snapshot })
            })
            .await?;

        trace!(
            hash = %self.options.hash,
            admitted = admission.admitted,
            snapshot = %admission.snapshot,
            "Checked leaky bucket"
        );
        if !admission.admitted {
            debug!(
                hash = %self.options.hash,
                bucket_size = self.options.bucket_size,
                "Leaky bucket is full"
            );
        }

        Ok(admission)
    }

    async fn snapshot(&self) -> std::result::Result<LimiterSnapshot, StoreError> {
        let now = self.clock.now_ms();
        let state = self
            .store
            .load::<LeakyBucketState>(&self.key)
            .await?
            .unwrap_or_else(|| LeakyBucketState::empty(now))
            .leak(now, self.options.fill_rate);
        Ok(snapshot_of(&state))
    }
}
