//! Failure-rate sampling over a ring of time windows.
//!
//! The whole ring, the cursor and the running totals are one JSON document
//! under one store key, and every change to it happens inside a single
//! [`SharedStore::transact`] call. That is what keeps
//! `current_failures == Σ windows[i].failures` true across replicas.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::state::CircuitState;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError, TollgateError};
use crate::store::{SharedStore, StateKind};

const MIN_WINDOW_COUNT: u64 = 5;
const MAX_WINDOW_MS: u64 = 1_000;

/// One slice of the sampling ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub started_at: i64,
    pub successes: u64,
    pub failures: u64,
}

/// The outcome of one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Stored sampler document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerState {
    pub windows: Vec<Window>,
    pub window_size_ms: i64,
    pub duration_ms: i64,
    pub minimum_rpms: f64,
    pub current_window: usize,
    /// Running total of `windows[i].failures`.
    pub current_failures: u64,
    /// Running total of `windows[i].successes`.
    pub current_successes: u64,
}

impl SamplerState {
    pub fn new(window_count: usize, window_size_ms: i64, minimum_rpms: f64) -> Self {
        Self {
            windows: vec![Window::default(); window_count],
            window_size_ms,
            duration_ms: window_size_ms * window_count as i64,
            minimum_rpms,
            current_window: 0,
            current_failures: 0,
            current_successes: 0,
        }
    }

    /// Zero every window and both totals. The cursor stays where it is.
    pub fn reset(&mut self) {
        for window in &mut self.windows {
            *window = Window::default();
        }
        self.current_failures = 0;
        self.current_successes = 0;
    }

    /// Advance the ring if the current window has expired at `now`.
    ///
    /// Each slot the cursor moves onto ages out: its counts leave the
    /// running totals before it is zeroed and stamped with `now`. After an
    /// idle stretch every skipped slot is aged out, at most one full lap.
    /// Calling this again before the new window expires changes nothing.
    pub fn rotate(&mut self, now: i64) {
        let elapsed = now - self.windows[self.current_window].started_at;
        if elapsed < self.window_size_ms {
            return;
        }

        let len = self.windows.len();
        let steps = (elapsed / self.window_size_ms).min(len as i64) as usize;
        for _ in 0..steps {
            let next = (self.current_window + 1) % len;
            let aged = self.windows[next];
            self.current_failures = self.current_failures.saturating_sub(aged.failures);
            self.current_successes = self.current_successes.saturating_sub(aged.successes);
            self.windows[next] = Window {
                started_at: now,
                successes: 0,
                failures: 0,
            };
            self.current_window = next;
        }
    }

    /// Record one outcome in the current window, rotating first if stale.
    pub fn push(&mut self, now: i64, outcome: Outcome) {
        self.rotate(now);

        let window = &mut self.windows[self.current_window];
        match outcome {
            Outcome::Success => {
                window.successes += 1;
                self.current_successes += 1;
            }
            Outcome::Failure => {
                window.failures += 1;
                self.current_failures += 1;
            }
        }
    }

    /// Whether a closed circuit should open given the sampled outcomes.
    pub fn should_open(&self, threshold: f64) -> bool {
        let total = (self.current_successes + self.current_failures) as f64;

        // Rate check: `total / duration < minimum_rpms`, multiplied out
        if total < self.duration_ms as f64 * self.minimum_rpms {
            return false;
        }

        // `failures / total > threshold`, multiplied out
        self.current_failures as f64 > threshold * total
    }

    fn has_geometry(&self, window_count: usize, window_size_ms: i64, minimum_rpms: f64) -> bool {
        self.windows.len() == window_count
            && self.window_size_ms == window_size_ms
            && self.minimum_rpms == minimum_rpms
            && self.current_window < window_count
    }
}

/// Construction options for a [`SamplingBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingBreakerOptions {
    /// Fraction of failed calls, strictly between 0 and 1, above which the
    /// circuit opens.
    pub threshold: f64,
    /// Length of the sampling horizon in milliseconds.
    pub duration_ms: u64,
    /// Minimum throughput before the breaker may trip. Defaults to enough
    /// volume for five failures per second at `threshold`.
    #[serde(default)]
    pub minimum_rps: Option<f64>,
}

/// Decides when the failure ratio over the recent past warrants tripping.
pub struct SamplingBreaker {
    name: String,
    threshold: f64,
    window_count: usize,
    window_size_ms: i64,
    minimum_rpms: f64,
    key: String,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl SamplingBreaker {
    /// Validate `options` and derive the ring geometry.
    ///
    /// The ring has `max(5, ceil(duration / 1s))` windows of
    /// `round(duration / count)` ms each, so the sampled horizon is
    /// `window_size * count` and can differ from `duration_ms` by rounding.
    pub fn new(name: &str, options: &SamplingBreakerOptions, store: SharedStore) -> Result<Self> {
        let threshold = options.threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(TollgateError::ThresholdOutOfRange(threshold));
        }
        if options.duration_ms == 0 {
            return Err(TollgateError::Config(format!(
                "breaker {}: duration_ms must be greater than 0",
                name
            )));
        }

        let minimum_rpms = match options.minimum_rps {
            Some(rps) if rps.is_finite() && rps > 0.0 => rps / 1000.0,
            Some(rps) => {
                return Err(TollgateError::Config(format!(
                    "breaker {}: minimum_rps must be greater than 0, got {}",
                    name, rps
                )))
            }
            None => 5.0 / (threshold * 1000.0),
        };

        let window_count = MIN_WINDOW_COUNT.max(options.duration_ms.div_ceil(MAX_WINDOW_MS));
        let window_size_ms =
            ((options.duration_ms as f64 / window_count as f64).round() as i64).max(1);

        Ok(Self {
            name: name.to_string(),
            threshold,
            window_count: window_count as usize,
            window_size_ms,
            minimum_rpms,
            key: store.key(StateKind::Sampler, name),
            store,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window_count(&self) -> usize {
        self.window_count
    }

    pub fn window_size_ms(&self) -> i64 {
        self.window_size_ms
    }

    /// Effective sampling horizon.
    pub fn duration_ms(&self) -> i64 {
        self.window_size_ms * self.window_count as i64
    }

    pub fn minimum_rpms(&self) -> f64 {
        self.minimum_rpms
    }

    /// Record a successful call. A success while half-open wipes the history.
    pub async fn success(&self, state: CircuitState) -> std::result::Result<(), StoreError> {
        let now = self.clock.now_ms();
        self.store
            .transact(&self.key, |stored: Option<SamplerState>| {
                let mut sampler = self.current_or_fresh(stored);
                if state == CircuitState::HalfOpen {
                    sampler.reset();
                }
                sampler.push(now, Outcome::Success);
                (sampler, ())
            })
            .await?;

        trace!(breaker = %self.name, state = %state, "Recorded success");
        Ok(())
    }

    /// Record a failed call and report whether the circuit should open.
    ///
    /// Any failure while not fully closed keeps or re-opens the circuit.
    pub async fn failure(&self, state: CircuitState) -> std::result::Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let threshold = self.threshold;

        let (should_open, failures, total) = self
            .store
            .transact(&self.key, |stored: Option<SamplerState>| {
                let mut sampler = self.current_or_fresh(stored);
                sampler.push(now, Outcome::Failure);

                let should_open =
                    state != CircuitState::Closed || sampler.should_open(threshold);
                let failures = sampler.current_failures;
                let total = sampler.current_failures + sampler.current_successes;
                (sampler, (should_open, failures, total))
            })
            .await?;

        debug!(
            breaker = %self.name,
            state = %state,
            failures,
            total,
            should_open,
            "Recorded failure"
        );
        Ok(should_open)
    }

    /// Read the sampler document as it stands.
    pub async fn state(&self) -> std::result::Result<SamplerState, StoreError> {
        let stored = self.store.load::<SamplerState>(&self.key).await?;
        Ok(self.current_or_fresh(stored))
    }

    // A document written with a different geometry (the breaker was
    // reconfigured) cannot be reinterpreted, so sampling starts over.
    fn current_or_fresh(&self, stored: Option<SamplerState>) -> SamplerState {
        stored
            .filter(|s| s.has_geometry(self.window_count, self.window_size_ms, self.minimum_rpms))
            .unwrap_or_else(|| {
                SamplerState::new(self.window_count, self.window_size_ms, self.minimum_rpms)
            })
    }
}
