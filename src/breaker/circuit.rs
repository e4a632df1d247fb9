//! Closed/Open/HalfOpen state machine shared across replicas.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::sampler::{SamplingBreaker, SamplingBreakerOptions};
use super::state::CircuitState;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::store::{SharedStore, StateKind};

/// Default cool-down before an open circuit lets a probe through.
pub const DEFAULT_HALF_OPEN_AFTER_MS: u64 = 10_000;

/// Construction options for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    pub name: String,
    #[serde(flatten)]
    pub sampling: SamplingBreakerOptions,
    /// Cool-down between opening and admitting a half-open probe.
    #[serde(default = "default_half_open_after_ms")]
    pub half_open_after_ms: u64,
}

fn default_half_open_after_ms() -> u64 {
    DEFAULT_HALF_OPEN_AFTER_MS
}

/// Stored circuit document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    /// When the circuit last opened.
    pub opened_at: Option<i64>,
    /// When the current half-open probe was admitted.
    pub probe_started_at: Option<i64>,
    /// Number of probes ever admitted; identifies the current one.
    #[serde(default)]
    pub probes: u64,
}

impl CircuitRecord {
    fn holds_probe(&self, probe: u64) -> bool {
        self.state == CircuitState::HalfOpen && self.probes == probe
    }

    fn opened(self, now: i64) -> Self {
        Self {
            state: CircuitState::Open,
            opened_at: Some(now),
            probe_started_at: None,
            probes: self.probes,
        }
    }

    fn closed(self) -> Self {
        Self {
            probes: self.probes,
            ..Self::default()
        }
    }

    fn admit_probe(mut self, now: i64) -> (Self, Permit) {
        self.state = CircuitState::HalfOpen;
        self.probe_started_at = Some(now);
        self.probes += 1;
        let permit = Permit {
            state: CircuitState::HalfOpen,
            probe: Some(self.probes),
        };
        (self, permit)
    }
}

/// Leave to run one call, handed back when its outcome is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    state: CircuitState,
    probe: Option<u64>,
}

impl Permit {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            probe: None,
        }
    }

    /// State of the circuit when the call was admitted.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

/// Result of asking the circuit whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The call may run; its outcome must be reported with this permit.
    Granted(Permit),
    /// The circuit is open, or another replica holds the half-open probe.
    Rejected,
}

/// A circuit breaker whose state lives in the shared store.
///
/// The Open to HalfOpen transition has no background timer: the stored
/// `opened_at` is compared against the cool-down on the next call.
///
/// Each half-open probe carries a number. A probe that was superseded, or
/// whose circuit has moved on, reports as an ordinary closed-circuit call.
pub struct CircuitBreaker {
    name: String,
    half_open_after_ms: i64,
    sampler: SamplingBreaker,
    key: String,
    store: SharedStore,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(options: &CircuitBreakerOptions, store: SharedStore) -> Result<Self> {
        let sampler = SamplingBreaker::new(&options.name, &options.sampling, store.clone())?;
        Ok(Self {
            name: options.name.clone(),
            half_open_after_ms: options.half_open_after_ms as i64,
            sampler,
            key: store.key(StateKind::Circuit, &options.name),
            store,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the wall clock of the breaker and its sampler.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.sampler = self.sampler.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sampler(&self) -> &SamplingBreaker {
        &self.sampler
    }

    /// Current stored state.
    pub async fn state(&self) -> std::result::Result<CircuitState, StoreError> {
        let record = self.store.load::<CircuitRecord>(&self.key).await?;
        Ok(record.unwrap_or_default().state)
    }

    /// Ask whether a call may proceed, moving Open to HalfOpen once the
    /// cool-down has elapsed. Exactly one replica wins the probe.
    pub async fn acquire(&self) -> std::result::Result<Acquisition, StoreError> {
        let now = self.clock.now_ms();
        let cool_down = self.half_open_after_ms;

        let (acquisition, transitioned) = self
            .store
            .transact(&self.key, |record: Option<CircuitRecord>| {
                let record = record.unwrap_or_default();
                match record.state {
                    CircuitState::Closed => {
                        (record, (Acquisition::Granted(Permit::closed()), false))
                    }
                    CircuitState::Open => {
                        let opened_at = record.opened_at.unwrap_or(i64::MIN);
                        if now.saturating_sub(opened_at) >= cool_down {
                            let (record, permit) = record.admit_probe(now);
                            (record, (Acquisition::Granted(permit), true))
                        } else {
                            (record, (Acquisition::Rejected, false))
                        }
                    }
                    CircuitState::HalfOpen => {
                        // A probe that never reported back is superseded
                        let probe_started_at = record.probe_started_at.unwrap_or(i64::MIN);
                        if now.saturating_sub(probe_started_at) >= cool_down {
                            let (record, permit) = record.admit_probe(now);
                            (record, (Acquisition::Granted(permit), false))
                        } else {
                            (record, (Acquisition::Rejected, false))
                        }
                    }
                }
            })
            .await?;

        if transitioned {
            info!(breaker = %self.name, "Circuit half-open, admitting probe");
        }
        if acquisition == Acquisition::Rejected {
            debug!(breaker = %self.name, "Circuit rejected call");
        }
        Ok(acquisition)
    }

    /// Report a successful call admitted under `permit`.
    pub async fn record_success(&self, permit: Permit) -> std::result::Result<(), StoreError> {
        if let Some(probe) = permit.probe {
            let closed = self
                .store
                .transact(&self.key, |record: Option<CircuitRecord>| {
                    let record = record.unwrap_or_default();
                    if record.holds_probe(probe) {
                        (record.closed(), true)
                    } else {
                        (record, false)
                    }
                })
                .await?;

            if closed {
                self.sampler.success(CircuitState::HalfOpen).await?;
                info!(breaker = %self.name, "Probe succeeded, circuit closed");
                return Ok(());
            }
            debug!(breaker = %self.name, probe, "Superseded probe succeeded");
        }

        self.sampler.success(CircuitState::Closed).await
    }

    /// Report a failed call admitted under `permit`. Returns whether the
    /// circuit is open afterwards.
    pub async fn record_failure(&self, permit: Permit) -> std::result::Result<bool, StoreError> {
        let now = self.clock.now_ms();

        if let Some(probe) = permit.probe {
            let reopened = self
                .store
                .transact(&self.key, |record: Option<CircuitRecord>| {
                    let record = record.unwrap_or_default();
                    if record.holds_probe(probe) {
                        (record.opened(now), true)
                    } else {
                        (record, false)
                    }
                })
                .await?;

            if reopened {
                self.sampler.failure(CircuitState::HalfOpen).await?;
                warn!(breaker = %self.name, "Probe failed, circuit re-opened");
                return Ok(true);
            }
            debug!(breaker = %self.name, probe, "Superseded probe failed");
        }

        if !self.sampler.failure(CircuitState::Closed).await? {
            return Ok(false);
        }

        let (opened, state) = self
            .store
            .transact(&self.key, |record: Option<CircuitRecord>| {
                let record = record.unwrap_or_default();
                match record.state {
                    CircuitState::Closed => {
                        let record = record.opened(now);
                        (record, (true, record.state))
                    }
                    // Open keeps its first opening time; HalfOpen waits on its probe
                    state => (record, (false, state)),
                }
            })
            .await?;

        if opened {
            warn!(breaker = %self.name, "Failure threshold exceeded, circuit opened");
        }
        Ok(state == CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreSettings};
    use std::time::Duration;

    fn shared_store() -> SharedStore {
        SharedStore::with_settings(
            Arc::new(MemoryStore::new()),
            StoreSettings {
                max_attempts: 1_000,
                ..StoreSettings::default()
            },
        )
    }

    fn options() -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            name: "payments".to_string(),
            sampling: SamplingBreakerOptions {
                threshold: 0.5,
                duration_ms: 10_000,
                minimum_rps: Some(0.5),
            },
            half_open_after_ms: 5_000,
        }
    }

    fn breaker(store: &SharedStore, clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(&options(), store.clone())
            .unwrap()
            .with_clock(clock.clone())
    }

    /// Drive a closed breaker open: five failures clear the 5-sample floor.
    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            let permit = match breaker.acquire().await.unwrap() {
                Acquisition::Granted(permit) => permit,
                Acquisition::Rejected => return,
            };
            breaker.record_failure(permit).await.unwrap();
        }
    }

    async fn probe(breaker: &CircuitBreaker) -> Permit {
        match breaker.acquire().await.unwrap() {
            Acquisition::Granted(permit) if permit.is_probe() => permit,
            other => panic!("expected a probe, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        assert_eq!(
            breaker.acquire().await.unwrap(),
            Acquisition::Granted(Permit::closed())
        );
    }

    #[tokio::test]
    async fn test_opens_and_rejects() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        trip(&breaker).await;
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert_eq!(breaker.acquire().await.unwrap(), Acquisition::Rejected);

        clock.advance(Duration::from_millis(4_999));
        assert_eq!(breaker.acquire().await.unwrap(), Acquisition::Rejected);
    }

    #[tokio::test]
    async fn test_single_probe_after_cool_down() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let replica_a = breaker(&store, &clock);
        let replica_b = breaker(&store, &clock);

        trip(&replica_a).await;
        clock.advance(Duration::from_secs(5));

        let permit = probe(&replica_a).await;
        assert_eq!(permit.state(), CircuitState::HalfOpen);
        assert_eq!(replica_b.acquire().await.unwrap(), Acquisition::Rejected);
        assert_eq!(replica_b.state().await.unwrap(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_probe_success_closes() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        trip(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let permit = probe(&breaker).await;
        breaker.record_success(permit).await.unwrap();

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        let sampled = breaker.sampler().state().await.unwrap();
        assert_eq!(sampled.current_failures, 0);
        assert_eq!(sampled.current_successes, 1);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        trip(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let permit = probe(&breaker).await;
        assert!(breaker.record_failure(permit).await.unwrap());

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        // The cool-down restarts from the failed probe
        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.acquire().await.unwrap(), Acquisition::Rejected);
    }

    #[tokio::test]
    async fn test_stalled_probe_is_superseded() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        trip(&breaker).await;
        clock.advance(Duration::from_secs(5));
        assert!(matches!(breaker.acquire().await.unwrap(), Acquisition::Granted(_)));
        assert_eq!(breaker.acquire().await.unwrap(), Acquisition::Rejected);

        clock.advance(Duration::from_secs(5));
        let permit = probe(&breaker).await;
        assert_eq!(permit.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_superseded_probe_failure_leaves_closed_circuit() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        trip(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let stalled = probe(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let current = probe(&breaker).await;
        assert_ne!(stalled, current);

        breaker.record_success(current).await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);

        // Counted as one closed-circuit failure, below the volume floor
        assert!(!breaker.record_failure(stalled).await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        let sampled = breaker.sampler().state().await.unwrap();
        assert_eq!(sampled.current_failures, 1);
        assert_eq!(sampled.current_successes, 1);
    }

    #[tokio::test]
    async fn test_superseded_probe_success_keeps_history() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        trip(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let stalled = probe(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let current = probe(&breaker).await;

        assert!(breaker.record_failure(current).await.unwrap());
        breaker.record_success(stalled).await.unwrap();

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        let sampled = breaker.sampler().state().await.unwrap();
        assert_eq!(sampled.current_failures, 1);
        assert_eq!(sampled.current_successes, 1);
    }

    #[tokio::test]
    async fn test_closed_failure_does_not_end_probe() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        let closed = match breaker.acquire().await.unwrap() {
            Acquisition::Granted(permit) => permit,
            Acquisition::Rejected => panic!("closed circuit should admit"),
        };
        trip(&breaker).await;
        clock.advance(Duration::from_secs(5));
        let permit = probe(&breaker).await;

        // A late report from before the trip; the probe still decides
        assert!(!breaker.record_failure(closed).await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);

        breaker.record_success(permit).await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_successes_under_threshold_stay_closed() {
        let store = shared_store();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = breaker(&store, &clock);

        for _ in 0..10 {
            breaker.record_success(Permit::closed()).await.unwrap();
        }
        for _ in 0..5 {
            assert!(!breaker.record_failure(Permit::closed()).await.unwrap());
        }
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }
}
