//! Guarded execution: admission, circuit check, outcome reporting.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::breaker::{Acquisition, CircuitBreaker};
use crate::config::StoreFailureMode;
use crate::error::{StoreError, TollgateError};
use crate::ratelimit::AdmissionDriver;

/// Why a guarded call did not produce a value.
#[derive(Error, Debug)]
pub enum PolicyError<E> {
    /// The policy refused to run the action, or could not decide.
    #[error(transparent)]
    Rejected(TollgateError),

    /// The action ran and failed; its error is passed through untouched.
    #[error("{0}")]
    Action(E),
}

impl<E> PolicyError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PolicyError::Rejected(TollgateError::RateLimitExceeded { .. }))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PolicyError::Rejected(TollgateError::CircuitOpen { .. }))
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, PolicyError::Rejected(TollgateError::Store(_)))
    }

    /// The action's own error, if the action is what failed.
    pub fn into_action_error(self) -> Option<E> {
        match self {
            PolicyError::Action(e) => Some(e),
            PolicyError::Rejected(_) => None,
        }
    }
}

/// Guards calls with an optional rate limiter and an optional circuit breaker.
#[derive(Clone, Default)]
pub struct Policy {
    limiter: Option<Arc<dyn AdmissionDriver>>,
    breaker: Option<Arc<CircuitBreaker>>,
    failure_mode: StoreFailureMode,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn AdmissionDriver>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: StoreFailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    fn limiter_hash(&self) -> &str {
        self.limiter.as_ref().map(|l| l.hash()).unwrap_or("-")
    }

    fn breaker_name(&self) -> &str {
        self.breaker.as_ref().map(|b| b.name()).unwrap_or("-")
    }

    /// Run `action` if the limiter admits it and the circuit allows it.
    ///
    /// Rejections happen before `action` is invoked. Once it runs, its
    /// outcome is reported to the breaker and its result is returned as is;
    /// a failure to record the outcome is logged, never surfaced in place of
    /// the action's result.
    #[instrument(
        skip(self, action),
        fields(limiter = %self.limiter_hash(), breaker = %self.breaker_name())
    )]
    pub async fn execute<T, E, F, Fut>(&self, action: F) -> Result<T, PolicyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(limiter) = &self.limiter {
            match limiter.admit().await {
                Ok(admission) if admission.admitted => {}
                Ok(admission) => {
                    return Err(PolicyError::Rejected(TollgateError::RateLimitExceeded {
                        hash: limiter.hash().to_string(),
                        snapshot: admission.snapshot,
                    }));
                }
                Err(error) => self.on_store_fault(error)?,
            }
        }

        let mut granted = None;
        if let Some(breaker) = &self.breaker {
            match breaker.acquire().await {
                Ok(Acquisition::Granted(permit)) => {
                    if permit.is_probe() {
                        debug!(
                            breaker = %breaker.name(),
                            state = %permit.state(),
                            "Running probe call"
                        );
                    }
                    granted = Some((breaker, permit));
                }
                Ok(Acquisition::Rejected) => {
                    return Err(PolicyError::Rejected(TollgateError::CircuitOpen {
                        name: breaker.name().to_string(),
                    }));
                }
                Err(error) => self.on_store_fault(error)?,
            }
        }

        let result = action().await;

        if let Some((breaker, permit)) = granted {
            let recorded = match &result {
                Ok(_) => breaker.record_success(permit).await,
                Err(_) => breaker.record_failure(permit).await.map(|_| ()),
            };
            if let Err(error) = recorded {
                warn!(breaker = %breaker.name(), error = %error, "Failed to record call outcome");
            }
        }

        result.map_err(PolicyError::Action)
    }

    fn on_store_fault<E>(&self, error: StoreError) -> Result<(), PolicyError<E>> {
        match self.failure_mode {
            StoreFailureMode::FailOpen => {
                warn!(error = %error, "Store fault, failing open");
                Ok(())
            }
            StoreFailureMode::FailClosed => {
                debug!(error = %error, "Store fault, failing closed");
                Err(PolicyError::Rejected(TollgateError::Store(error)))
            }
        }
    }
}
