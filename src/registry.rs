//! Named limiters and breakers built from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterOptions, StoreFailureMode, TollgateConfig};
use crate::error::{Result, TollgateError};
use crate::policy::Policy;
use crate::ratelimit::{AdmissionDriver, LeakyBucketDriver, SlidingWindowCounterDriver};
use crate::store::{SharedStore, StateStore, StoreSettings};

/// Every limiter and breaker of one deployment, sharing one store.
///
/// Drivers hold no counters of their own, so building a registry is cheap
/// and a restarted process resumes from whatever the store holds.
pub struct Registry {
    limiters: HashMap<String, Arc<dyn AdmissionDriver>>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    failure_mode: StoreFailureMode,
}

impl Registry {
    /// Build every configured limiter and breaker against `store`.
    pub fn from_config(config: &TollgateConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Like [`Registry::from_config`] with an explicit clock.
    pub fn with_clock(
        config: &TollgateConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let shared = SharedStore::with_settings(store, StoreSettings::from(&config.store));

        let mut limiters: HashMap<String, Arc<dyn AdmissionDriver>> = HashMap::new();
        for (hash, limiter) in &config.limiters {
            let driver: Arc<dyn AdmissionDriver> = match limiter.to_options(hash) {
                LimiterOptions::SlidingWindow(options) => Arc::new(
                    SlidingWindowCounterDriver::new(options, shared.clone())?
                        .with_clock(clock.clone()),
                ),
                LimiterOptions::LeakyBucket(options) => Arc::new(
                    LeakyBucketDriver::new(options, shared.clone())?.with_clock(clock.clone()),
                ),
            };
            debug!(hash = %hash, config = ?limiter, "Registered limiter");
            limiters.insert(hash.clone(), driver);
        }

        let mut breakers = HashMap::new();
        for (name, breaker) in &config.breakers {
            let circuit = CircuitBreaker::new(&breaker.to_options(name), shared.clone())?
                .with_clock(clock.clone());
            debug!(breaker = %name, config = ?breaker, "Registered circuit breaker");
            breakers.insert(name.clone(), Arc::new(circuit));
        }

        Ok(Self {
            limiters,
            breakers,
            failure_mode: config.store.failure_mode,
        })
    }

    pub fn limiter(&self, hash: &str) -> Option<Arc<dyn AdmissionDriver>> {
        self.limiters.get(hash).cloned()
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).cloned()
    }

    /// Build a policy guarding calls with the named limiter and/or breaker.
    pub fn policy(&self, limiter: Option<&str>, breaker: Option<&str>) -> Result<Policy> {
        let mut policy = Policy::new().with_failure_mode(self.failure_mode);

        if let Some(hash) = limiter {
            let driver = self
                .limiter(hash)
                .ok_or_else(|| TollgateError::Config(format!("unknown limiter {}", hash)))?;
            policy = policy.with_limiter(driver);
        }
        if let Some(name) = breaker {
            let circuit = self
                .breaker(name)
                .ok_or_else(|| TollgateError::Config(format!("unknown breaker {}", name)))?;
            policy = policy.with_circuit_breaker(circuit);
        }

        Ok(policy)
    }

    /// Get the number of registered limiters.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }

    /// Get the number of registered breakers.
    pub fn breaker_count(&self) -> usize {
        self.breakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const YAML: &str = r#"
limiters:
  api:
    algorithm: sliding_window
    max_window_request_count: 2
    interval_in_seconds: 1
  burst:
    algorithm: leaky_bucket
    bucket_size: 1
    fill_rate: 1
breakers:
  payments:
    threshold: 0.5
    duration_ms: 5000
"#;

    fn registry(store: Arc<MemoryStore>) -> Registry {
        let config = TollgateConfig::from_yaml(YAML).unwrap();
        Registry::with_clock(&config, store, Arc::new(ManualClock::new(1_000_000))).unwrap()
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert_eq!(registry.limiter_count(), 2);
        assert_eq!(registry.breaker_count(), 1);
        assert_eq!(registry.limiter("api").unwrap().hash(), "api");
        assert!(registry.limiter("missing").is_none());
        assert_eq!(
            registry.breaker("payments").unwrap().state().await.unwrap(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_limiters_are_independent() {
        let registry = registry(Arc::new(MemoryStore::new()));
        let api = registry.limiter("api").unwrap();
        let burst = registry.limiter("burst").unwrap();

        assert!(burst.admit().await.unwrap().admitted);
        assert!(!burst.admit().await.unwrap().admitted);

        assert!(api.admit().await.unwrap().admitted);
        assert!(api.admit().await.unwrap().admitted);
        assert!(!api.admit().await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_registries_share_store_state() {
        let store = Arc::new(MemoryStore::new());
        let first = registry(store.clone());
        let second = registry(store.clone());

        assert!(first.limiter("burst").unwrap().admit().await.unwrap().admitted);
        assert!(!second.limiter("burst").unwrap().admit().await.unwrap().admitted);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_policy_members() {
        let registry = registry(Arc::new(MemoryStore::new()));
        assert!(registry.policy(Some("api"), Some("payments")).is_ok());
        assert!(matches!(
            registry.policy(Some("nope"), None),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            registry.policy(None, Some("nope")),
            Err(TollgateError::Config(_))
        ));
    }
}
