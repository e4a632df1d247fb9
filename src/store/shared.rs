//! Atomic document transactions over a [`StateStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use super::{StateKey, StateKind, StateStore};
use crate::error::StoreError;

/// Tuning for store access.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Namespace for every key this deployment writes.
    pub key_prefix: String,
    /// Upper bound for a single store round trip.
    pub timeout: Duration,
    /// Compare-and-swap attempts before giving up with a conflict.
    pub max_attempts: u32,
    /// Base delay between conflicting attempts; jittered up to 2x.
    pub backoff: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate".to_string(),
            timeout: Duration::from_millis(250),
            max_attempts: 32,
            backoff: Duration::from_millis(1),
        }
    }
}

/// Handle to the shared store used by every driver and breaker.
///
/// All state changes go through [`SharedStore::transact`], which reads a
/// whole JSON document, computes the successor state and publishes it with
/// compare-and-swap. A lost race re-reads and recomputes, so concurrent
/// replicas can never lose each other's updates.
#[derive(Clone)]
pub struct SharedStore {
    store: Arc<dyn StateStore>,
    settings: StoreSettings,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("settings", &self.settings)
            .finish()
    }
}

impl SharedStore {
    /// Wrap a backend with default settings.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_settings(store, StoreSettings::default())
    }

    pub fn with_settings(store: Arc<dyn StateStore>, settings: StoreSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Build the store key for a document of `kind` named `name`.
    pub fn key(&self, kind: StateKind, name: &str) -> String {
        StateKey::new(&self.settings.key_prefix, kind, name).to_store_key()
    }

    /// Read and decode the document under `key`.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw = self.bounded(key, self.store.get(key)).await?;
        raw.as_deref().map(|raw| decode(key, raw)).transpose()
    }

    /// Atomically update the document under `key`.
    ///
    /// `apply` receives the current document (`None` if absent) and returns
    /// the successor document plus a value handed back to the caller. It may
    /// run several times if other writers race us, so it must be pure.
    pub async fn transact<T, R, F>(&self, key: &str, mut apply: F) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Send,
        R: Send,
        F: FnMut(Option<T>) -> (T, R) + Send,
    {
        for attempt in 1..=self.settings.max_attempts {
            let raw = self.bounded(key, self.store.get(key)).await?;
            let current = raw.as_deref().map(|raw| decode(key, raw)).transpose()?;

            let (next, output) = apply(current);
            let encoded = encode(key, &next)?;

            // Nothing changed: the read itself is the linearization point.
            if raw.as_deref() == Some(encoded.as_str()) {
                return Ok(output);
            }

            let swapped = self
                .bounded(key, self.store.compare_and_swap(key, raw.as_deref(), encoded))
                .await?;
            if swapped {
                trace!(key = %key, attempt, "Transaction committed");
                return Ok(output);
            }

            trace!(key = %key, attempt, "Compare-and-swap conflict, retrying");
            let delay = self.jittered_backoff();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        warn!(
            key = %key,
            attempts = self.settings.max_attempts,
            "Giving up on contended transaction"
        );
        Err(StoreError::Conflict {
            key: key.to_string(),
            attempts: self.settings.max_attempts,
        })
    }

    async fn bounded<O, Fut>(&self, key: &str, call: Fut) -> Result<O, StoreError>
    where
        Fut: Future<Output = Result<O, StoreError>>,
    {
        match tokio::time::timeout(self.settings.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, timeout = ?self.settings.timeout, "Store call timed out");
                Err(StoreError::Timeout {
                    key: key.to_string(),
                    timeout: self.settings.timeout,
                })
            }
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let base = self.settings.backoff.as_micros() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_micros(base + jitter)
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}
