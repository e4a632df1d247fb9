//! In-process store backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::StateStore;
use crate::error::StoreError;

/// A [`StateStore`] held in process memory.
///
/// Compare-and-swap runs under the map's per-shard lock, so it is
/// linearizable for any number of concurrent tasks. Latency and outages can
/// be injected to exercise the timeout and fault paths.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
    latency: RwLock<Option<Duration>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            latency: RwLock::new(None),
            available: AtomicBool::new(true),
        }
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter().await?;
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.enter().await?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, StoreError> {
        self.enter().await?;

        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let matches = expected == Some(entry.get().as_str());
                if matches {
                    entry.insert(new);
                }
                matches
            }
            Entry::Vacant(entry) => {
                if expected.is_none() {
                    entry.insert(new);
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }
}
