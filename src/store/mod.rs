//! Shared state store.
//!
//! The store is the single source of truth for every limiter and breaker.
//! Backends only need plain string get/set plus a conditional write; the
//! [`SharedStore`] layer turns that into atomic read-compute-write
//! transactions over JSON documents.

mod key;
mod memory;
mod shared;

use async_trait::async_trait;

use crate::error::StoreError;

pub use key::{StateKey, StateKind};
pub use memory::MemoryStore;
pub use shared::{SharedStore, StoreSettings};

/// Contract a key-value backend must satisfy.
///
/// Implementations must make `compare_and_swap` linearizable per key: it
/// writes `new` only if the value currently stored equals `expected`
/// (`None` meaning "absent") and reports whether the write happened.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the raw value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally store `value` under `key`.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Conditionally replace the value under `key`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: String,
    ) -> Result<bool, StoreError>;
}
