//! Tollgate - Distributed Admission Control
//!
//! This crate implements rate limiting and circuit breaking whose state is
//! shared by every replica of a service through an external key-value store.
//! Replicas enforce one global limit and one global trip decision; every
//! decision is a single atomic transaction against the store, so concurrent
//! replicas never lose each other's updates.

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod ratelimit;
pub mod registry;
pub mod store;

pub use breaker::{CircuitBreaker, CircuitState, SamplingBreaker};
pub use error::{Result, StoreError, TollgateError};
pub use policy::{Policy, PolicyError};
pub use ratelimit::{AdmissionDriver, LeakyBucketDriver, SlidingWindowCounterDriver};
pub use registry::Registry;
pub use store::{MemoryStore, SharedStore, StateStore};
