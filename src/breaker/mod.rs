//! Circuit breaking over a shared failure-rate sampler.

mod circuit;
mod sampler;
mod state;

pub use circuit::{
    Acquisition, CircuitBreaker, CircuitBreakerOptions, CircuitRecord, Permit,
    DEFAULT_HALF_OPEN_AFTER_MS,
};
pub use sampler::{Outcome, SamplerState, SamplingBreaker, SamplingBreakerOptions, Window};
pub use state::CircuitState;
