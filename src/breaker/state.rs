//! Circuit states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Externally observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls proceed and outcomes are sampled.
    #[default]
    Closed,
    /// Calls are rejected until the cool-down elapses.
    Open,
    /// A single probe call decides whether to close or re-open.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}
