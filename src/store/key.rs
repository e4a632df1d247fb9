//! Store key layout.

use std::fmt;

/// What kind of document lives under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    SlidingWindow,
    LeakyBucket,
    Sampler,
    Circuit,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::SlidingWindow => "sliding_window",
            StateKind::LeakyBucket => "leaky_bucket",
            StateKind::Sampler => "sampler",
            StateKind::Circuit => "circuit",
        }
    }
}

/// Key identifying one state document in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    /// Namespace shared by every replica of one deployment.
    pub prefix: String,
    pub kind: StateKind,
    /// Limiter hash or breaker name.
    pub name: String,
}

impl StateKey {
    pub fn new(prefix: &str, kind: StateKind, name: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            kind,
            name: name.to_string(),
        }
    }

    /// Convert to a store key string.
    /// Format: "{prefix}|{kind}|{name}"
    pub fn to_store_key(&self) -> String {
        format!("{}|{}|{}", self.prefix, self.kind.as_str(), self.name)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key() {
        let key = StateKey::new("tollgate", StateKind::SlidingWindow, "user:123");
        assert_eq!(key.to_store_key(), "tollgate|sliding_window|user:123");
        assert_eq!(key.to_string(), key.to_store_key());
    }

    #[test]
    fn test_state_key_kinds() {
        let key = |kind| StateKey::new("app", kind, "payments").to_store_key();
        assert_eq!(key(StateKind::LeakyBucket), "app|leaky_bucket|payments");
        assert_eq!(key(StateKind::Sampler), "app|sampler|payments");
        assert_eq!(key(StateKind::Circuit), "app|circuit|payments");
    }
}
