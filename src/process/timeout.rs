//! Mapping a request's token budget to a wall-clock execution timeout.
//!
//! Response size only loosely predicts runtime, so the mapping is a policy
//! object rather than a fixed formula.

use std::fmt::Debug;
use std::time::Duration;

/// Decides how long an execution may run.
pub trait TimeoutPolicy: Send + Sync + Debug {
    /// Timeout for a request that may produce up to `max_tokens` tokens.
    fn timeout_for(&self, max_tokens: Option<u32>) -> Duration;
}

/// Same timeout regardless of the token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTimeout(pub Duration);

impl TimeoutPolicy for FixedTimeout {
    fn timeout_for(&self, _max_tokens: Option<u32>) -> Duration {
        self.0
    }
}

/// `base + per_thousand_tokens * (max_tokens / 1000)`, clamped to `max`.
///
/// Requests without a budget get `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenScaledTimeout {
    /// Floor applied to every request.
    pub base: Duration,
    /// Extra time granted per thousand tokens.
    pub per_thousand_tokens: Duration,
    /// Ceiling.
    pub max: Duration,
}

impl TimeoutPolicy for TokenScaledTimeout {
    fn timeout_for(&self, max_tokens: Option<u32>) -> Duration {
        let Some(tokens) = max_tokens else {
            return self.base.min(self.max);
        };
        let scaled = self
            .per_thousand_tokens
            .mul_f64(f64::from(tokens) / 1000.0);
        self.base.saturating_add(scaled).min(self.max)
    }
}
