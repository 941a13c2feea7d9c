//! Outcome classification for opacity micromap cache operations.
//!
//! Per-item bake and build steps report one of a small set of outcomes that
//! the manager maps onto cache state transitions. Only a permanent failure
//! removes an item; every other non-success outcome leaves it in place to be
//! retried on a later frame.

use std::fmt;

/// Result of processing a single opacity micromap cache item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OmmResult {
    /// The step completed (possibly partially, for resumable bakes).
    Success,
    /// Permanent failure. The item is destroyed and its source hash
    /// black-listed so it is never re-admitted.
    Failure,
    /// A device allocation failed. The item stays put and is retried once
    /// memory frees up.
    OutOfMemory,
    /// The cache budget cannot currently fit the item. Not a fault of the
    /// item itself; retried after eviction or a budget increase.
    OutOfBudget,
    /// Required inputs (textures, source geometry, a live instance) are not
    /// available this frame. Retried when they reappear.
    DependenciesUnavailable,
}

impl OmmResult {
    /// True for every outcome that leaves the item in the cache for a
    /// later retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            OmmResult::OutOfMemory | OmmResult::OutOfBudget | OmmResult::DependenciesUnavailable
        )
    }
}

impl fmt::Display for OmmResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OmmResult::Success => "success",
            OmmResult::Failure => "failure",
            OmmResult::OutOfMemory => "out of memory",
            OmmResult::OutOfBudget => "out of budget",
            OmmResult::DependenciesUnavailable => "dependencies unavailable",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failure_and_success_are_terminal() {
        assert!(!OmmResult::Success.is_retryable());
        assert!(!OmmResult::Failure.is_retryable());
        assert!(OmmResult::OutOfMemory.is_retryable());
        assert!(OmmResult::OutOfBudget.is_retryable());
        assert!(OmmResult::DependenciesUnavailable.is_retryable());
    }
}
