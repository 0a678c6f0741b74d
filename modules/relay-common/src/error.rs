use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes shared across the pipeline. Every error a handler, the
/// store, or the platform client can produce maps into exactly one of these.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network or store blip. Retried with backoff.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Another attempt already owns this idempotency key. The loser waits
    /// for the winner's outcome instead of erroring.
    #[error("Idempotency conflict: {0}")]
    Conflict(String),

    /// Internal signal from the rate limiter. Causes suspension, never a
    /// user-visible failure.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Bad input. Terminal, surfaced to the caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad credentials or an unrecoverable protocol state. Terminal,
    /// never retried.
    #[error("Fatal protocol error: {0}")]
    FatalProtocol(String),

    /// No free store connection within the acquire timeout. Terminal for
    /// the attempt; the condition clears at the system level.
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
}

impl RelayError {
    /// Whether the retry layer may resubmit after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::TransientIo(_)
            | RelayError::Conflict(_)
            | RelayError::RateLimited(_)
            | RelayError::PoolExhausted(_) => true,
            RelayError::Validation(_) | RelayError::FatalProtocol(_) => false,
        }
    }

    /// The stable failure class recorded on a terminal Outcome.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RelayError::TransientIo(_) => FailureKind::TransientIo,
            RelayError::Conflict(_) => FailureKind::Conflict,
            RelayError::RateLimited(_) => FailureKind::RateLimited,
            RelayError::Validation(_) => FailureKind::Validation,
            RelayError::FatalProtocol(_) => FailureKind::FatalProtocol,
            RelayError::PoolExhausted(_) => FailureKind::PoolExhausted,
        }
    }
}

/// Stable, user-visible failure class. Serialized into the commands table
/// and the API response body, so names here are a wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientIo,
    Conflict,
    RateLimited,
    Validation,
    FatalProtocol,
    PoolExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientIo => "transient_io",
            FailureKind::Conflict => "conflict",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Validation => "validation",
            FailureKind::FatalProtocol => "fatal_protocol",
            FailureKind::PoolExhausted => "pool_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient_io" => Some(FailureKind::TransientIo),
            "conflict" => Some(FailureKind::Conflict),
            "rate_limited" => Some(FailureKind::RateLimited),
            "validation" => Some(FailureKind::Validation),
            "fatal_protocol" => Some(FailureKind::FatalProtocol),
            "pool_exhausted" => Some(FailureKind::PoolExhausted),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(RelayError::TransientIo("socket reset".into()).is_retryable());
        assert!(RelayError::Conflict("key taken".into()).is_retryable());
        assert!(RelayError::PoolExhausted("timed out".into()).is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!RelayError::Validation("bad payload".into()).is_retryable());
        assert!(!RelayError::FatalProtocol("bad token".into()).is_retryable());
    }

    #[test]
    fn failure_kind_round_trips_through_str() {
        for kind in [
            FailureKind::TransientIo,
            FailureKind::Conflict,
            FailureKind::RateLimited,
            FailureKind::Validation,
            FailureKind::FatalProtocol,
            FailureKind::PoolExhausted,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FailureKind::parse("nonsense"), None);
    }
}
