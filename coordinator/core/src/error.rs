//! Error Taxonomy
//!
//! Every failure the coordinator can observe falls into one of a small set of
//! kinds: transport, auth, protocol, capacity, timeout, worker-reported, and
//! integrity. Transport and protocol errors tear down the offending worker
//! connection; auth errors reject the handshake before any state exists;
//! capacity errors fail the task at dispatch; timeout, worker, and integrity
//! errors drive the per-subtask reassign-or-fail decision.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::WorkerErrorKind;
use crate::tasks::{Difficulty, TaskId};
use crate::transport::TransportError;

/// Errors surfaced by the coordinator core.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The underlying frame channel failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The registration handshake carried an invalid account proof.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// A live connection already owns this node id under a different account.
    #[error("node id `{0}` is already registered to a different account")]
    DuplicateNodeId(String),

    /// A frame violated the wire contract (unknown kind, missing field,
    /// out-of-sequence delivery).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No online node satisfies the tier requirement for this difficulty.
    #[error("no eligible node online for {difficulty} work")]
    NoEligibleNodes {
        /// Difficulty whose tier set had no online member.
        difficulty: Difficulty,
    },

    /// Every permitted attempt for a subtask has been consumed.
    #[error("all {attempts} attempts exhausted")]
    AttemptsExhausted {
        /// Number of attempts that were made.
        attempts: u32,
    },

    /// A deadline expired before a terminal result arrived.
    #[error("deadline expired after {seconds}s")]
    DeadlineExpired {
        /// Length of the expired window in seconds.
        seconds: u64,
    },

    /// A worker reported a failure for an assigned subtask.
    #[error("worker reported {kind}: {detail}")]
    Worker {
        /// Failure category reported by the worker.
        kind: WorkerErrorKind,
        /// Free-form detail supplied by the worker.
        detail: String,
    },

    /// A final result failed validation (empty, oversized, or undecodable).
    #[error("result failed validation: {0}")]
    InvalidResult(String),

    /// The referenced task is not known to the orchestrator.
    #[error("unknown task `{0}`")]
    UnknownTask(TaskId),
}

/// Machine-readable reason attached to PARTIAL and FAILED outcomes, and to
/// terminal stream markers. The HTTP boundary forwards these verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// No eligible node was online at dispatch time.
    NoNodes,
    /// The subtask retry budget ran out.
    AttemptsExhausted,
    /// A task or subtask deadline expired.
    Timeout,
    /// The assigned node's connection went away.
    NodeLost,
    /// A worker reported a task error.
    WorkerError,
    /// The final payload failed integrity validation.
    InvalidResponse,
    /// The task was cancelled by the caller.
    Cancelled,
}

impl ReasonCode {
    /// Stable wire spelling of this reason.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoNodes => "NO_NODES",
            Self::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::NodeLost => "NODE_LOST",
            Self::WorkerError => "WORKER_ERROR",
            Self::InvalidResponse => "INVALID_RESPONSE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_wire_spelling() {
        assert_eq!(ReasonCode::NoNodes.to_string(), "NO_NODES");
        assert_eq!(ReasonCode::InvalidResponse.to_string(), "INVALID_RESPONSE");

        let json = serde_json::to_string(&ReasonCode::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
    }

    #[test]
    fn test_error_display() {
        let err = CoordinatorError::DuplicateNodeId("node-7".to_string());
        assert!(err.to_string().contains("node-7"));

        let err = CoordinatorError::DeadlineExpired { seconds: 600 };
        assert!(err.to_string().contains("600"));
    }
}
