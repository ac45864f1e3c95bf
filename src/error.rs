//! Error taxonomy for the session orchestrator (spec.md §7).
//!
//! These are library-level, typed errors (`thiserror`); handlers and the
//! gateway's terminal error reporter map them to client-visible events and
//! close codes. Propagation policy: categories 1 and 7 are recoverable and
//! handled locally; 2-6 surface through the Quest Manager's first-exception
//! rule.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Category 1: malformed frame or schema violation. Non-fatal.
    #[error("invalid request: {0}")]
    Protocol(String),

    /// Category 2: upstream STT/LLM refused with a saturation signal.
    #[error("{service} is not available")]
    UpstreamAtCapacity { service: String },

    /// Category 3: handshake exceeded its timeout budget.
    #[error("{service} timed out")]
    UpstreamTimeout { service: String },

    /// Category 4: mid-session close on STT or LLM.
    #[error("{service} connection lost")]
    UpstreamTransportLoss { service: String },

    /// Category 5: the client's connection is gone.
    #[error("client connection lost")]
    ClientTransportLoss,

    /// Category 6: any uncaught internal failure.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// Category 7: LLM rate-limited past all retries.
    #[error("rate limited after retries")]
    RateLimited,
}

impl OrchestratorError {
    /// Three well-known transient errors the Quest Manager swallows during
    /// teardown (spec.md §4.2, §7 category 4/5).
    pub fn is_swallowed_during_teardown(&self) -> bool {
        matches!(
            self,
            OrchestratorError::UpstreamAtCapacity { .. }
                | OrchestratorError::UpstreamTimeout { .. }
                | OrchestratorError::ClientTransportLoss
        )
    }

    /// Whether this condition should end the session fatally (close 1011).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::UpstreamAtCapacity { .. }
                | OrchestratorError::UpstreamTimeout { .. }
                | OrchestratorError::Internal(_)
        )
    }
}
