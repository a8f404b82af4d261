//! Error taxonomy for the decision runtime.

use thiserror::Error;

use crate::{
    action::HandlerAction, services::ServiceCategory, state::CognitiveState, task::TaskId,
    thought::ThoughtId,
};

/// Errors surfaced by the registry, buses, pipeline and scheduler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CognosError {
    /// No eligible provider remains in a bus category.
    #[error("no eligible provider for {0}")]
    ServiceUnavailable(ServiceCategory),
    /// An evaluator or bus call exceeded its deadline.
    #[error("{operation} exceeded its {timeout_ms}ms deadline")]
    EvaluationTimeout {
        /// What was being awaited (`llm.generate`, `dma.ethical`, ...).
        operation: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },
    /// The selected action failed a guardrail threshold.
    #[error("guardrail violation: {0}")]
    GuardrailViolation(String),
    /// The selected action is not whitelisted for the current state.
    #[error("{action} is not permitted while {state}")]
    InvalidActionForState {
        /// Rejected action.
        action: HandlerAction,
        /// State in force when the action was proposed.
        state: CognitiveState,
    },
    /// Identity drifted beyond the configured ratio. Advisory only.
    #[error("identity variance {ratio:.2} exceeds {threshold:.2}")]
    IdentityVarianceExceeded {
        /// Measured ratio.
        ratio: f64,
        /// Configured threshold.
        threshold: f64,
    },
    /// A provider call returned an error.
    #[error("provider {provider} failed: {message}")]
    Provider {
        /// Provider handle.
        provider: String,
        /// Provider supplied message.
        message: String,
    },
    /// A second pipeline tried to evaluate a thought that is in flight.
    #[error("thought {0} is already being evaluated")]
    ThoughtAlreadyProcessing(ThoughtId),
    /// The task id is neither live nor archived.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    /// The state machine refused a transition.
    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        /// Current state.
        from: CognitiveState,
        /// Requested state.
        to: CognitiveState,
    },
    /// Work was submitted after shutdown started.
    #[error("runtime is shutting down")]
    ShuttingDown,
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// Catch-all for invariants that should not break.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CognosError {
    /// Whether the error is the LLM category being unavailable.
    #[must_use]
    pub const fn is_llm_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(ServiceCategory::Llm))
    }

    /// Whether the error is a deadline miss.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::EvaluationTimeout { .. })
    }
}

/// Error returned by an external provider implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    /// Creates an error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_llm_unavailable() {
        assert!(CognosError::ServiceUnavailable(ServiceCategory::Llm).is_llm_unavailable());
        assert!(!CognosError::ServiceUnavailable(ServiceCategory::Tool).is_llm_unavailable());
        let timeout = CognosError::EvaluationTimeout {
            operation: "llm.generate".into(),
            timeout_ms: 50,
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "llm.generate exceeded its 50ms deadline");
    }
}
