//! The closed action vocabulary and the results produced by evaluators.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::{GraphNode, MemoryQuery, MemoryScope, NodeId};

/// The ten actions an agent may take. Closed set, no extension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerAction {
    /// Read from a channel (active) or note the current context (passive).
    Observe,
    /// Send a message to a channel.
    Speak,
    /// Execute a tool.
    Tool,
    /// Decline the task.
    Reject,
    /// Think again with additional questions.
    Ponder,
    /// Hand the task to the wise authority.
    Defer,
    /// Write a node to memory.
    Memorize,
    /// Query memory.
    Recall,
    /// Remove a node from memory.
    Forget,
    /// Mark the task finished.
    TaskComplete,
}

impl HandlerAction {
    /// Every action, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Observe,
        Self::Speak,
        Self::Tool,
        Self::Reject,
        Self::Ponder,
        Self::Defer,
        Self::Memorize,
        Self::Recall,
        Self::Forget,
        Self::TaskComplete,
    ];

    /// Wire label (`SPEAK`, `TASK_COMPLETE`, ...).
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Speak => "SPEAK",
            Self::Tool => "TOOL",
            Self::Reject => "REJECT",
            Self::Ponder => "PONDER",
            Self::Defer => "DEFER",
            Self::Memorize => "MEMORIZE",
            Self::Recall => "RECALL",
            Self::Forget => "FORGET",
            Self::TaskComplete => "TASK_COMPLETE",
        }
    }
}

impl fmt::Display for HandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// OBSERVE parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserveParams {
    /// Channel to read; defaults to the task channel.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Active observation fetches messages from the communication bus.
    #[serde(default)]
    pub active: bool,
    /// Maximum messages to fetch.
    #[serde(default = "default_observe_limit")]
    pub limit: usize,
}

const fn default_observe_limit() -> usize {
    20
}

/// SPEAK parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakParams {
    /// Target channel; defaults to the task channel.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Message body.
    pub content: String,
}

/// TOOL parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParams {
    /// Tool name as advertised by `list_tools`.
    pub name: String,
    /// Tool-specific arguments.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// REJECT parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectParams {
    /// Why the task is declined.
    pub reason: String,
}

/// PONDER parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PonderParams {
    /// Questions for the follow-up thought.
    #[serde(default)]
    pub questions: Vec<String>,
}

/// DEFER parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferParams {
    /// Why the task needs review.
    pub reason: String,
    /// Optional time before which the task should not be retried.
    #[serde(default)]
    pub defer_until: Option<DateTime<Utc>>,
}

/// MEMORIZE parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorizeParams {
    /// Node to write.
    pub node: GraphNode,
    /// Memory scope.
    #[serde(default)]
    pub scope: MemoryScope,
}

/// RECALL parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecallParams {
    /// Query.
    pub query: MemoryQuery,
    /// Memory scope.
    #[serde(default)]
    pub scope: MemoryScope,
}

/// FORGET parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetParams {
    /// Node to remove.
    pub node_id: NodeId,
    /// Memory scope.
    #[serde(default)]
    pub scope: MemoryScope,
    /// Why the node is removed.
    #[serde(default)]
    pub reason: String,
}

/// TASK_COMPLETE parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskCompleteParams {
    /// Completion summary.
    #[serde(default)]
    pub summary: String,
}

/// Action parameters as a tagged union keyed by the action.
///
/// Serialized as `{"action": "SPEAK", "parameters": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "parameters", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionParams {
    /// OBSERVE.
    Observe(ObserveParams),
    /// SPEAK.
    Speak(SpeakParams),
    /// TOOL.
    Tool(ToolParams),
    /// REJECT.
    Reject(RejectParams),
    /// PONDER.
    Ponder(PonderParams),
    /// DEFER.
    Defer(DeferParams),
    /// MEMORIZE.
    Memorize(MemorizeParams),
    /// RECALL.
    Recall(RecallParams),
    /// FORGET.
    Forget(ForgetParams),
    /// `TASK_COMPLETE`.
    TaskComplete(TaskCompleteParams),
}

impl ActionParams {
    /// Action the parameters belong to.
    #[must_use]
    pub const fn action(&self) -> HandlerAction {
        match self {
            Self::Observe(_) => HandlerAction::Observe,
            Self::Speak(_) => HandlerAction::Speak,
            Self::Tool(_) => HandlerAction::Tool,
            Self::Reject(_) => HandlerAction::Reject,
            Self::Ponder(_) => HandlerAction::Ponder,
            Self::Defer(_) => HandlerAction::Defer,
            Self::Memorize(_) => HandlerAction::Memorize,
            Self::Recall(_) => HandlerAction::Recall,
            Self::Forget(_) => HandlerAction::Forget,
            Self::TaskComplete(_) => HandlerAction::TaskComplete,
        }
    }

    /// DEFER with the given reason.
    #[must_use]
    pub fn defer(reason: impl Into<String>) -> Self {
        Self::Defer(DeferParams {
            reason: reason.into(),
            defer_until: None,
        })
    }

    /// PONDER with a single question.
    #[must_use]
    pub fn ponder(question: impl Into<String>) -> Self {
        Self::Ponder(PonderParams {
            questions: vec![question.into()],
        })
    }
}

/// Output of the action-selection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSelectionResult {
    /// Selected action with its typed parameters.
    #[serde(flatten)]
    pub params: ActionParams,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Why the action was chosen.
    pub rationale: String,
    /// Set after guardrail validation.
    #[serde(default)]
    pub guardrail_pass: bool,
}

impl ActionSelectionResult {
    /// Creates an unvalidated result.
    #[must_use]
    pub fn new(params: ActionParams, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            params,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
            guardrail_pass: false,
        }
    }

    /// Conservative DEFER produced when evaluation could not finish.
    #[must_use]
    pub fn fallback_defer(rationale: impl Into<String>) -> Self {
        let rationale = rationale.into();
        Self::new(ActionParams::defer(rationale.clone()), 0.0, rationale)
    }

    /// Conservative PONDER produced when evaluation partially succeeded.
    #[must_use]
    pub fn fallback_ponder(rationale: impl Into<String>) -> Self {
        let rationale = rationale.into();
        Self::new(
            ActionParams::ponder(format!("re-evaluate after: {rationale}")),
            0.0,
            rationale,
        )
    }

    /// Selected action.
    #[must_use]
    pub const fn selected_action(&self) -> HandlerAction {
        self.params.action()
    }
}

/// Evaluator family of a DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmaFamily {
    /// Principle-based evaluation.
    Ethical,
    /// Plausibility evaluation.
    CommonSense,
    /// Domain knowledge evaluation.
    Domain,
}

/// Decision of the ethical evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EthicalDecision {
    /// Proceeding is aligned.
    Approve,
    /// Proceeding is misaligned.
    Reject,
    /// Needs more thought.
    Ponder,
    /// Needs human review.
    Defer,
}

/// Evaluator-specific verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DmaVerdict {
    /// Ethical verdict.
    Ethical {
        /// Decision.
        decision: EthicalDecision,
        /// Alignment score in [0, 1].
        alignment: f32,
    },
    /// Common-sense verdict.
    CommonSense {
        /// Plausibility in [0, 1].
        plausibility: f32,
        /// Raised concerns.
        #[serde(default)]
        flags: Vec<String>,
    },
    /// Domain verdict.
    Domain {
        /// Domain name.
        domain: String,
        /// Domain alignment in [0, 1].
        score: f32,
        /// Suggested action, if any.
        #[serde(default)]
        recommendation: Option<HandlerAction>,
    },
    /// Substituted when the evaluator timed out or failed.
    Unavailable {
        /// Family of the evaluator that failed.
        expected: DmaFamily,
    },
}

/// Result of one evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmaResult {
    /// Evaluator name, unique within a pipeline.
    pub evaluator_name: String,
    /// Evaluator-specific verdict.
    pub verdict: DmaVerdict,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Rationale.
    pub rationale: String,
    /// True when a fallback value replaced a timed out or failed evaluation.
    pub degraded: bool,
}

impl DmaResult {
    /// Fallback result for an evaluator that could not finish.
    #[must_use]
    pub fn degraded(
        evaluator_name: impl Into<String>,
        family: DmaFamily,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            evaluator_name: evaluator_name.into(),
            verdict: DmaVerdict::Unavailable { expected: family },
            confidence: 0.0,
            rationale: reason.into(),
            degraded: true,
        }
    }
}

/// Stage that produced a rationale entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RationaleStage {
    /// Parallel DMA evaluation.
    Evaluation,
    /// Action selection.
    Selection,
    /// Guardrail validation.
    Guardrail,
    /// Conservative fallback substitution.
    Fallback,
    /// Cognitive-state whitelist substitution.
    Whitelist,
    /// Bus dispatch.
    Dispatch,
}

/// One link of the rationale chain surfaced with deferred tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleEntry {
    /// Producing stage.
    pub stage: RationaleStage,
    /// Evaluator, guardrail or component name.
    pub source: String,
    /// Whether the stage passed.
    pub passed: bool,
    /// Detail text.
    pub detail: String,
}

impl RationaleEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(
        stage: RationaleStage,
        source: impl Into<String>,
        passed: bool,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            source: source.into(),
            passed,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_from_tagged_json() {
        let raw = r#"{"action":"SPEAK","parameters":{"content":"hello"},"confidence":0.9,"rationale":"greeting"}"#;
        let result: ActionSelectionResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.selected_action(), HandlerAction::Speak);
        assert!(!result.guardrail_pass);
        match result.params {
            ActionParams::Speak(speak) => assert_eq!(speak.content, "hello"),
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[test]
    fn task_complete_label_round_trips_through_serde() {
        let value = serde_json::to_value(ActionParams::TaskComplete(TaskCompleteParams::default()))
            .unwrap();
        assert_eq!(value["action"], "TASK_COMPLETE");
        assert_eq!(HandlerAction::TaskComplete.to_string(), "TASK_COMPLETE");
    }

    #[test]
    fn fallbacks_are_zero_confidence() {
        let defer = ActionSelectionResult::fallback_defer("llm_unavailable");
        assert_eq!(defer.selected_action(), HandlerAction::Defer);
        assert_eq!(defer.rationale, "llm_unavailable");
        let ponder = ActionSelectionResult::fallback_ponder("llm_unavailable");
        assert_eq!(ponder.selected_action(), HandlerAction::Ponder);
        assert!(ponder.confidence.abs() < f32::EPSILON);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let raw = r#"{"action":"DANCE","parameters":{},"confidence":0.5,"rationale":"x"}"#;
        assert!(serde_json::from_str::<ActionSelectionResult>(raw).is_err());
    }
}
