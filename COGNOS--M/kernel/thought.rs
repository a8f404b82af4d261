//! Thoughts: evaluable units derived from tasks.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    action::{ActionSelectionResult, RationaleEntry},
    state::CognitiveState,
    task::{Task, TaskId, TaskKind, TaskOrigin},
};

/// Identifier assigned to every thought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThoughtId(pub Uuid);

impl ThoughtId {
    /// Generates a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ThoughtId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThoughtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thought-{}", self.0)
    }
}

/// Whether the thought is the first for its task or a follow-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThoughtType {
    /// First thought of a task.
    Initial,
    /// Spawned by PONDER or by a data-gathering action.
    Continuation,
}

/// Lifecycle status of a thought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThoughtStatus {
    /// Waiting for a round to start it.
    Pending,
    /// A pipeline is evaluating it.
    Processing,
    /// Action dispatched.
    Completed,
    /// Resolved to DEFER.
    Deferred,
    /// Unrecoverable error or shutdown timeout.
    Failed,
}

impl ThoughtStatus {
    /// Whether the thought can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Deferred | Self::Failed)
    }
}

/// Immutable point-in-time view handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Description of the owning task.
    pub task_description: String,
    /// Kind of the owning task.
    pub task_kind: TaskKind,
    /// Origin of the owning task.
    pub origin: TaskOrigin,
    /// Channel used as default SPEAK/OBSERVE target.
    pub channel_id: Option<String>,
    /// State in force when the snapshot was taken.
    pub cognitive_state: CognitiveState,
    /// Round in which the thought was created.
    pub round_number: u64,
    /// Length of the continuation chain (0 for initial thoughts).
    pub depth: u32,
    /// Questions accumulated through PONDER.
    pub ponder_notes: Vec<String>,
    /// Data gathered by OBSERVE/RECALL on earlier thoughts.
    pub observations: Vec<String>,
    /// Task attributes.
    pub attributes: IndexMap<String, String>,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

impl ContextSnapshot {
    /// Builds the snapshot of a task's initial thought.
    #[must_use]
    pub fn for_task(task: &Task, state: CognitiveState, round: u64, now: DateTime<Utc>) -> Self {
        Self {
            task_description: task.description.clone(),
            task_kind: task.kind,
            origin: task.origin,
            channel_id: task.channel_id.clone(),
            cognitive_state: state,
            round_number: round,
            depth: 0,
            ponder_notes: Vec::new(),
            observations: Vec::new(),
            attributes: task.attributes.clone(),
            captured_at: now,
        }
    }

    /// Derives a follow-up snapshot carrying extra notes and observations.
    #[must_use]
    pub fn continued(
        &self,
        state: CognitiveState,
        round: u64,
        notes: &[String],
        observations: &[String],
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.cognitive_state = state;
        next.round_number = round;
        next.depth += 1;
        next.ponder_notes.extend_from_slice(notes);
        next.observations.extend_from_slice(observations);
        next.captured_at = now;
        next
    }
}

/// One evaluable unit of cognitive work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    /// Identifier.
    pub id: ThoughtId,
    /// Owning task.
    pub task_id: TaskId,
    /// Initial or continuation.
    pub thought_type: ThoughtType,
    /// Lifecycle status.
    pub status: ThoughtStatus,
    /// Global creation order; FIFO tie-break within a priority.
    pub sequence: u64,
    /// Number of PONDER actions that led to this thought.
    pub ponder_count: u32,
    /// Frozen context.
    pub context: Arc<ContextSnapshot>,
    /// Selected action once the pipeline produced one.
    pub result: Option<ActionSelectionResult>,
    /// Rationale chain recorded for this thought.
    pub trail: Vec<RationaleEntry>,
    /// Why the thought failed.
    pub failure_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Thought {
    /// Creates a pending thought.
    #[must_use]
    pub fn new(
        task_id: TaskId,
        thought_type: ThoughtType,
        sequence: u64,
        ponder_count: u32,
        context: ContextSnapshot,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ThoughtId::new(),
            task_id,
            thought_type,
            status: ThoughtStatus::Pending,
            sequence,
            ponder_count,
            context: Arc::new(context),
            result: None,
            trail: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Continuation depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.context.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    #[test]
    fn continuation_snapshot_extends_history() {
        let task = Task::new(TaskSpec::new("summarize logs").with_channel("ops"), 1, Utc::now());
        let base = ContextSnapshot::for_task(&task, CognitiveState::Work, 3, Utc::now());
        let next = base.continued(
            CognitiveState::Work,
            4,
            &["which service?".to_string()],
            &[],
            Utc::now(),
        );
        assert_eq!(base.depth, 0);
        assert_eq!(next.depth, 1);
        assert_eq!(next.ponder_notes.len(), 1);
        assert_eq!(next.channel_id.as_deref(), Some("ops"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(ThoughtStatus::Deferred.is_terminal());
        assert!(!ThoughtStatus::Processing.is_terminal());
    }
}
