//! Tasks: root units of work owned by the scheduler.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    action::{HandlerAction, RationaleEntry},
    services::DeferralId,
    thought::{ThoughtId, ThoughtStatus},
};

/// Identifier assigned to every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generates a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Submitted by an adapter reacting to an outside event.
    ExternalEvent,
    /// Created from a schedule.
    Scheduled,
    /// Created by the scheduler itself (dreams, escalations, shutdown).
    SelfInitiated,
}

/// Task priority; higher values are started first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Elevated urgency.
    High,
    /// Shutdown and safety work.
    Critical,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Queued, no thought started yet.
    Pending,
    /// At least one thought started.
    Active,
    /// Deferred for human or authority review.
    Deferred,
    /// Every owned thought is terminal and the work finished.
    Complete,
    /// An unrecoverable error ended the task.
    Failed,
    /// Rejected by the agent or dropped at shutdown.
    Abandoned,
}

impl TaskStatus {
    /// Whether the task can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Deferred | Self::Complete | Self::Failed | Self::Abandoned
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Deferred => "DEFERRED",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Abandoned => "ABANDONED",
        };
        f.write_str(label)
    }
}

/// What the task is for. Only `User` tasks arrive through `submit_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Regular work.
    #[default]
    User,
    /// Self-scheduled invitation to enter DREAM.
    DreamInvitation,
    /// Introspection performed while dreaming.
    DreamWork,
    /// Escalation of identity variance to the wise authority.
    IdentityReview,
    /// Grace-bounded shutdown handling.
    Shutdown,
}

/// Work description accepted by `submit_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Human readable description.
    pub description: String,
    /// Origin of the work.
    #[serde(default = "default_origin")]
    pub origin: TaskOrigin,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Task kind.
    #[serde(default)]
    pub kind: TaskKind,
    /// Channel the work arrived on, used as the default SPEAK/OBSERVE target.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Free-form context copied into the initial thought snapshot.
    #[serde(default)]
    pub attributes: IndexMap<String, String>,
}

const fn default_origin() -> TaskOrigin {
    TaskOrigin::ExternalEvent
}

impl TaskSpec {
    /// Creates an externally originated task at normal priority.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            origin: TaskOrigin::ExternalEvent,
            priority: TaskPriority::Normal,
            kind: TaskKind::User,
            channel_id: None,
            attributes: IndexMap::new(),
        }
    }

    /// Creates a task the scheduler raises for itself.
    #[must_use]
    pub fn internal(kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            origin: TaskOrigin::SelfInitiated,
            kind,
            ..Self::new(description)
        }
    }

    /// Overrides the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the origin.
    #[must_use]
    pub const fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Sets the originating channel.
    #[must_use]
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    /// Adds a context attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// How a task ended, with the rationale chain that led there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResolution {
    /// Action of the thought that closed the task.
    pub action: HandlerAction,
    /// Short summary (completion summary, deferral reason, failure reason).
    pub summary: String,
    /// Every evaluation and guardrail entry that led to the outcome.
    pub trail: Vec<RationaleEntry>,
    /// Deferral ticket when the wise authority accepted the deferral.
    pub deferral_id: Option<DeferralId>,
}

/// A root unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Identifier.
    pub id: TaskId,
    /// Submission order, used for FIFO tie-breaks.
    pub sequence: u64,
    /// Description.
    pub description: String,
    /// Origin.
    pub origin: TaskOrigin,
    /// Kind.
    pub kind: TaskKind,
    /// Priority.
    pub priority: TaskPriority,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Originating channel.
    pub channel_id: Option<String>,
    /// Context attributes.
    pub attributes: IndexMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When a terminal status was reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// Owned thoughts in creation order.
    pub thought_ids: Vec<ThoughtId>,
    /// Final outcome, set together with a terminal status.
    pub resolution: Option<TaskResolution>,
}

impl Task {
    /// Creates a pending task from its spec.
    #[must_use]
    pub fn new(spec: TaskSpec, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            sequence,
            description: spec.description,
            origin: spec.origin,
            kind: spec.kind,
            priority: spec.priority,
            status: TaskStatus::Pending,
            channel_id: spec.channel_id,
            attributes: spec.attributes,
            created_at: now,
            updated_at: now,
            completed_at: None,
            thought_ids: Vec::new(),
            resolution: None,
        }
    }

    /// Moves the task to ACTIVE unless it already reached a terminal status.
    pub fn activate(&mut self, now: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Active;
            self.updated_at = now;
        }
    }

    /// Applies a terminal status.
    ///
    /// Refuses (returning `false`) while any owned thought is still open, so a
    /// task can never report COMPLETE ahead of its thoughts.
    pub fn close(
        &mut self,
        status: TaskStatus,
        owned: &[ThoughtStatus],
        resolution: TaskResolution,
        now: DateTime<Utc>,
    ) -> bool {
        if !status.is_terminal() || self.status.is_terminal() {
            return false;
        }
        if owned.iter().any(|status| !status.is_terminal()) {
            return false;
        }
        self.status = status;
        self.resolution = Some(resolution);
        self.updated_at = now;
        self.completed_at = Some(now);
        true
    }
}
