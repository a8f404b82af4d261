//! The agent runtime: task intake, the public API and the shared ledger the
//! round loop works on.

/// Builder used to configure an [`AgentRuntime`].
pub mod builder;
/// One pass of the scheduler loop.
mod round;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use cognos_dma::DmaPipeline;
use cognos_kernel::{
    action::{ActionSelectionResult, RationaleEntry},
    config::RuntimeConfig, services::AuditService, task::TaskResolution, Clock, CognitiveState, CognosError,
    ContextSnapshot, RuntimeStatus, RuntimeTelemetry, StateReader, Task, TaskId, TaskKind,
    TaskPriority, TaskSpec, TaskStatus, Thought, ThoughtId, ThoughtType,
};
use cognos_servicebus::{ServiceBuses, ServiceRegistration};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared_event_bus::{EventRecord, MemoryEventBus};
use shared_logging::LogLevel;
use tokio::{sync::mpsc, task::JoinSet};

pub use builder::AgentRuntimeBuilder;

use crate::{
    archive::TaskArchive,
    dispatcher::{DispatchOutcome, Dispatcher},
    dream::DreamSchedule,
    queue::{QueuedThought, ThoughtQueue},
    shutdown::ShutdownCoordinator,
    state_machine::{StateMachine, TransitionRecord},
    variance::{IdentityTracker, VarianceReport},
    whitelist::ActionWhitelist,
};

/// How a spawned worker ended.
enum PipelineRun {
    /// Evaluated, enforced and dispatched.
    Dispatched(Dispatched),
    /// A dream invitation's answer, left to the round loop.
    Invitation {
        result: ActionSelectionResult,
        trail: Vec<RationaleEntry>,
    },
    Failed(CognosError),
    Cancelled,
}

struct Dispatched {
    result: ActionSelectionResult,
    outcome: DispatchOutcome,
    trail: Vec<RationaleEntry>,
    state: CognitiveState,
}

struct Completion {
    thought_id: ThoughtId,
    run: PipelineRun,
}

/// Everything the round loop mutates. Never held across an await.
#[derive(Debug)]
struct Ledger {
    tasks: IndexMap<TaskId, Task>,
    thoughts: HashMap<ThoughtId, Thought>,
    queue: ThoughtQueue,
    in_flight: HashMap<ThoughtId, TaskId>,
    archive: TaskArchive,
    task_seq: u64,
    thought_seq: u64,
    round: u64,
    idle_rounds: u64,
    exploration_left: u64,
    dream_rounds: u64,
    dream: DreamSchedule,
    identity: IdentityTracker,
    variance_reports: Vec<VarianceReport>,
    finished: bool,
}

impl Ledger {
    fn new(config: &RuntimeConfig, now: DateTime<Utc>) -> Self {
        Self {
            tasks: IndexMap::new(),
            thoughts: HashMap::new(),
            queue: ThoughtQueue::default(),
            in_flight: HashMap::new(),
            archive: TaskArchive::new(config.scheduler.archive_capacity),
            task_seq: 0,
            thought_seq: 0,
            round: 0,
            idle_rounds: 0,
            exploration_left: config.scheduler.exploration_budget,
            dream_rounds: 0,
            dream: DreamSchedule::new(&config.scheduler, now),
            identity: IdentityTracker::from_config(&config.identity, now),
            variance_reports: Vec::new(),
            finished: false,
        }
    }

    /// Registers a task and queues its initial thought.
    fn create_task(&mut self, spec: TaskSpec, state: CognitiveState, now: DateTime<Utc>) -> TaskId {
        self.task_seq += 1;
        let task = Task::new(spec, self.task_seq, now);
        let task_id = task.id;
        let context = ContextSnapshot::for_task(&task, state, self.round, now);
        self.tasks.insert(task_id, task);
        self.thought_seq += 1;
        let thought = Thought::new(task_id, ThoughtType::Initial, self.thought_seq, 0, context, now);
        self.enqueue(thought);
        task_id
    }

    /// Queues a follow-up of `parent` carrying new notes and observations.
    fn continue_thought(
        &mut self,
        parent: &Thought,
        ponder_count: u32,
        notes: &[String],
        observations: &[String],
        state: CognitiveState,
        now: DateTime<Utc>,
    ) -> ThoughtId {
        let context = parent
            .context
            .continued(state, self.round, notes, observations, now);
        self.thought_seq += 1;
        let thought = Thought::new(
            parent.task_id,
            ThoughtType::Continuation,
            self.thought_seq,
            ponder_count,
            context,
            now,
        );
        let id = thought.id;
        self.enqueue(thought);
        id
    }

    fn enqueue(&mut self, thought: Thought) {
        let Some(task) = self.tasks.get_mut(&thought.task_id) else {
            return;
        };
        task.thought_ids.push(thought.id);
        self.queue.push(QueuedThought {
            priority: task.priority,
            sequence: thought.sequence,
            thought_id: thought.id,
            task_id: thought.task_id,
        });
        self.thoughts.insert(thought.id, thought);
    }

    /// Closes a task once every owned thought is terminal.
    fn close_task(
        &mut self,
        task_id: TaskId,
        status: TaskStatus,
        resolution: TaskResolution,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(task) = self.tasks.get(&task_id) else {
            return false;
        };
        let owned: Vec<_> = task
            .thought_ids
            .iter()
            .filter_map(|id| self.thoughts.get(id))
            .map(|thought| thought.status)
            .collect();
        self.tasks
            .get_mut(&task_id)
            .is_some_and(|task| task.close(status, &owned, resolution, now))
    }

    fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id).or_else(|| self.archive.get(id))
    }

    fn kind_of(&self, id: &TaskId) -> Option<TaskKind> {
        self.tasks.get(id).map(|task| task.kind)
    }

    fn has_open(&self, kind: TaskKind) -> bool {
        self.tasks
            .values()
            .any(|task| task.kind == kind && !task.status.is_terminal())
    }

    /// Whether user work or an identity review is queued or running.
    fn has_work(&self) -> bool {
        let is_work = |task_id: &TaskId| {
            matches!(
                self.kind_of(task_id),
                Some(TaskKind::User | TaskKind::IdentityReview)
            )
        };
        self.queue.any(|entry| is_work(&entry.task_id)) || self.in_flight.values().any(is_work)
    }

    fn status(&self, state: CognitiveState, shutdown_requested: bool) -> RuntimeStatus {
        let active_tasks: HashSet<&TaskId> = self.in_flight.values().collect();
        RuntimeStatus {
            current_state: state,
            active_thoughts: self.in_flight.len(),
            active_tasks: active_tasks.len(),
            round_number: self.round,
            pending_thoughts: self.queue.len(),
            open_tasks: self
                .tasks
                .values()
                .filter(|task| !task.status.is_terminal())
                .count(),
            shutdown_requested,
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    buses: ServiceBuses,
    pipeline: Arc<DmaPipeline>,
    whitelist: ActionWhitelist,
    dispatcher: Dispatcher,
    audit: Option<Arc<dyn AuditService>>,
    telemetry: RuntimeTelemetry,
    events: Arc<MemoryEventBus>,
    state: StateReader,
    machine: Mutex<StateMachine>,
    ledger: Mutex<Ledger>,
    workers: Mutex<JoinSet<()>>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    shutdown: ShutdownCoordinator,
}

impl RuntimeInner {
    fn emit(&self, level: LogLevel, name: &str, payload: Value) {
        let _ = self.telemetry.log(level, name, payload.clone());
        let _ = self.telemetry.event(name, payload);
    }
}

/// A single agent instance: owns the cognitive state, the task ledger and the
/// pipelines in flight.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("state", &self.inner.state.current())
            .field("pipeline", &self.inner.pipeline)
            .field("telemetry", &self.inner.telemetry)
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Returns a builder for the runtime.
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(config)
    }

    /// Queues a user task and its initial thought.
    ///
    /// Refused with [`CognosError::ShuttingDown`] once shutdown was requested.
    /// The task kind is always `User`.
    pub fn submit_task(&self, mut spec: TaskSpec) -> Result<TaskId, CognosError> {
        spec.kind = TaskKind::User;
        let now = self.inner.clock.now();
        let state = self.inner.state.current();
        let task_id = {
            let mut ledger = self.inner.ledger.lock();
            if self.inner.shutdown.is_requested() {
                return Err(CognosError::ShuttingDown);
            }
            ledger.create_task(spec, state, now)
        };
        self.inner.emit(
            LogLevel::Info,
            "scheduler.task.submitted",
            json!({ "task_id": task_id, "state": state }),
        );
        Ok(task_id)
    }

    /// Status of a live or archived task.
    pub fn get_task_status(&self, task_id: TaskId) -> Result<TaskStatus, CognosError> {
        self.inner
            .ledger
            .lock()
            .task(&task_id)
            .map(|task| task.status)
            .ok_or(CognosError::UnknownTask(task_id))
    }

    /// Full task record, live or archived.
    #[must_use]
    pub fn task_record(&self, task_id: TaskId) -> Option<Task> {
        self.inner.ledger.lock().task(&task_id).cloned()
    }

    /// Live thoughts of a task in creation order. Empty once archived.
    #[must_use]
    pub fn thoughts_of(&self, task_id: TaskId) -> Vec<Thought> {
        let ledger = self.inner.ledger.lock();
        ledger
            .tasks
            .get(&task_id)
            .map(|task| {
                task.thought_ids
                    .iter()
                    .filter_map(|id| ledger.thoughts.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adds a provider to the registry.
    pub fn register_service(&self, registration: ServiceRegistration) -> bool {
        let category = registration.category;
        let handle = registration.handle.clone();
        let added = self.inner.buses.registry.register(registration);
        self.inner.emit(
            LogLevel::Info,
            "scheduler.service.registered",
            json!({ "category": category, "handle": handle, "added": added }),
        );
        added
    }

    /// Removes a provider from the registry.
    pub fn unregister_service(&self, handle: &str) -> bool {
        let removed = self.inner.buses.registry.unregister(handle);
        self.inner.emit(
            LogLevel::Info,
            "scheduler.service.unregistered",
            json!({ "handle": handle, "removed": removed }),
        );
        removed
    }

    /// Snapshot of the scheduler.
    #[must_use]
    pub fn get_runtime_status(&self) -> RuntimeStatus {
        let state = self.inner.state.current();
        self.inner
            .ledger
            .lock()
            .status(state, self.inner.shutdown.is_requested())
    }

    /// Starts a grace-bounded shutdown, returning the shutdown task.
    ///
    /// Repeated calls return the task of the first request.
    pub fn request_shutdown(&self, reason: impl Into<String>) -> TaskId {
        let reason = reason.into();
        let now = self.inner.clock.now();
        let state = self.inner.state.current();
        let task_id = {
            let mut ledger = self.inner.ledger.lock();
            if let Some(existing) = self.inner.shutdown.current() {
                return existing.task_id;
            }
            let mut spec = TaskSpec::internal(
                TaskKind::Shutdown,
                format!("Shut down gracefully and tell the community why: {reason}"),
            )
            .with_priority(TaskPriority::Critical);
            if let Some(channel) = &self.inner.config.scheduler.home_channel {
                spec = spec.with_channel(channel.clone());
            }
            let task_id = ledger.create_task(spec, state, now);
            self.inner.shutdown.request(task_id, reason.clone());
            task_id
        };
        self.inner.emit(
            LogLevel::Warn,
            "scheduler.shutdown.requested",
            json!({ "task_id": task_id, "reason": reason, "state": state }),
        );
        task_id
    }

    /// Variance checks run so far.
    #[must_use]
    pub fn variance_reports(&self) -> Vec<VarianceReport> {
        self.inner.ledger.lock().variance_reports.clone()
    }

    /// Events retained by the in-memory bus.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord> {
        self.inner.events.snapshot()
    }

    /// Applied state transitions.
    #[must_use]
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.inner.machine.lock().history().to_vec()
    }

    /// Read handle on the cognitive state.
    #[must_use]
    pub fn state(&self) -> StateReader {
        self.inner.state.clone()
    }

    /// Buses shared with the pipeline and the dispatcher.
    #[must_use]
    pub fn buses(&self) -> &ServiceBuses {
        &self.inner.buses
    }

    /// Whether shutdown completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.ledger.lock().finished
    }

    /// Runs rounds until shutdown finishes or `max_rounds` rounds ran.
    pub async fn run(&self, max_rounds: Option<u64>) -> RuntimeStatus {
        let interval = self.inner.config.scheduler.round_interval();
        let mut rounds = 0_u64;
        loop {
            let status = self.run_round().await;
            rounds += 1;
            if self.is_finished() || max_rounds.is_some_and(|max| rounds >= max) {
                return status;
            }
            tokio::time::sleep(interval).await;
        }
    }
}
