use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use cognos_dma::PipelineOutcome;
use cognos_kernel::{
    action::{ActionParams, ActionSelectionResult, RationaleEntry, RationaleStage},
    clock::chrono_duration,
    services::{AuditContext, AuditOutcome, MemoryScope},
    task::TaskResolution,
    CognitiveState, CognosError, HandlerAction, RuntimeStatus, TaskId, TaskKind, TaskPriority,
    TaskSpec, TaskStatus, Thought, ThoughtStatus,
};
use futures::FutureExt;
use serde_json::json;
use shared_logging::LogLevel;
use tracing::instrument;

use super::{AgentRuntime, Completion, Dispatched, Ledger, PipelineRun, RuntimeInner};
use crate::{
    dispatcher::{DeferralContext, DispatchOutcome},
    dream::InvitationDecision,
    state_machine::TransitionRecord,
};

/// Actions whose dispatch queues a continuation.
const fn continues(params: &ActionParams) -> bool {
    match params {
        ActionParams::Ponder(_) | ActionParams::Recall(_) => true,
        ActionParams::Observe(observe) => observe.active,
        _ => false,
    }
}

fn resolution(
    action: HandlerAction,
    summary: impl Into<String>,
    trail: Vec<RationaleEntry>,
) -> TaskResolution {
    TaskResolution {
        action,
        summary: summary.into(),
        trail,
        deferral_id: None,
    }
}

impl RuntimeInner {
    /// Evaluates a thought, then enforces and dispatches the selection.
    /// Dream invitations come back undispatched.
    async fn work(&self, thought: &Thought) -> PipelineRun {
        let PipelineOutcome {
            result,
            dma_results,
            mut trail,
            ..
        } = match self.pipeline.evaluate(thought).await {
            Ok(outcome) => outcome,
            Err(err) => return PipelineRun::Failed(err),
        };
        if thought.context.task_kind == TaskKind::DreamInvitation {
            return PipelineRun::Invitation { result, trail };
        }

        let state = self.state.current();
        let result = self.enforce(state, thought, result, &mut trail);
        {
            let mut ledger = self.ledger.lock();
            if let Some(entry) = ledger.thoughts.get_mut(&thought.id) {
                entry.result = Some(result.clone());
                entry.trail.clone_from(&trail);
            }
        }
        let outcome = self
            .dispatcher
            .dispatch(
                thought,
                &result,
                DeferralContext {
                    trail: trail.clone(),
                    dma_results,
                },
            )
            .await;
        trail.push(RationaleEntry::new(
            RationaleStage::Dispatch,
            "dispatcher",
            outcome.succeeded(),
            outcome.summary(),
        ));
        PipelineRun::Dispatched(Dispatched {
            result,
            outcome,
            trail,
            state,
        })
    }

    /// Applies the state whitelist and the ponder and depth caps.
    fn enforce(
        &self,
        state: CognitiveState,
        thought: &Thought,
        result: ActionSelectionResult,
        trail: &mut Vec<RationaleEntry>,
    ) -> ActionSelectionResult {
        let enforcement = self.whitelist.enforce(state, result);
        let mut result = enforcement.result;
        if let Some(refused) = enforcement.refused {
            trail.push(RationaleEntry::new(
                RationaleStage::Whitelist,
                "whitelist",
                false,
                refused.to_string(),
            ));
            self.emit(
                LogLevel::Warn,
                "scheduler.action.invalid_for_state",
                json!({
                    "error": "InvalidActionForState",
                    "detail": refused.to_string(),
                    "thought_id": thought.id,
                    "task_id": thought.task_id,
                    "state": state,
                    "substitute": result.selected_action(),
                }),
            );
        }

        let limits = &self.config.scheduler;
        let capped = match &result.params {
            ActionParams::Ponder(_) if thought.ponder_count >= limits.max_ponder_rounds => {
                Some(format!("ponder limit of {} reached", limits.max_ponder_rounds))
            }
            params if continues(params) && thought.depth() >= limits.max_thought_depth => {
                Some(format!("thought depth limit of {} reached", limits.max_thought_depth))
            }
            _ => None,
        };
        if let Some(reason) = capped {
            trail.push(RationaleEntry::new(
                RationaleStage::Fallback,
                "scheduler",
                false,
                reason.clone(),
            ));
            result = ActionSelectionResult::new(ActionParams::defer(reason.clone()), result.confidence, reason);
        }
        result
    }
}

impl AgentRuntime {
    /// Runs one round.
    ///
    /// Order: record finished workers, apply state transitions, maintenance
    /// (archive, dream invitation, variance), then start queued thoughts up to
    /// the caps.
    #[instrument(skip(self), fields(round = tracing::field::Empty))]
    pub async fn run_round(&self) -> RuntimeStatus {
        let round = {
            let mut ledger = self.inner.ledger.lock();
            ledger.round += 1;
            ledger.round
        };
        tracing::Span::current().record("round", round);
        self.apply_completions();
        self.advance_state().await;
        self.maintain();
        self.start_thoughts();
        self.reap_workers();
        self.get_runtime_status()
    }

    fn apply_completions(&self) {
        let completions: Vec<Completion> = {
            let mut rx = self.inner.completions_rx.lock();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        for completion in completions {
            let thought = {
                let mut ledger = self.inner.ledger.lock();
                ledger.in_flight.remove(&completion.thought_id);
                ledger.thoughts.get(&completion.thought_id).cloned()
            };
            let Some(thought) = thought else {
                continue;
            };
            match completion.run {
                PipelineRun::Cancelled => self.fail_thought(&thought, "shutdown_timeout"),
                PipelineRun::Failed(err) => self.fail_thought(&thought, &err.to_string()),
                PipelineRun::Invitation { result, trail } => self.answer_invitation(&thought, result, trail),
                PipelineRun::Dispatched(dispatched) => self.record_dispatch(&thought, dispatched),
            }
        }
    }

    fn fail_thought(&self, thought: &Thought, reason: &str) {
        let now = self.inner.clock.now();
        let action = thought
            .result
            .as_ref()
            .map_or(HandlerAction::Ponder, ActionSelectionResult::selected_action);
        {
            let mut ledger = self.inner.ledger.lock();
            if let Some(entry) = ledger.thoughts.get_mut(&thought.id) {
                entry.status = ThoughtStatus::Failed;
                entry.failure_reason = Some(reason.to_string());
                entry.updated_at = now;
            }
            ledger.close_task(
                thought.task_id,
                TaskStatus::Failed,
                resolution(action, reason, thought.trail.clone()),
                now,
            );
        }
        self.inner.emit(
            LogLevel::Warn,
            "scheduler.thought.failed",
            json!({ "thought_id": thought.id, "task_id": thought.task_id, "reason": reason }),
        );
        self.audit(
            thought,
            action,
            "",
            AuditOutcome {
                success: false,
                detail: reason.to_string(),
            },
        );
    }

    fn record_dispatch(&self, thought: &Thought, run: Dispatched) {
        let Dispatched {
            result,
            outcome,
            trail,
            state,
        } = run;
        let now = self.inner.clock.now();
        let action = result.selected_action();
        let shutting_down = self.inner.shutdown.is_requested();
        let continuation = {
            let mut ledger = self.inner.ledger.lock();
            let (status, failure) = match &outcome {
                DispatchOutcome::Deferred { .. } => (ThoughtStatus::Deferred, None),
                DispatchOutcome::Failed { reason } => (ThoughtStatus::Failed, Some(reason.clone())),
                _ => (ThoughtStatus::Completed, None),
            };
            if let Some(entry) = ledger.thoughts.get_mut(&thought.id) {
                entry.status = status;
                entry.failure_reason = failure;
                entry.trail.clone_from(&trail);
                entry.updated_at = now;
            }

            let mut continuation = None;
            match &outcome {
                DispatchOutcome::Completed { detail } => {
                    if let ActionParams::Memorize(memorize) = &result.params {
                        if memorize.scope == MemoryScope::Identity {
                            ledger.identity.apply(&memorize.node);
                        }
                    }
                    ledger.close_task(thought.task_id, TaskStatus::Complete, resolution(action, detail, trail), now);
                }
                DispatchOutcome::Continue { notes, observations } => {
                    let own_task = ledger.kind_of(&thought.task_id) == Some(TaskKind::Shutdown);
                    if shutting_down && !own_task {
                        ledger.close_task(
                            thought.task_id,
                            TaskStatus::Abandoned,
                            resolution(action, "shutdown", trail),
                            now,
                        );
                    } else {
                        let ponder_count =
                            thought.ponder_count + u32::from(action == HandlerAction::Ponder);
                        continuation = Some(ledger.continue_thought(
                            thought,
                            ponder_count,
                            notes,
                            observations,
                            state,
                            now,
                        ));
                    }
                }
                DispatchOutcome::Deferred {
                    reason,
                    deferral_id,
                } => {
                    let mut deferral = resolution(action, reason, trail);
                    deferral.deferral_id.clone_from(deferral_id);
                    ledger.close_task(thought.task_id, TaskStatus::Deferred, deferral, now);
                }
                DispatchOutcome::Rejected { reason } => {
                    ledger.close_task(thought.task_id, TaskStatus::Abandoned, resolution(action, reason, trail), now);
                }
                DispatchOutcome::Failed { reason } => {
                    ledger.close_task(thought.task_id, TaskStatus::Failed, resolution(action, reason, trail), now);
                }
            }
            continuation
        };

        self.inner.emit(
            LogLevel::Info,
            "scheduler.thought.completed",
            json!({
                "thought_id": thought.id,
                "task_id": thought.task_id,
                "action": action,
                "state": state,
                "outcome": outcome,
                "continuation": continuation,
            }),
        );
        self.audit(
            thought,
            action,
            &result.rationale,
            AuditOutcome {
                success: outcome.succeeded(),
                detail: outcome.summary(),
            },
        );
    }

    /// A dream invitation is answered, never dispatched: DEFER postpones it
    /// while the window allows, anything else accepts it.
    fn answer_invitation(
        &self,
        thought: &Thought,
        result: ActionSelectionResult,
        mut trail: Vec<RationaleEntry>,
    ) {
        let now = self.inner.clock.now();
        let action = result.selected_action();
        let rationale = result.rationale.clone();
        let (decision, summary) = {
            let mut ledger = self.inner.ledger.lock();
            let decision = if action == HandlerAction::Defer {
                ledger.dream.defer(now)
            } else {
                InvitationDecision::Accepted
            };
            let (thought_status, task_status, summary) = match decision {
                InvitationDecision::Postponed(until) => (
                    ThoughtStatus::Deferred,
                    TaskStatus::Deferred,
                    format!("dream postponed until {until}"),
                ),
                InvitationDecision::Accepted => (
                    ThoughtStatus::Completed,
                    TaskStatus::Complete,
                    "dream invitation accepted".to_string(),
                ),
            };
            trail.push(RationaleEntry::new(RationaleStage::Dispatch, "dream", true, summary.clone()));
            if let Some(entry) = ledger.thoughts.get_mut(&thought.id) {
                entry.status = thought_status;
                entry.result = Some(result);
                entry.trail.clone_from(&trail);
                entry.updated_at = now;
            }
            ledger.close_task(thought.task_id, task_status, resolution(action, summary.clone(), trail), now);
            (decision, summary)
        };
        self.audit(
            thought,
            action,
            &rationale,
            AuditOutcome {
                success: true,
                detail: summary,
            },
        );
        let postponed_until = match decision {
            InvitationDecision::Postponed(until) => Some(until),
            InvitationDecision::Accepted => None,
        };
        self.inner.emit(
            LogLevel::Info,
            "scheduler.dream.invitation_answered",
            json!({
                "task_id": thought.task_id,
                "action": action,
                "accepted": postponed_until.is_none(),
                "postponed_until": postponed_until,
            }),
        );
        if decision == InvitationDecision::Accepted {
            self.begin_dream(now);
        }
    }

    fn begin_dream(&self, now: DateTime<Utc>) {
        match self.inner.state.current() {
            CognitiveState::Play => {
                if self
                    .transition(CognitiveState::Work, "dream invitation accepted", now)
                    .is_none()
                {
                    return;
                }
            }
            CognitiveState::Work | CognitiveState::Solitude => {}
            _ => return,
        }
        if self
            .transition(CognitiveState::Dream, "dream invitation accepted", now)
            .is_none()
        {
            return;
        }
        let (ends_at, task_id) = {
            let mut ledger = self.inner.ledger.lock();
            let ends_at = ledger.dream.begin(now);
            ledger.dream_rounds = 0;
            let spec = TaskSpec::internal(
                TaskKind::DreamWork,
                "Consolidate recent memories and reflect on identity",
            )
            .with_priority(TaskPriority::Low);
            (ends_at, ledger.create_task(spec, CognitiveState::Dream, now))
        };
        self.inner.emit(
            LogLevel::Info,
            "scheduler.dream.started",
            json!({ "ends_at": ends_at, "task_id": task_id }),
        );
        self.check_variance(now);
    }

    async fn advance_state(&self) {
        let now = self.inner.clock.now();
        let state = self.inner.state.current();
        if self.inner.shutdown.is_requested() {
            self.advance_shutdown(state, now);
            return;
        }
        let scheduler = &self.inner.config.scheduler;
        match state {
            CognitiveState::Wakeup => {
                let identity_loaded = !self.inner.config.identity.name.trim().is_empty();
                let report = self
                    .inner
                    .buses
                    .registry
                    .health_report(&scheduler.required_services)
                    .await;
                if identity_loaded && report.all_healthy() {
                    self.transition(
                        CognitiveState::Work,
                        "identity loaded and required services healthy",
                        now,
                    );
                } else {
                    let _ = self.inner.telemetry.log(
                        LogLevel::Debug,
                        "scheduler.wakeup.waiting",
                        json!({ "identity_loaded": identity_loaded, "missing": report.missing() }),
                    );
                }
            }
            CognitiveState::Work => {
                let (idle, budget) = {
                    let mut ledger = self.inner.ledger.lock();
                    if ledger.has_work() {
                        ledger.idle_rounds = 0;
                    } else {
                        ledger.idle_rounds += 1;
                    }
                    (ledger.idle_rounds, ledger.exploration_left)
                };
                if idle >= scheduler.solitude_after_idle_rounds {
                    self.transition(CognitiveState::Solitude, &format!("idle for {idle} rounds"), now);
                } else if idle >= scheduler.play_after_idle_rounds && budget > 0 {
                    self.transition(CognitiveState::Play, &format!("idle for {idle} rounds"), now);
                }
            }
            CognitiveState::Play => {
                let (has_work, left) = {
                    let mut ledger = self.inner.ledger.lock();
                    ledger.exploration_left = ledger.exploration_left.saturating_sub(1);
                    (ledger.has_work(), ledger.exploration_left)
                };
                if has_work {
                    self.reset_idle();
                    self.transition(CognitiveState::Work, "work arrived", now);
                } else if left == 0 {
                    self.transition(CognitiveState::Work, "exploration budget spent", now);
                }
            }
            CognitiveState::Solitude => {
                if self.inner.ledger.lock().has_work() {
                    self.reset_idle();
                    self.transition(CognitiveState::Work, "work arrived", now);
                }
            }
            CognitiveState::Dream => {
                let over = {
                    let mut ledger = self.inner.ledger.lock();
                    let over = ledger.dream.is_over(now);
                    if over {
                        ledger.dream.end(now);
                        ledger.exploration_left = scheduler.exploration_budget;
                        ledger.idle_rounds = 0;
                    }
                    over
                };
                if over {
                    self.transition(CognitiveState::Work, "dream complete", now);
                }
            }
            CognitiveState::Shutdown => {}
        }
    }

    fn reset_idle(&self) {
        self.inner.ledger.lock().idle_rounds = 0;
    }

    fn advance_shutdown(&self, state: CognitiveState, now: DateTime<Utc>) {
        if state != CognitiveState::Shutdown {
            let reason = self
                .inner
                .shutdown
                .current()
                .map_or_else(|| "shutdown requested".to_string(), |request| request.reason);
            if self.transition(CognitiveState::Shutdown, &reason, now).is_none() {
                return;
            }
            let dropped = self.abandon_queued(now);
            self.inner.emit(
                LogLevel::Warn,
                "scheduler.shutdown.started",
                json!({ "reason": reason, "abandoned_tasks": dropped }),
            );
            return;
        }

        if self.inner.shutdown.grace_expired() && self.inner.shutdown.cancel_in_flight() {
            let in_flight = self.inner.ledger.lock().in_flight.len();
            self.inner.emit(
                LogLevel::Warn,
                "scheduler.shutdown.grace_expired",
                json!({ "cancelled": in_flight }),
            );
        }

        let Some(request) = self.inner.shutdown.current() else {
            return;
        };
        let newly_finished = {
            let mut ledger = self.inner.ledger.lock();
            let task_done = !ledger
                .task(&request.task_id)
                .is_some_and(|task| !task.status.is_terminal());
            let done = task_done && ledger.in_flight.is_empty() && !ledger.finished;
            if done {
                ledger.finished = true;
            }
            done
        };
        if newly_finished {
            let status = self.get_runtime_status();
            self.inner.emit(
                LogLevel::Info,
                "scheduler.shutdown.finished",
                json!({ "task_id": request.task_id, "status": status }),
            );
        }
    }

    /// Fails every queued thought that does not belong to the shutdown task
    /// and abandons its task.
    fn abandon_queued(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut ledger = self.inner.ledger.lock();
        let Ledger { queue, tasks, .. } = &mut *ledger;
        let dropped = queue.drain_where(|entry| {
            tasks
                .get(&entry.task_id)
                .is_some_and(|task| task.kind != TaskKind::Shutdown)
        });
        let mut abandoned = Vec::new();
        for entry in dropped {
            if let Some(thought) = ledger.thoughts.get_mut(&entry.thought_id) {
                thought.status = ThoughtStatus::Failed;
                thought.failure_reason = Some("shutdown".into());
                thought.updated_at = now;
            }
            if ledger.close_task(
                entry.task_id,
                TaskStatus::Abandoned,
                resolution(HandlerAction::Reject, "shutdown", Vec::new()),
                now,
            ) {
                abandoned.push(entry.task_id);
            }
        }
        abandoned
    }

    fn maintain(&self) {
        if self.inner.shutdown.is_requested() {
            return;
        }
        let now = self.inner.clock.now();
        self.archive_expired(now);
        match self.inner.state.current() {
            state @ (CognitiveState::Work | CognitiveState::Solitude) => self.invite_dream(state, now),
            CognitiveState::Dream => {
                let due = {
                    let mut ledger = self.inner.ledger.lock();
                    ledger.dream_rounds += 1;
                    ledger.dream_rounds % self.inner.config.scheduler.variance_check_rounds.max(1) == 0
                };
                if due {
                    self.check_variance(now);
                }
            }
            _ => {}
        }
    }

    fn archive_expired(&self, now: DateTime<Utc>) {
        let retention = chrono_duration(Duration::from_secs(
            self.inner.config.scheduler.task_retention_secs,
        ));
        let mut ledger = self.inner.ledger.lock();
        let expired: Vec<TaskId> = ledger
            .tasks
            .values()
            .filter(|task| {
                task.status.is_terminal()
                    && task.completed_at.is_some_and(|at| now - at >= retention)
            })
            .map(|task| task.id)
            .collect();
        for id in expired {
            if let Some(task) = ledger.tasks.shift_remove(&id) {
                for thought_id in &task.thought_ids {
                    ledger.thoughts.remove(thought_id);
                }
                ledger.archive.insert(task);
            }
        }
    }

    fn invite_dream(&self, state: CognitiveState, now: DateTime<Utc>) {
        let invited = {
            let mut ledger = self.inner.ledger.lock();
            if !ledger.dream.is_due(now) || ledger.has_open(TaskKind::DreamInvitation) {
                return;
            }
            let spec = TaskSpec::internal(
                TaskKind::DreamInvitation,
                "Dream invitation: enter DREAM to consolidate memories and review identity, or DEFER to postpone",
            )
            .with_priority(TaskPriority::High);
            (ledger.create_task(spec, state, now), ledger.dream.due_at())
        };
        self.inner.emit(
            LogLevel::Info,
            "scheduler.dream.invited",
            json!({ "task_id": invited.0, "due_at": invited.1 }),
        );
    }

    /// Compares the live identity with the baseline; escalates without pausing.
    fn check_variance(&self, now: DateTime<Utc>) {
        let threshold = self.inner.config.scheduler.variance_threshold;
        let state = self.inner.state.current();
        let (report, review) = {
            let mut ledger = self.inner.ledger.lock();
            let report = ledger.identity.check(threshold, now);
            ledger.variance_reports.push(report.clone());
            let review = (report.exceeds_threshold && !ledger.has_open(TaskKind::IdentityReview))
                .then(|| {
                    let spec = TaskSpec::internal(
                        TaskKind::IdentityReview,
                        format!(
                            "Identity variance {:.2} exceeds {threshold:.2} ({}); DEFER to the wise authority for review",
                            report.variance_ratio,
                            report.differing_attributes.join(", ")
                        ),
                    )
                    .with_priority(TaskPriority::High);
                    ledger.create_task(spec, state, now)
                });
            (report, review)
        };
        if report.exceeds_threshold {
            let error = CognosError::IdentityVarianceExceeded {
                ratio: report.variance_ratio,
                threshold,
            };
            self.inner.emit(
                LogLevel::Warn,
                "scheduler.identity.variance_exceeded",
                json!({ "error": error.to_string(), "report": report, "review_task_id": review }),
            );
        } else {
            let _ = self.inner.telemetry.log(
                LogLevel::Debug,
                "scheduler.identity.variance_checked",
                json!({ "ratio": report.variance_ratio }),
            );
        }
    }

    fn start_thoughts(&self) {
        let now = self.inner.clock.now();
        let limits = &self.inner.config.scheduler;
        let shutting_down = self.inner.shutdown.is_requested();
        let mut started = Vec::new();
        {
            let mut guard = self.inner.ledger.lock();
            let Ledger {
                tasks,
                thoughts,
                queue,
                in_flight,
                ..
            } = &mut *guard;
            while in_flight.len() < limits.max_active_thoughts {
                let active: HashSet<TaskId> = in_flight.values().copied().collect();
                let next = queue.take_first(|entry| {
                    let shutdown_work = tasks
                        .get(&entry.task_id)
                        .is_some_and(|task| task.kind == TaskKind::Shutdown);
                    (!shutting_down || shutdown_work)
                        && (active.contains(&entry.task_id) || active.len() < limits.max_active_tasks)
                });
                let Some(entry) = next else {
                    break;
                };
                let Some(thought) = thoughts.get_mut(&entry.thought_id) else {
                    continue;
                };
                thought.status = ThoughtStatus::Processing;
                thought.updated_at = now;
                if let Some(task) = tasks.get_mut(&entry.task_id) {
                    task.activate(now);
                }
                in_flight.insert(entry.thought_id, entry.task_id);
                started.push(thought.clone());
            }
        }
        for thought in started {
            let _ = self.inner.telemetry.log(
                LogLevel::Debug,
                "scheduler.thought.started",
                json!({ "thought_id": thought.id, "task_id": thought.task_id, "depth": thought.depth() }),
            );
            self.spawn_pipeline(thought);
        }
    }

    /// Evaluation and dispatch both run under the shutdown child token.
    fn spawn_pipeline(&self, thought: Thought) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.shutdown.child_token();
        self.inner.workers.lock().spawn(async move {
            let thought_id = thought.id;
            let work = AssertUnwindSafe(inner.work(&thought)).catch_unwind();
            let run = tokio::select! {
                () = cancel.cancelled() => PipelineRun::Cancelled,
                run = work => run.unwrap_or_else(|_| {
                    PipelineRun::Failed(CognosError::Internal("pipeline panicked".into()))
                }),
            };
            let _ = inner.completions_tx.send(Completion { thought_id, run });
        });
    }

    fn reap_workers(&self) {
        let mut workers = self.inner.workers.lock();
        while let Some(joined) = workers.try_join_next() {
            if let Err(err) = joined {
                tracing::error!(target: "cognos", error = %err, "pipeline worker ended abnormally");
            }
        }
    }

    fn transition(&self, to: CognitiveState, reason: &str, now: DateTime<Utc>) -> Option<TransitionRecord> {
        let record = match self.inner.machine.lock().transition(to, reason, now) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(target: "cognos", error = %err, "transition skipped");
                return None;
            }
        };
        self.inner.emit(LogLevel::Info, "scheduler.state.transition", json!(record));
        let control = self.inner.buses.runtime_control.clone();
        let status = self.get_runtime_status();
        let announced = record.clone();
        tokio::spawn(async move {
            if let Err(err) = control
                .notify_state_transition(announced.from, announced.to, &announced.reason)
                .await
            {
                tracing::debug!(target: "cognos", error = %err, "state transition not announced");
                return;
            }
            let _ = control.publish_status(&status).await;
        });
        Some(record)
    }

    /// Hands the outcome to the audit sink without waiting for it.
    fn audit(&self, thought: &Thought, action: HandlerAction, rationale: &str, outcome: AuditOutcome) {
        let Some(audit) = self.inner.audit.clone() else {
            return;
        };
        let round_number = self.inner.ledger.lock().round;
        let context = AuditContext {
            thought_id: thought.id,
            task_id: thought.task_id,
            round_number,
            cognitive_state: self.inner.state.current(),
            rationale: rationale.to_string(),
        };
        tokio::spawn(async move {
            if let Err(err) = audit.log_action(action, &context, &outcome).await {
                tracing::warn!(target: "cognos", error = %err, "audit write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cognos_kernel::{
        config::RuntimeConfig,
        loopback::{
            GraphMemory, LoopbackTools, RecordingAudit, RecordingCommunication,
            RecordingRuntimeControl, RecordingWiseAuthority, ScriptedLlm,
        },
        services::ServiceProvider,
        ManualClock, TaskSpec,
    };
    use cognos_servicebus::ServiceRegistration;
    use serde_json::Value;
    use shared_event_bus::MemoryEventBus;

    const SELECTION: &str = "dma.action_selection";

    struct Harness {
        runtime: AgentRuntime,
        llm: Arc<ScriptedLlm>,
        comms: Arc<RecordingCommunication>,
        wa: Arc<RecordingWiseAuthority>,
        tools: Arc<LoopbackTools>,
        audit: Arc<RecordingAudit>,
        control: Arc<RecordingRuntimeControl>,
        clock: Arc<ManualClock>,
    }

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.scheduler.home_channel = Some("general".into());
        config.scheduler.round_interval_ms = 10;
        config
    }

    fn harness(config: RuntimeConfig) -> Harness {
        let llm = Arc::new(ScriptedLlm::cooperative("model"));
        let comms = Arc::new(RecordingCommunication::new("chat"));
        let wa = Arc::new(RecordingWiseAuthority::new("wa"));
        let tools = Arc::new(LoopbackTools::new("tools").with_static_tool("clock", serde_json::json!("noon")));
        let memory = Arc::new(GraphMemory::new("graph"));
        let audit = Arc::new(RecordingAudit::new());
        let control = Arc::new(RecordingRuntimeControl::new("control"));
        let clock = Arc::new(ManualClock::default());
        let runtime = AgentRuntime::builder(config)
            .clock(clock.clone())
            .audit(audit.clone())
            .event_bus(Arc::new(MemoryEventBus::new(4096)))
            .service(ServiceRegistration::new("model", ServiceProvider::Llm(llm.clone())))
            .service(ServiceRegistration::new("chat", ServiceProvider::Communication(comms.clone())))
            .service(ServiceRegistration::new("graph", ServiceProvider::Memory(memory)))
            .service(ServiceRegistration::new("wa", ServiceProvider::WiseAuthority(wa.clone())))
            .service(ServiceRegistration::new("tools", ServiceProvider::Tool(tools.clone())))
            .service(ServiceRegistration::new("control", ServiceProvider::RuntimeControl(control.clone())))
            .build()
            .unwrap();
        Harness {
            runtime,
            llm,
            comms,
            wa,
            tools,
            audit,
            control,
            clock,
        }
    }

    /// Lets spawned pipelines and fire-and-forget sinks run to idle.
    async fn flush() {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    fn events_of(runtime: &AgentRuntime, event_type: &str) -> Vec<Value> {
        runtime
            .events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .map(|event| event.payload)
            .collect()
    }

    fn select(action: &Value) -> String {
        let mut answer = action.clone();
        answer["confidence"] = serde_json::json!(0.9);
        answer["rationale"] = serde_json::json!("scripted");
        answer.to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn spoken_reply_completes_task_once() {
        let h = harness(config());
        let task = h.runtime.submit_task(TaskSpec::new("say hello")).unwrap();
        h.runtime.run(Some(4)).await;
        flush().await;

        assert_eq!(h.runtime.get_task_status(task).unwrap(), TaskStatus::Complete);
        let sent = h.comms.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, "general");
        assert_eq!(sent[0].content, "Acknowledged.");

        let record = h.runtime.task_record(task).unwrap();
        let resolution = record.resolution.unwrap();
        assert_eq!(resolution.action, HandlerAction::Speak);
        assert!(resolution.trail.iter().any(|entry| entry.stage == RationaleStage::Guardrail));
        assert_eq!(h.audit.entries().len(), 1);
        assert_eq!(
            h.control.transitions()[0],
            (
                CognitiveState::Wakeup,
                CognitiveState::Work,
                "identity loaded and required services healthy".to_string()
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn llm_outage_defers_instead_of_failing() {
        let h = harness(config());
        h.runtime.run(Some(1)).await;
        h.llm.switches().set_failing(true);
        let task = h.runtime.submit_task(TaskSpec::new("summarize the thread")).unwrap();
        h.runtime.run(Some(4)).await;

        assert_eq!(h.runtime.get_task_status(task).unwrap(), TaskStatus::Deferred);
        let deferrals = h.wa.deferrals();
        assert_eq!(deferrals.len(), 1);
        assert_eq!(deferrals[0].task_id, task);
        assert!(deferrals[0]
            .rationale_chain
            .iter()
            .any(|entry| entry.stage == RationaleStage::Fallback));
        assert!(h.runtime.task_record(task).unwrap().resolution.unwrap().deferral_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn priority_then_fifo_under_caps() {
        let mut config = config();
        config.scheduler.max_active_thoughts = 2;
        config.scheduler.max_active_tasks = 1;
        let h = harness(config);
        let low = h
            .runtime
            .submit_task(TaskSpec::new("low").with_priority(TaskPriority::Low))
            .unwrap();
        let normal = h.runtime.submit_task(TaskSpec::new("normal")).unwrap();
        let high = h
            .runtime
            .submit_task(TaskSpec::new("high").with_priority(TaskPriority::High))
            .unwrap();

        let status = h.runtime.run_round().await;
        assert_eq!(status.active_thoughts, 1);
        assert_eq!(status.pending_thoughts, 2);
        assert_eq!(h.runtime.thoughts_of(high)[0].status, ThoughtStatus::Processing);
        assert_eq!(h.runtime.thoughts_of(normal)[0].status, ThoughtStatus::Pending);

        flush().await;
        h.runtime.run_round().await;
        assert_eq!(h.runtime.get_task_status(high).unwrap(), TaskStatus::Complete);
        assert_eq!(h.runtime.thoughts_of(normal)[0].status, ThoughtStatus::Processing);
        assert_eq!(h.runtime.thoughts_of(low)[0].status, ThoughtStatus::Pending);

        h.runtime.run(Some(4)).await;
        assert_eq!(h.runtime.get_task_status(low).unwrap(), TaskStatus::Complete);
        assert_eq!(h.comms.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pondering_past_the_limit_defers() {
        let mut config = config();
        config.scheduler.max_ponder_rounds = 2;
        let h = harness(config);
        h.llm.replace_response(
            SELECTION,
            select(&serde_json::json!({"action": "PONDER", "parameters": {"questions": ["what is missing?"]}})),
        );
        let task = h.runtime.submit_task(TaskSpec::new("plan the week")).unwrap();
        h.runtime.run(Some(10)).await;

        assert_eq!(h.runtime.get_task_status(task).unwrap(), TaskStatus::Deferred);
        let thoughts = h.runtime.thoughts_of(task);
        assert_eq!(thoughts.len(), 3);
        assert_eq!(thoughts[2].ponder_count, 2);
        assert_eq!(thoughts[2].context.ponder_notes.len(), 2);
        assert_eq!(thoughts[2].status, ThoughtStatus::Deferred);
        let deferrals = h.wa.deferrals();
        assert_eq!(deferrals.len(), 1);
        assert_eq!(deferrals[0].reason, "ponder limit of 2 reached");
    }

    #[tokio::test(start_paused = true)]
    async fn dreaming_refuses_tools() {
        let mut config = config();
        config.scheduler.dream_interval_secs = 60;
        config.scheduler.dream_duration_secs = 3600;
        let h = harness(config);
        h.runtime.run(Some(1)).await;
        h.clock.advance(chrono::Duration::seconds(61));
        h.runtime.run(Some(3)).await;
        assert_eq!(h.runtime.state().current(), CognitiveState::Dream);

        h.llm.replace_response(
            SELECTION,
            select(&serde_json::json!({"action": "TOOL", "parameters": {"name": "clock", "arguments": {}}})),
        );
        let task = h.runtime.submit_task(TaskSpec::new("what time is it?")).unwrap();
        h.runtime.run(Some(3)).await;
        flush().await;

        assert!(h.tools.invocations().is_empty());
        let first = &h.runtime.thoughts_of(task)[0];
        assert_eq!(first.result.as_ref().unwrap().selected_action(), HandlerAction::Ponder);
        assert!(first
            .trail
            .iter()
            .any(|entry| entry.stage == RationaleStage::Whitelist && !entry.passed));
        let refused = events_of(&h.runtime, "scheduler.action.invalid_for_state");
        assert!(!refused.is_empty());
        assert_eq!(refused[0]["error"], "InvalidActionForState");
    }

    #[tokio::test(start_paused = true)]
    async fn dreaming_never_speaks() {
        let mut config = config();
        config.scheduler.dream_interval_secs = 60;
        config.scheduler.dream_duration_secs = 3600;
        let h = harness(config);
        h.runtime.run(Some(1)).await;
        h.clock.advance(chrono::Duration::seconds(61));
        h.runtime.run(Some(3)).await;
        assert_eq!(h.runtime.state().current(), CognitiveState::Dream);

        let task = h.runtime.submit_task(TaskSpec::new("say hello to everyone")).unwrap();
        h.runtime.run(Some(3)).await;
        flush().await;

        assert!(h.comms.sent().is_empty());
        let first = &h.runtime.thoughts_of(task)[0];
        assert_eq!(first.result.as_ref().unwrap().selected_action(), HandlerAction::Ponder);
        let refused = events_of(&h.runtime, "scheduler.action.invalid_for_state");
        let own = refused
            .iter()
            .find(|event| event["task_id"] == serde_json::json!(task))
            .unwrap();
        assert_eq!(own["error"], "InvalidActionForState");
        assert_eq!(own["state"], serde_json::json!(CognitiveState::Dream));
        assert_eq!(own["substitute"], serde_json::json!(HandlerAction::Ponder));
    }

    #[tokio::test(start_paused = true)]
    async fn identity_drift_escalates_without_pausing() {
        let mut config = config();
        config.scheduler.dream_interval_secs = 60;
        config.scheduler.dream_duration_secs = 3600;
        config.identity.attributes = (0..12).map(|i| (format!("trait_{i}"), format!("value_{i}"))).collect();
        let h = harness(config);
        h.llm.replace_response(
            SELECTION,
            select(&serde_json::json!({
                "action": "MEMORIZE",
                "parameters": {
                    "node": {
                        "id": "self",
                        "node_type": "identity",
                        "attributes": {"trait_1": "bold", "trait_2": "bolder", "trait_3": "boldest"}
                    },
                    "scope": "identity"
                }
            })),
        );
        let memorize = h.runtime.submit_task(TaskSpec::new("remember who you are")).unwrap();
        h.runtime.run(Some(3)).await;
        assert_eq!(h.runtime.get_task_status(memorize).unwrap(), TaskStatus::Complete);

        h.llm.replace_response(
            SELECTION,
            select(&serde_json::json!({"action": "TASK_COMPLETE", "parameters": {"summary": "noted"}})),
        );
        h.clock.advance(chrono::Duration::seconds(61));
        h.runtime.run(Some(3)).await;
        flush().await;
        assert_eq!(h.runtime.state().current(), CognitiveState::Dream);

        let report = h.runtime.variance_reports().pop().unwrap();
        assert!((report.variance_ratio - 3.0 / 13.0).abs() < 1e-9);
        assert!(report.exceeds_threshold);
        let escalations = events_of(&h.runtime, "scheduler.identity.variance_exceeded");
        assert_eq!(escalations.len(), 1);
        let review: TaskId = serde_json::from_value(escalations[0]["review_task_id"].clone()).unwrap();
        let review = h.runtime.task_record(review).unwrap();
        assert_eq!(review.kind, TaskKind::IdentityReview);
        assert_eq!(review.priority, TaskPriority::High);

        let other = h.runtime.submit_task(TaskSpec::new("log the weather")).unwrap();
        h.runtime.run(Some(3)).await;
        assert_eq!(h.runtime.get_task_status(other).unwrap(), TaskStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn dream_invitation_deferral_is_bounded() {
        let mut config = config();
        config.scheduler.dream_interval_secs = 60;
        config.scheduler.dream_deferral_step_secs = 30;
        config.scheduler.dream_deferral_window_secs = 90;
        let h = harness(config);
        h.llm.replace_response(
            SELECTION,
            select(&serde_json::json!({"action": "DEFER", "parameters": {"reason": "busy"}})),
        );
        h.runtime.run(Some(1)).await;
        h.clock.advance(chrono::Duration::seconds(61));
        h.runtime.run(Some(3)).await;
        flush().await;
        assert_eq!(h.runtime.state().current(), CognitiveState::Work);
        let answers = events_of(&h.runtime, "scheduler.dream.invitation_answered");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["accepted"], false);

        h.clock.advance(chrono::Duration::seconds(100));
        h.runtime.run(Some(3)).await;
        flush().await;
        assert_eq!(h.runtime.state().current(), CognitiveState::Dream);

        let invitations: Vec<Value> = events_of(&h.runtime, "scheduler.dream.invited")
            .into_iter()
            .map(|payload| payload["task_id"].clone())
            .collect();
        assert_eq!(invitations.len(), 2);
        assert!(h
            .wa
            .deferrals()
            .iter()
            .all(|deferral| !invitations.contains(&serde_json::json!(deferral.task_id))));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_pipelines_fail_after_grace() {
        let mut config = config();
        config.scheduler.shutdown_grace_ms = 1000;
        config.scheduler.round_interval_ms = 100;
        let h = harness(config);
        h.runtime.run(Some(1)).await;
        h.llm.set_delay(Some(std::time::Duration::from_secs(3600)));
        let task = h.runtime.submit_task(TaskSpec::new("long analysis")).unwrap();
        h.runtime.run(Some(1)).await;

        let shutdown = h.runtime.request_shutdown("maintenance window");
        assert_eq!(h.runtime.request_shutdown("again"), shutdown);
        assert_eq!(
            h.runtime.submit_task(TaskSpec::new("late")),
            Err(CognosError::ShuttingDown)
        );
        let status = h.runtime.run(Some(100)).await;

        assert!(h.runtime.is_finished());
        assert_eq!(status.current_state, CognitiveState::Shutdown);
        assert_eq!(h.runtime.get_task_status(task).unwrap(), TaskStatus::Failed);
        let thought = &h.runtime.thoughts_of(task)[0];
        assert_eq!(thought.failure_reason.as_deref(), Some("shutdown_timeout"));
        assert!(h.runtime.get_task_status(shutdown).unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_is_cancelled_at_grace() {
        let mut config = config();
        config.scheduler.shutdown_grace_ms = 1000;
        config.scheduler.round_interval_ms = 100;
        let h = harness(config);
        h.runtime.run(Some(1)).await;
        h.comms.set_send_delay(Some(Duration::from_secs(3600)));
        let task = h.runtime.submit_task(TaskSpec::new("say hello")).unwrap();
        h.runtime.run(Some(2)).await;
        flush().await;

        let thought = h.runtime.thoughts_of(task).remove(0);
        assert_eq!(thought.status, ThoughtStatus::Processing);
        assert_eq!(thought.result.unwrap().selected_action(), HandlerAction::Speak);

        let started = tokio::time::Instant::now();
        let shutdown = h.runtime.request_shutdown("maintenance window");
        let status = h.runtime.run(Some(100)).await;

        assert!(h.runtime.is_finished());
        assert_eq!(status.current_state, CognitiveState::Shutdown);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(h.comms.sent().is_empty());
        assert_eq!(h.runtime.get_task_status(task).unwrap(), TaskStatus::Failed);
        let thought = &h.runtime.thoughts_of(task)[0];
        assert_eq!(thought.failure_reason.as_deref(), Some("shutdown_timeout"));
        let resolution = h.runtime.task_record(task).unwrap().resolution.unwrap();
        assert_eq!(resolution.action, HandlerAction::Speak);
        assert!(h.runtime.get_task_status(shutdown).unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_work_is_abandoned_at_shutdown() {
        let mut config = config();
        config.scheduler.max_active_tasks = 1;
        let h = harness(config);
        let first = h.runtime.submit_task(TaskSpec::new("first")).unwrap();
        let second = h.runtime.submit_task(TaskSpec::new("second")).unwrap();
        h.runtime.run_round().await;
        h.runtime.request_shutdown("operator");
        h.runtime.run(Some(10)).await;

        assert!(h.runtime.is_finished());
        assert_eq!(h.runtime.get_task_status(first).unwrap(), TaskStatus::Complete);
        assert_eq!(h.runtime.get_task_status(second).unwrap(), TaskStatus::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn archived_tasks_still_answer_status() {
        let mut config = config();
        config.scheduler.task_retention_secs = 60;
        let h = harness(config);
        let task = h.runtime.submit_task(TaskSpec::new("quick")).unwrap();
        h.runtime.run(Some(3)).await;
        assert_eq!(h.runtime.thoughts_of(task).len(), 1);

        h.clock.advance(chrono::Duration::seconds(61));
        h.runtime.run_round().await;
        assert!(h.runtime.thoughts_of(task).is_empty());
        assert_eq!(h.runtime.get_task_status(task).unwrap(), TaskStatus::Complete);
        assert_eq!(h.runtime.get_runtime_status().open_tasks, 0);

        let unknown = TaskId::new();
        assert_eq!(
            h.runtime.get_task_status(unknown),
            Err(CognosError::UnknownTask(unknown))
        );
    }
}
