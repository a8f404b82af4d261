//! Fan-out, selection and guardrail validation for one thought.

use std::{collections::HashSet, fmt, sync::Arc};

use cognos_kernel::{
    action::{ActionSelectionResult, DmaResult, RationaleEntry, RationaleStage},
    config::DmaConfig,
    thought::{Thought, ThoughtId},
    CognosError, RuntimeTelemetry,
};
use cognos_servicebus::LlmBus;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tracing::instrument;

use crate::{
    evaluators::{default_evaluators, Evaluator, TriagedInputs},
    faculties::{FacultyReport, FacultyRunner},
    guardrails::GuardrailSet,
    selection::{ActionSelector, GuardrailFeedback},
};

/// Everything the pipeline produced for one thought.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Evaluated thought.
    pub thought_id: ThoughtId,
    /// Final action, possibly a conservative fallback.
    pub result: ActionSelectionResult,
    /// Every evaluator result, degraded ones included.
    pub dma_results: Vec<DmaResult>,
    /// One entry per stage and per guardrail attempt.
    pub trail: Vec<RationaleEntry>,
    /// Calls made to the action selector.
    pub selection_attempts: u32,
    /// Faculty scores of the last validated attempt.
    pub faculty_report: Option<FacultyReport>,
}

impl PipelineOutcome {
    /// Whether a fallback replaced the selector's own choice.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.trail
            .iter()
            .any(|entry| entry.stage == RationaleStage::Fallback)
    }
}

struct InFlight {
    claimed: Arc<Mutex<HashSet<ThoughtId>>>,
    id: ThoughtId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.id);
    }
}

/// Evaluation pipeline shared by every round of the scheduler.
pub struct DmaPipeline {
    evaluators: Vec<Arc<dyn Evaluator>>,
    selector: ActionSelector,
    faculties: FacultyRunner,
    guardrails: GuardrailSet,
    config: DmaConfig,
    in_flight: Arc<Mutex<HashSet<ThoughtId>>>,
    telemetry: Option<RuntimeTelemetry>,
}

impl fmt::Debug for DmaPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let evaluators: Vec<&str> = self.evaluators.iter().map(|e| e.name()).collect();
        f.debug_struct("DmaPipeline")
            .field("evaluators", &evaluators)
            .field("guardrails", &self.guardrails)
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl DmaPipeline {
    /// Pipeline with the default evaluators for `config`.
    #[must_use]
    pub fn new(llm: LlmBus, config: DmaConfig) -> Self {
        Self {
            evaluators: default_evaluators(&llm, &config),
            selector: ActionSelector::new(llm.clone()),
            faculties: FacultyRunner::new(llm, config.faculty_timeout()),
            guardrails: GuardrailSet::from_config(&config.guardrails),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            telemetry: None,
        }
    }

    /// Adds an evaluator to the fan-out.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Replaces the guardrail set.
    #[must_use]
    pub fn with_guardrails(mut self, guardrails: GuardrailSet) -> Self {
        self.guardrails = guardrails;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RuntimeTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Thoughts currently being evaluated.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Evaluates one thought.
    ///
    /// Only [`CognosError::ThoughtAlreadyProcessing`] escapes; every other
    /// failure becomes a conservative DEFER or PONDER recorded in the trail.
    #[instrument(skip(self, thought), fields(thought_id = %thought.id, task_id = %thought.task_id))]
    pub async fn evaluate(&self, thought: &Thought) -> Result<PipelineOutcome, CognosError> {
        let _claim = self.claim(thought.id)?;
        let mut trail = Vec::new();
        let triaged = self.fan_out(thought, &mut trail).await;

        let mut selection_attempts = 1;
        let mut faculty_report = None;
        let result = match self.select(thought, &triaged, None).await {
            Ok(selected) => {
                trail.push(Self::selection_entry(&selected));
                self.validate(
                    thought,
                    &triaged,
                    selected,
                    &mut trail,
                    &mut selection_attempts,
                    &mut faculty_report,
                )
                .await
            }
            Err(err) => {
                let reason = fallback_reason(&err);
                trail.push(RationaleEntry::new(
                    RationaleStage::Fallback,
                    "action_selection",
                    false,
                    format!("{reason}: {err}"),
                ));
                ActionSelectionResult::fallback_defer(reason)
            }
        };

        let outcome = PipelineOutcome {
            thought_id: thought.id,
            result,
            dma_results: triaged.into_results(),
            trail,
            selection_attempts,
            faculty_report,
        };
        self.report(&outcome);
        Ok(outcome)
    }

    fn claim(&self, id: ThoughtId) -> Result<InFlight, CognosError> {
        if !self.in_flight.lock().insert(id) {
            return Err(CognosError::ThoughtAlreadyProcessing(id));
        }
        Ok(InFlight {
            claimed: Arc::clone(&self.in_flight),
            id,
        })
    }

    async fn fan_out(&self, thought: &Thought, trail: &mut Vec<RationaleEntry>) -> TriagedInputs {
        let timeout = self.config.evaluator_timeout();
        let runs = self.evaluators.iter().map(|evaluator| async move {
            match tokio::time::timeout(timeout, evaluator.evaluate(thought)).await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => DmaResult::degraded(evaluator.name(), evaluator.family(), err.to_string()),
                Err(_) => DmaResult::degraded(evaluator.name(), evaluator.family(), "evaluation_timeout"),
            }
        });
        let results = join_all(runs).await;
        for result in &results {
            trail.push(RationaleEntry::new(
                RationaleStage::Evaluation,
                result.evaluator_name.clone(),
                !result.degraded,
                result.rationale.clone(),
            ));
        }
        TriagedInputs::new(results)
    }

    async fn select(
        &self,
        thought: &Thought,
        triaged: &TriagedInputs,
        feedback: Option<&GuardrailFeedback>,
    ) -> Result<ActionSelectionResult, CognosError> {
        let timeout = self.config.selection_timeout();
        tokio::time::timeout(timeout, self.selector.select(thought, triaged, feedback))
            .await
            .map_err(|_| CognosError::EvaluationTimeout {
                operation: ActionSelector::PURPOSE.into(),
                timeout_ms: self.config.selection_timeout_ms,
            })?
    }

    async fn validate(
        &self,
        thought: &Thought,
        triaged: &TriagedInputs,
        mut current: ActionSelectionResult,
        trail: &mut Vec<RationaleEntry>,
        selection_attempts: &mut u32,
        faculty_report: &mut Option<FacultyReport>,
    ) -> ActionSelectionResult {
        let depth = self.config.recursion_depth();
        let mut recursions = 0;
        loop {
            let action = current.selected_action();
            if self.config.exempt_actions.contains(&action) {
                trail.push(RationaleEntry::new(
                    RationaleStage::Guardrail,
                    "exempt",
                    true,
                    format!("{action} skips guardrails"),
                ));
                current.guardrail_pass = true;
                return current;
            }

            let report = match self.faculties.assess(thought, &current).await {
                Ok(report) => report,
                Err(err) => {
                    trail.push(RationaleEntry::new(
                        RationaleStage::Fallback,
                        "faculties",
                        false,
                        format!("llm_unavailable: {err}"),
                    ));
                    return ActionSelectionResult::fallback_ponder("llm_unavailable");
                }
            };
            let verdict = self.guardrails.validate(&current, &report);
            let reasons = verdict.failure_reasons();
            trail.push(RationaleEntry::new(
                RationaleStage::Guardrail,
                "guardrails",
                verdict.passed,
                if verdict.passed {
                    format!("{action} passed every guardrail")
                } else {
                    reasons.join("; ")
                },
            ));
            *faculty_report = Some(report.clone());
            if verdict.passed {
                current.guardrail_pass = true;
                return current;
            }

            if recursions >= depth {
                let reason = format!("guardrail_violation: {}", reasons.join("; "));
                trail.push(RationaleEntry::new(
                    RationaleStage::Fallback,
                    "guardrails",
                    false,
                    reason.clone(),
                ));
                return ActionSelectionResult::fallback_defer(reason);
            }
            recursions += 1;

            let feedback = GuardrailFeedback {
                rejected_action: action,
                reasons,
                report,
            };
            *selection_attempts += 1;
            match self.select(thought, triaged, Some(&feedback)).await {
                Ok(next) => {
                    trail.push(Self::selection_entry(&next));
                    current = next;
                }
                Err(err) => {
                    let reason = fallback_reason(&err);
                    trail.push(RationaleEntry::new(
                        RationaleStage::Fallback,
                        "action_selection",
                        false,
                        format!("{reason}: {err}"),
                    ));
                    return if err.is_llm_unavailable() {
                        ActionSelectionResult::fallback_ponder(reason)
                    } else {
                        ActionSelectionResult::fallback_defer(reason)
                    };
                }
            }
        }
    }

    fn selection_entry(result: &ActionSelectionResult) -> RationaleEntry {
        RationaleEntry::new(
            RationaleStage::Selection,
            "action_selection",
            true,
            format!(
                "{} ({:.2}): {}",
                result.selected_action(),
                result.confidence,
                result.rationale
            ),
        )
    }

    fn report(&self, outcome: &PipelineOutcome) {
        let Some(tel) = &self.telemetry else {
            return;
        };
        let degraded: Vec<&str> = outcome
            .dma_results
            .iter()
            .filter(|result| result.degraded)
            .map(|result| result.evaluator_name.as_str())
            .collect();
        let payload = json!({
            "thought_id": outcome.thought_id,
            "action": outcome.result.selected_action(),
            "guardrail_pass": outcome.result.guardrail_pass,
            "selection_attempts": outcome.selection_attempts,
            "degraded": degraded,
            "fallback": outcome.used_fallback(),
        });
        let level = if outcome.used_fallback() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        let _ = tel.log(level, "dma.pipeline.completed", payload.clone());
        let _ = tel.event("dma.pipeline.completed", payload);
    }
}

fn fallback_reason(err: &CognosError) -> &'static str {
    if err.is_llm_unavailable() {
        "llm_unavailable"
    } else if err.is_timeout() {
        "evaluation_timeout"
    } else {
        "selection_failed"
    }
}
