//! Action selection over triaged evaluator results.

use std::fmt::Write as _;

use cognos_kernel::{
    action::{ActionSelectionResult, HandlerAction},
    services::LlmParams,
    thought::Thought,
    CognosError,
};
use cognos_servicebus::LlmBus;
use serde::{Deserialize, Serialize};

use crate::{
    evaluators::{describe_thought, parse_json, TriagedInputs},
    faculties::FacultyReport,
};

/// Guardrail failure handed back to the selector on re-selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailFeedback {
    /// Action that failed validation.
    pub rejected_action: HandlerAction,
    /// Failure reasons, one per failed guardrail.
    pub reasons: Vec<String>,
    /// Faculty scores of the failed attempt.
    pub report: FacultyReport,
}

/// Chooses exactly one action from the closed vocabulary.
#[derive(Debug, Clone)]
pub struct ActionSelector {
    llm: LlmBus,
}

impl ActionSelector {
    /// LLM purpose tag.
    pub const PURPOSE: &'static str = "dma.action_selection";

    /// Creates the selector.
    #[must_use]
    pub const fn new(llm: LlmBus) -> Self {
        Self { llm }
    }

    /// Selects an action. The returned result never claims to have passed guardrails.
    pub async fn select(
        &self,
        thought: &Thought,
        triaged: &TriagedInputs,
        feedback: Option<&GuardrailFeedback>,
    ) -> Result<ActionSelectionResult, CognosError> {
        let prompt = Self::prompt(thought, triaged, feedback);
        let response = self
            .llm
            .generate(&prompt, &LlmParams::for_purpose(Self::PURPOSE))
            .await?;
        let mut result: ActionSelectionResult = parse_json("action_selection", &response.text)?;
        result.confidence = result.confidence.clamp(0.0, 1.0);
        result.guardrail_pass = false;
        Ok(result)
    }

    fn prompt(thought: &Thought, triaged: &TriagedInputs, feedback: Option<&GuardrailFeedback>) -> String {
        let mut prompt = describe_thought(thought);
        prompt.push_str("\nEvaluations:\n");
        prompt.push_str(&triaged.summary());
        if let Some(feedback) = feedback {
            let _ = writeln!(
                prompt,
                "\nYour previous choice {} failed validation:",
                feedback.rejected_action
            );
            for reason in &feedback.reasons {
                let _ = writeln!(prompt, "- {reason}");
            }
            prompt.push_str(&feedback.report.summary());
        }
        let actions: Vec<&str> = HandlerAction::ALL.iter().map(|action| action.label()).collect();
        let _ = write!(
            prompt,
            "\nChoose exactly one action from [{}]. Answer with JSON \
             {{\"action\": \"...\", \"parameters\": {{...}}, \"confidence\": 0..1, \"rationale\": \"...\"}}.",
            actions.join(", ")
        );
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cognos_kernel::{
        config::{BreakerConfig, BusConfig},
        loopback::ScriptedLlm,
        services::ServiceProvider,
        ManualClock,
    };
    use cognos_servicebus::{RegistryContext, ServiceRegistration};

    use crate::evaluators::testing::thought;

    #[tokio::test]
    async fn feedback_reaches_the_prompt() {
        let registry = Arc::new(RegistryContext::new(
            BreakerConfig::default(),
            BusConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let llm = Arc::new(ScriptedLlm::new("model").with_response(
            ActionSelector::PURPOSE,
            r#"{"action":"PONDER","parameters":{"questions":["why?"]},"confidence":1.7,"rationale":"unsure","guardrail_pass":true}"#,
        ));
        registry.register(ServiceRegistration::new("model", ServiceProvider::Llm(llm.clone())));
        let selector = ActionSelector::new(LlmBus::new(registry));
        let feedback = GuardrailFeedback {
            rejected_action: HandlerAction::Speak,
            reasons: vec!["entropy 0.95 above 0.80".into()],
            report: FacultyReport::default(),
        };
        let result = selector
            .select(&thought("greet"), &TriagedInputs::default(), Some(&feedback))
            .await
            .unwrap();
        assert_eq!(result.selected_action(), HandlerAction::Ponder);
        assert!(!result.guardrail_pass);
        assert!((result.confidence - 1.0).abs() < f32::EPSILON);
        assert!(llm.calls()[0].prompt.contains("entropy 0.95 above 0.80"));
    }
}
