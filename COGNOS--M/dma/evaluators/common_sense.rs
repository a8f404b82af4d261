use async_trait::async_trait;
use cognos_kernel::{
    action::{DmaFamily, DmaResult, DmaVerdict},
    services::LlmParams,
    thought::Thought,
    CognosError,
};
use cognos_servicebus::LlmBus;
use serde::Deserialize;

use super::{describe_thought, parse_json, Assessment, Evaluator};

#[derive(Debug, Deserialize)]
struct PlausibilityVerdict {
    plausibility: f32,
    #[serde(default)]
    flags: Vec<String>,
}

/// Flags physically or socially implausible readings of a thought.
#[derive(Debug, Clone)]
pub struct CommonSenseEvaluator {
    llm: LlmBus,
}

impl CommonSenseEvaluator {
    /// LLM purpose tag.
    pub const PURPOSE: &'static str = "dma.common_sense";

    /// Creates the evaluator.
    #[must_use]
    pub const fn new(llm: LlmBus) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Evaluator for CommonSenseEvaluator {
    fn name(&self) -> &str {
        "common_sense"
    }

    fn family(&self) -> DmaFamily {
        DmaFamily::CommonSense
    }

    async fn evaluate(&self, thought: &Thought) -> Result<DmaResult, CognosError> {
        let prompt = format!(
            "{}\nRate how plausible and coherent this task is given ordinary physical and social \
             expectations. Answer with JSON \
             {{\"plausibility\": 0..1, \"flags\": [\"...\"], \"confidence\": 0..1, \"rationale\": \"...\"}}.",
            describe_thought(thought)
        );
        let response = self
            .llm
            .generate(&prompt, &LlmParams::for_purpose(Self::PURPOSE))
            .await?;
        let parsed: Assessment<PlausibilityVerdict> = parse_json(self.name(), &response.text)?;
        Ok(DmaResult {
            evaluator_name: self.name().into(),
            verdict: DmaVerdict::CommonSense {
                plausibility: parsed.verdict.plausibility.clamp(0.0, 1.0),
                flags: parsed.verdict.flags,
            },
            confidence: parsed.confidence.clamp(0.0, 1.0),
            rationale: parsed.rationale,
            degraded: false,
        })
    }
}
