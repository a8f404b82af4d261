use async_trait::async_trait;
use cognos_kernel::{
    action::{DmaFamily, DmaResult, DmaVerdict, EthicalDecision},
    services::LlmParams,
    thought::Thought,
    CognosError,
};
use cognos_servicebus::LlmBus;
use serde::Deserialize;

use super::{describe_thought, parse_json, Assessment, Evaluator};

#[derive(Debug, Deserialize)]
struct EthicalVerdict {
    decision: EthicalDecision,
    #[serde(default)]
    alignment: f32,
}

/// Checks a thought against the agent's principles.
#[derive(Debug, Clone)]
pub struct EthicalEvaluator {
    llm: LlmBus,
}

impl EthicalEvaluator {
    /// LLM purpose tag.
    pub const PURPOSE: &'static str = "dma.ethical";

    /// Creates the evaluator.
    #[must_use]
    pub const fn new(llm: LlmBus) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Evaluator for EthicalEvaluator {
    fn name(&self) -> &str {
        "ethical"
    }

    fn family(&self) -> DmaFamily {
        DmaFamily::Ethical
    }

    async fn evaluate(&self, thought: &Thought) -> Result<DmaResult, CognosError> {
        let prompt = format!(
            "{}\nJudge whether acting on this task is consistent with beneficence, non-maleficence, \
             integrity, transparency, autonomy and justice. Answer with JSON \
             {{\"decision\": \"approve|reject|ponder|defer\", \"alignment\": 0..1, \"confidence\": 0..1, \"rationale\": \"...\"}}.",
            describe_thought(thought)
        );
        let response = self
            .llm
            .generate(&prompt, &LlmParams::for_purpose(Self::PURPOSE))
            .await?;
        let parsed: Assessment<EthicalVerdict> = parse_json(self.name(), &response.text)?;
        Ok(DmaResult {
            evaluator_name: self.name().into(),
            verdict: DmaVerdict::Ethical {
                decision: parsed.verdict.decision,
                alignment: parsed.verdict.alignment.clamp(0.0, 1.0),
            },
            confidence: parsed.confidence.clamp(0.0, 1.0),
            rationale: parsed.rationale,
            degraded: false,
        })
    }
}
