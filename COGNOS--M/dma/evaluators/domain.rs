use async_trait::async_trait;
use cognos_kernel::{
    action::{DmaFamily, DmaResult, DmaVerdict, HandlerAction},
    services::LlmParams,
    thought::Thought,
    CognosError,
};
use cognos_servicebus::LlmBus;
use serde::Deserialize;

use super::{describe_thought, parse_json, Assessment, Evaluator};

#[derive(Debug, Deserialize)]
struct DomainVerdict {
    score: f32,
    #[serde(default)]
    recommendation: Option<HandlerAction>,
}

/// Scores a thought against one domain's knowledge.
#[derive(Debug, Clone)]
pub struct DomainEvaluator {
    llm: LlmBus,
    name: String,
    domain: String,
    knowledge: String,
    purpose: String,
}

impl DomainEvaluator {
    /// Creates an evaluator whose LLM purpose is `dma.domain.<name>`.
    #[must_use]
    pub fn new(llm: LlmBus, name: String, domain: String, knowledge: String) -> Self {
        let purpose = format!("dma.domain.{name}");
        Self {
            llm,
            name,
            domain,
            knowledge,
            purpose,
        }
    }
}

#[async_trait]
impl Evaluator for DomainEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DmaFamily {
        DmaFamily::Domain
    }

    async fn evaluate(&self, thought: &Thought) -> Result<DmaResult, CognosError> {
        let prompt = format!(
            "{}\nDomain: {}\n{}\nScore how well acting on this task fits the domain and optionally \
             recommend one action. Answer with JSON \
             {{\"score\": 0..1, \"recommendation\": \"SPEAK|...|null\", \"confidence\": 0..1, \"rationale\": \"...\"}}.",
            describe_thought(thought),
            self.domain,
            self.knowledge
        );
        let response = self
            .llm
            .generate(&prompt, &LlmParams::for_purpose(self.purpose.clone()))
            .await?;
        let parsed: Assessment<DomainVerdict> = parse_json(&self.name, &response.text)?;
        Ok(DmaResult {
            evaluator_name: self.name.clone(),
            verdict: DmaVerdict::Domain {
                domain: self.domain.clone(),
                score: parsed.verdict.score.clamp(0.0, 1.0),
                recommendation: parsed.verdict.recommendation,
            },
            confidence: parsed.confidence.clamp(0.0, 1.0),
            rationale: parsed.rationale,
            degraded: false,
        })
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
    async fn domain_response_is_typed() {
        let registry = Arc::new(RegistryContext::new(
            BreakerConfig::default(),
            BusConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let llm = ScriptedLlm::new("model").with_response(
            "dma.domain.triage",
            r#"{"score": 1.4, "recommendation": "SPEAK", "confidence": 0.7, "rationale": "routine"}"#,
        );
        registry.register(ServiceRegistration::new("model", ServiceProvider::Llm(Arc::new(llm))));
        let evaluator = DomainEvaluator::new(
            LlmBus::new(registry),
            "triage".into(),
            "support".into(),
            String::new(),
        );
        let result = evaluator.evaluate(&thought("reset my password")).await.unwrap();
        match result.verdict {
            DmaVerdict::Domain { score, recommendation, .. } => {
                assert!((score - 1.0).abs() < f32::EPSILON);
                assert_eq!(recommendation, Some(HandlerAction::Speak));
            }
            other => panic!("unexpected verdict {other:?}"),
        }
    }
}
