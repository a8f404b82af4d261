//! Evaluators run in parallel over a thought before action selection.

/// Common-sense evaluator.
pub mod common_sense;
/// Domain-specific evaluators.
pub mod domain;
/// Ethical evaluator.
pub mod ethical;

use std::{fmt::Write as _, sync::Arc};

use async_trait::async_trait;
use cognos_kernel::{
    action::{DmaFamily, DmaResult},
    config::DmaConfig,
    thought::Thought,
    CognosError,
};
use cognos_servicebus::LlmBus;
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use common_sense::CommonSenseEvaluator;
pub use domain::DomainEvaluator;
pub use ethical::EthicalEvaluator;

/// Contract implemented by every fan-out evaluator.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Name used as the key in [`TriagedInputs`].
    fn name(&self) -> &str;

    /// Family reported when the evaluator degrades.
    fn family(&self) -> DmaFamily;

    /// Scores one thought.
    async fn evaluate(&self, thought: &Thought) -> Result<DmaResult, CognosError>;
}

/// Ethical, common-sense and configured domain evaluators.
#[must_use]
pub fn default_evaluators(llm: &LlmBus, config: &DmaConfig) -> Vec<Arc<dyn Evaluator>> {
    let mut evaluators: Vec<Arc<dyn Evaluator>> = vec![
        Arc::new(EthicalEvaluator::new(llm.clone())),
        Arc::new(CommonSenseEvaluator::new(llm.clone())),
    ];
    for domain in &config.domains {
        evaluators.push(Arc::new(DomainEvaluator::new(
            llm.clone(),
            domain.name.clone(),
            domain.domain.clone(),
            domain.knowledge.clone(),
        )));
    }
    evaluators
}

/// Every evaluator result keyed by evaluator name, degraded ones included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriagedInputs {
    results: IndexMap<String, DmaResult>,
}

impl TriagedInputs {
    /// Collects results in fan-out order.
    #[must_use]
    pub fn new(results: Vec<DmaResult>) -> Self {
        Self {
            results: results
                .into_iter()
                .map(|result| (result.evaluator_name.clone(), result))
                .collect(),
        }
    }

    /// Result of one evaluator.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DmaResult> {
        self.results.get(name)
    }

    /// Every result.
    pub fn iter(&self) -> impl Iterator<Item = &DmaResult> {
        self.results.values()
    }

    /// Names of degraded evaluators.
    #[must_use]
    pub fn degraded(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|result| result.degraded)
            .map(|result| result.evaluator_name.as_str())
            .collect()
    }

    /// Number of results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no evaluator ran.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Consumes the triage into the raw results.
    #[must_use]
    pub fn into_results(self) -> Vec<DmaResult> {
        self.results.into_values().collect()
    }

    /// One line per evaluator for prompts.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for result in self.results.values() {
            let verdict = serde_json::to_string(&result.verdict).unwrap_or_default();
            let _ = writeln!(
                out,
                "- {} (confidence {:.2}{}): {} | {}",
                result.evaluator_name,
                result.confidence,
                if result.degraded { ", DEGRADED" } else { "" },
                verdict,
                result.rationale
            );
        }
        out
    }
}

/// Renders the thought context shared by every prompt.
#[must_use]
pub fn describe_thought(thought: &Thought) -> String {
    let context = &thought.context;
    let mut out = format!(
        "Task: {}\nKind: {:?}\nState: {}\nDepth: {}\n",
        context.task_description, context.task_kind, context.cognitive_state, context.depth
    );
    if let Some(channel) = &context.channel_id {
        let _ = writeln!(out, "Channel: {channel}");
    }
    for (key, value) in &context.attributes {
        let _ = writeln!(out, "Attribute {key}: {value}");
    }
    for note in &context.ponder_notes {
        let _ = writeln!(out, "Earlier question: {note}");
    }
    for observation in &context.observations {
        let _ = writeln!(out, "Observation: {observation}");
    }
    out
}

/// Parses the first JSON object found in a model response.
pub fn parse_json<T: DeserializeOwned>(source: &str, text: &str) -> Result<T, CognosError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start <= end => &text[start..=end],
        _ => text,
    };
    serde_json::from_str(body).map_err(|err| CognosError::Provider {
        provider: source.to_string(),
        message: format!("unparseable response: {err}"),
    })
}

/// Fields shared by every evaluator response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Assessment<T> {
    #[serde(flatten)]
    pub verdict: T,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use cognos_kernel::{
        task::{Task, TaskSpec},
        thought::{ContextSnapshot, Thought, ThoughtType},
        CognitiveState,
    };

    pub fn thought(description: &str) -> Thought {
        let task = Task::new(TaskSpec::new(description).with_channel("general"), 1, Utc::now());
        let context = ContextSnapshot::for_task(&task, CognitiveState::Work, 1, Utc::now());
        Thought::new(task.id, ThoughtType::Initial, 1, 0, context, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognos_kernel::action::DmaVerdict;

    #[test]
    fn parse_json_ignores_surrounding_prose() {
        let value: serde_json::Value =
            parse_json("test", "Sure! {\"score\": 0.4} hope that helps").unwrap();
        assert_eq!(value["score"], 0.4);
        assert!(parse_json::<serde_json::Value>("test", "no json here").is_err());
    }

    #[test]
    fn triage_keeps_degraded_results_visible() {
        let triaged = TriagedInputs::new(vec![
            DmaResult {
                evaluator_name: "ethical".into(),
                verdict: DmaVerdict::CommonSense {
                    plausibility: 0.9,
                    flags: Vec::new(),
                },
                confidence: 0.9,
                rationale: "fine".into(),
                degraded: false,
            },
            DmaResult::degraded("common_sense", DmaFamily::CommonSense, "evaluation_timeout"),
        ]);
        assert_eq!(triaged.len(), 2);
        assert_eq!(triaged.degraded(), vec!["common_sense"]);
        assert!(triaged.summary().contains("DEGRADED"));
    }
}
