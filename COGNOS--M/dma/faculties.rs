//! Epistemic faculties: scorers run concurrently over a selected action.

use std::{fmt::Write as _, time::Duration};

use cognos_kernel::{
    action::ActionSelectionResult,
    services::{LlmParams, ServiceCategory},
    thought::Thought,
    CognosError,
};
use cognos_servicebus::LlmBus;
use futures::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::evaluators::{describe_thought, parse_json};

/// One epistemic scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Faculty {
    /// Uncertainty of the action; lower is better.
    Entropy,
    /// Consistency with the agent's identity and history; higher is better.
    Coherence,
    /// Ratio of expected gain to side effects; very high ratios are vetoed.
    OptimizationVeto,
    /// Certainty that the agent knows enough to act.
    EpistemicHumility,
}

impl Faculty {
    /// Every faculty.
    pub const ALL: [Self; 4] = [
        Self::Entropy,
        Self::Coherence,
        Self::OptimizationVeto,
        Self::EpistemicHumility,
    ];

    /// Snake-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Entropy => "entropy",
            Self::Coherence => "coherence",
            Self::OptimizationVeto => "optimization_veto",
            Self::EpistemicHumility => "epistemic_humility",
        }
    }

    /// LLM purpose tag.
    #[must_use]
    pub fn purpose(self) -> String {
        format!("faculty.{}", self.label())
    }

    const fn question(self) -> &'static str {
        match self {
            Self::Entropy => "How chaotic or surprising is this action? Score 0 (orderly) to 1 (chaotic).",
            Self::Coherence => "How consistent is this action with the agent's identity and prior conduct? Score 0 to 1.",
            Self::OptimizationVeto => "Estimate the ratio of the action's intended gain to its potential side effects. Score is the ratio.",
            Self::EpistemicHumility => "How certain can the agent be that it knows enough to take this action? Score 0 to 1.",
        }
    }
}

/// Score from one faculty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacultyScore {
    /// Raw score.
    pub score: f64,
    /// Explanation.
    #[serde(default)]
    pub rationale: String,
}

/// Scores of every faculty that answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacultyReport {
    /// Answered faculties.
    pub scores: IndexMap<Faculty, FacultyScore>,
    /// Faculties that timed out or failed, with the reason.
    pub unavailable: IndexMap<Faculty, String>,
}

impl FacultyReport {
    /// Score of one faculty.
    #[must_use]
    pub fn score(&self, faculty: Faculty) -> Option<f64> {
        self.scores.get(&faculty).map(|score| score.score)
    }

    /// Records a score.
    #[must_use]
    pub fn with_score(mut self, faculty: Faculty, score: f64) -> Self {
        self.scores.insert(
            faculty,
            FacultyScore {
                score,
                rationale: String::new(),
            },
        );
        self
    }

    /// One line per faculty for prompts.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (faculty, score) in &self.scores {
            let _ = writeln!(out, "{}: {:.2} ({})", faculty.label(), score.score, score.rationale);
        }
        for (faculty, reason) in &self.unavailable {
            let _ = writeln!(out, "{}: unavailable ({reason})", faculty.label());
        }
        out
    }
}

/// Runs every faculty concurrently, each under its own deadline.
#[derive(Debug, Clone)]
pub struct FacultyRunner {
    llm: LlmBus,
    timeout: Duration,
}

impl FacultyRunner {
    /// Creates the runner.
    #[must_use]
    pub const fn new(llm: LlmBus, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Scores `result`. Fails only when the LLM bus has no provider at all.
    pub async fn assess(
        &self,
        thought: &Thought,
        result: &ActionSelectionResult,
    ) -> Result<FacultyReport, CognosError> {
        let action = serde_json::to_string(&result.params).unwrap_or_default();
        let context = describe_thought(thought);
        let runs = Faculty::ALL.into_iter().map(|faculty| {
            let prompt = format!(
                "{context}\nProposed action: {action}\nRationale: {}\n{}\nAnswer with JSON {{\"score\": number, \"rationale\": \"...\"}}.",
                result.rationale,
                faculty.question()
            );
            async move {
                let outcome = tokio::time::timeout(self.timeout, self.score_one(faculty, &prompt)).await;
                (faculty, outcome)
            }
        });

        let mut report = FacultyReport::default();
        let mut llm_unavailable = false;
        for (faculty, outcome) in join_all(runs).await {
            match outcome {
                Ok(Ok(score)) => {
                    report.scores.insert(faculty, score);
                }
                Ok(Err(err)) => {
                    llm_unavailable |= err.is_llm_unavailable();
                    report.unavailable.insert(faculty, err.to_string());
                }
                Err(_) => {
                    report.unavailable.insert(faculty, "evaluation_timeout".into());
                }
            }
        }
        if llm_unavailable {
            return Err(CognosError::ServiceUnavailable(ServiceCategory::Llm));
        }
        Ok(report)
    }

    async fn score_one(&self, faculty: Faculty, prompt: &str) -> Result<FacultyScore, CognosError> {
        let response = self
            .llm
            .generate(prompt, &LlmParams::for_purpose(faculty.purpose()))
            .await?;
        parse_json(faculty.label(), &response.text)
    }
}
