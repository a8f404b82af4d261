//! Threshold checks applied to a selected action before dispatch.

use std::{fmt, sync::Arc};

use cognos_kernel::{action::ActionSelectionResult, config::GuardrailConfig};
use serde::{Deserialize, Serialize};

use crate::faculties::{Faculty, FacultyReport};

/// Outcome from one guardrail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailFinding {
    /// Guardrail name.
    pub guardrail: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Notes for the rationale trail.
    pub detail: String,
}

/// Contract implemented by every guardrail.
pub trait Guardrail: Send + Sync {
    /// Guardrail name.
    fn name(&self) -> &str;

    /// Checks the selected action against the faculty scores.
    fn check(&self, result: &ActionSelectionResult, report: &FacultyReport) -> GuardrailFinding;
}

fn finding(guardrail: &dyn Guardrail, passed: bool, detail: String) -> GuardrailFinding {
    GuardrailFinding {
        guardrail: guardrail.name().into(),
        passed,
        detail,
    }
}

fn missing(guardrail: &dyn Guardrail, faculty: Faculty, report: &FacultyReport) -> GuardrailFinding {
    let reason = report
        .unavailable
        .get(&faculty)
        .map_or("not scored", String::as_str);
    finding(guardrail, false, format!("{} unavailable: {reason}", faculty.label()))
}

/// Entropy must not exceed the configured maximum.
#[derive(Debug, Clone)]
pub struct EntropyGuardrail {
    max: f64,
}

impl EntropyGuardrail {
    /// Creates the guardrail.
    #[must_use]
    pub const fn new(max: f64) -> Self {
        Self { max }
    }
}

impl Guardrail for EntropyGuardrail {
    fn name(&self) -> &str {
        "entropy"
    }

    fn check(&self, _result: &ActionSelectionResult, report: &FacultyReport) -> GuardrailFinding {
        match report.score(Faculty::Entropy) {
            Some(score) if score <= self.max => {
                finding(self, true, format!("entropy {score:.2} within {:.2}", self.max))
            }
            Some(score) => finding(self, false, format!("entropy {score:.2} above {:.2}", self.max)),
            None => missing(self, Faculty::Entropy, report),
        }
    }
}

/// Coherence must reach the configured minimum.
#[derive(Debug, Clone)]
pub struct CoherenceGuardrail {
    min: f64,
}

impl CoherenceGuardrail {
    /// Creates the guardrail.
    #[must_use]
    pub const fn new(min: f64) -> Self {
        Self { min }
    }
}

impl Guardrail for CoherenceGuardrail {
    fn name(&self) -> &str {
        "coherence"
    }

    fn check(&self, _result: &ActionSelectionResult, report: &FacultyReport) -> GuardrailFinding {
        match report.score(Faculty::Coherence) {
            Some(score) if score >= self.min => {
                finding(self, true, format!("coherence {score:.2} meets {:.2}", self.min))
            }
            Some(score) => finding(self, false, format!("coherence {score:.2} below {:.2}", self.min)),
            None => missing(self, Faculty::Coherence, report),
        }
    }
}

/// Vetoes actions whose gain-to-side-effect ratio is implausibly high.
#[derive(Debug, Clone)]
pub struct OptimizationVetoGuardrail {
    max_ratio: f64,
}

impl OptimizationVetoGuardrail {
    /// Creates the guardrail.
    #[must_use]
    pub const fn new(max_ratio: f64) -> Self {
        Self { max_ratio }
    }
}

impl Guardrail for OptimizationVetoGuardrail {
    fn name(&self) -> &str {
        "optimization_veto"
    }

    fn check(&self, _result: &ActionSelectionResult, report: &FacultyReport) -> GuardrailFinding {
        match report.score(Faculty::OptimizationVeto) {
            Some(ratio) if ratio <= self.max_ratio => {
                finding(self, true, format!("ratio {ratio:.2} within {:.2}", self.max_ratio))
            }
            Some(ratio) => finding(
                self,
                false,
                format!("ratio {ratio:.2} above veto limit {:.2}", self.max_ratio),
            ),
            None => missing(self, Faculty::OptimizationVeto, report),
        }
    }
}

/// Requires enough certainty, in both the faculty score and the selector's
/// own confidence, before acting.
#[derive(Debug, Clone)]
pub struct EpistemicHumilityGuardrail {
    min_certainty: f64,
}

impl EpistemicHumilityGuardrail {
    /// Creates the guardrail.
    #[must_use]
    pub const fn new(min_certainty: f64) -> Self {
        Self { min_certainty }
    }
}

impl Guardrail for EpistemicHumilityGuardrail {
    fn name(&self) -> &str {
        "epistemic_humility"
    }

    fn check(&self, result: &ActionSelectionResult, report: &FacultyReport) -> GuardrailFinding {
        let Some(certainty) = report.score(Faculty::EpistemicHumility) else {
            return missing(self, Faculty::EpistemicHumility, report);
        };
        let confidence = f64::from(result.confidence);
        if certainty < self.min_certainty {
            finding(
                self,
                false,
                format!("certainty {certainty:.2} below {:.2}", self.min_certainty),
            )
        } else if confidence < self.min_certainty {
            finding(
                self,
                false,
                format!("selection confidence {confidence:.2} below {:.2}", self.min_certainty),
            )
        } else {
            finding(self, true, format!("certainty {certainty:.2} meets {:.2}", self.min_certainty))
        }
    }
}

/// Result of running every guardrail once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    /// Whether every guardrail passed.
    pub passed: bool,
    /// One finding per guardrail.
    pub findings: Vec<GuardrailFinding>,
}

impl GuardrailVerdict {
    /// Details of failed guardrails.
    #[must_use]
    pub fn failure_reasons(&self) -> Vec<String> {
        self.findings
            .iter()
            .filter(|finding| !finding.passed)
            .map(|finding| format!("{}: {}", finding.guardrail, finding.detail))
            .collect()
    }
}

/// Ordered collection of guardrails.
#[derive(Clone)]
pub struct GuardrailSet {
    checks: Vec<Arc<dyn Guardrail>>,
}

impl fmt::Debug for GuardrailSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.checks.iter().map(|check| check.name()).collect();
        f.debug_struct("GuardrailSet").field("checks", &names).finish()
    }
}

impl GuardrailSet {
    /// The four threshold guardrails.
    #[must_use]
    pub fn from_config(config: &GuardrailConfig) -> Self {
        Self {
            checks: vec![
                Arc::new(EntropyGuardrail::new(config.entropy_max)),
                Arc::new(CoherenceGuardrail::new(config.coherence_min)),
                Arc::new(OptimizationVetoGuardrail::new(config.optimization_veto_ratio)),
                Arc::new(EpistemicHumilityGuardrail::new(config.humility_min_certainty)),
            ],
        }
    }

    /// Adds a guardrail.
    #[must_use]
    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.checks.push(guardrail);
        self
    }

    /// Runs every guardrail.
    #[must_use]
    pub fn validate(&self, result: &ActionSelectionResult, report: &FacultyReport) -> GuardrailVerdict {
        let findings: Vec<GuardrailFinding> = self
            .checks
            .iter()
            .map(|check| check.check(result, report))
            .collect();
        GuardrailVerdict {
            passed: findings.iter().all(|finding| finding.passed),
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognos_kernel::action::{ActionParams, SpeakParams};

    fn speak(confidence: f32) -> ActionSelectionResult {
        ActionSelectionResult::new(
            ActionParams::Speak(SpeakParams {
                channel_id: None,
                content: "hello".into(),
            }),
            confidence,
            "greet",
        )
    }

    fn passing_report() -> FacultyReport {
        FacultyReport::default()
            .with_score(Faculty::Entropy, 0.1)
            .with_score(Faculty::Coherence, 0.9)
            .with_score(Faculty::OptimizationVeto, 1.0)
            .with_score(Faculty::EpistemicHumility, 0.9)
    }

    #[test]
    fn defaults_pass_a_calm_action() {
        let set = GuardrailSet::from_config(&GuardrailConfig::default());
        let verdict = set.validate(&speak(0.9), &passing_report());
        assert!(verdict.passed);
        assert_eq!(verdict.findings.len(), 4);
    }

    #[test]
    fn high_entropy_fails() {
        let set = GuardrailSet::from_config(&GuardrailConfig {
            entropy_max: 0.8,
            ..GuardrailConfig::default()
        });
        let report = passing_report().with_score(Faculty::Entropy, 0.95);
        let verdict = set.validate(&speak(0.9), &report);
        assert!(!verdict.passed);
        assert_eq!(verdict.failure_reasons(), vec!["entropy: entropy 0.95 above 0.80"]);
    }

    #[test]
    fn missing_scores_and_low_confidence_fail() {
        let set = GuardrailSet::from_config(&GuardrailConfig::default());
        let verdict = set.validate(&speak(0.9), &FacultyReport::default());
        assert_eq!(verdict.failure_reasons().len(), 4);

        let verdict = set.validate(&speak(0.2), &passing_report());
        assert_eq!(verdict.failure_reasons().len(), 1);
        assert!(verdict.failure_reasons()[0].contains("selection confidence"));
    }

    #[test]
    fn veto_and_coherence_thresholds() {
        let set = GuardrailSet::from_config(&GuardrailConfig::default());
        let report = passing_report()
            .with_score(Faculty::OptimizationVeto, 25.0)
            .with_score(Faculty::Coherence, 0.3);
        let reasons = set.validate(&speak(0.9), &report).failure_reasons();
        assert_eq!(reasons.len(), 2);
    }
}
