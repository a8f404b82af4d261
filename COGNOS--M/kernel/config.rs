//! Runtime configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{action::HandlerAction, services::ServiceCategory, state::CognitiveState};

/// Hard upper bound on guardrail re-evaluation depth.
pub const MAX_GUARDRAIL_RECURSION: u8 = 1;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Bus timeouts.
    pub bus: BusConfig,
    /// Evaluation pipeline settings.
    pub dma: DmaConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Identity baseline loaded at WAKEUP.
    pub identity: IdentityConfig,
    /// Telemetry sinks.
    pub telemetry: TelemetryConfig,
}

impl RuntimeConfig {
    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading runtime config {}", path.display()))?;
        let config =
            Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.reset_timeout_secs == 0 {
            bail!("breaker.reset_timeout_secs must be positive");
        }
        if self.bus.default_timeout_ms == 0 {
            bail!("bus.default_timeout_ms must be positive");
        }
        for category in ServiceCategory::ALL {
            if self.bus.timeout_for(category).is_zero() {
                bail!("bus timeout for {category} must be positive");
            }
        }
        if self.dma.max_guardrail_recursion > MAX_GUARDRAIL_RECURSION {
            bail!(
                "dma.max_guardrail_recursion is capped at {MAX_GUARDRAIL_RECURSION}, got {}",
                self.dma.max_guardrail_recursion
            );
        }
        if self.dma.evaluator_timeout_ms == 0
            || self.dma.selection_timeout_ms == 0
            || self.dma.faculty_timeout_ms == 0
        {
            bail!("dma timeouts must be positive");
        }
        let llm = self.bus.timeout_for(ServiceCategory::Llm);
        for (name, deadline) in [
            ("evaluator_timeout_ms", self.dma.evaluator_timeout()),
            ("selection_timeout_ms", self.dma.selection_timeout()),
            ("faculty_timeout_ms", self.dma.faculty_timeout()),
        ] {
            if deadline <= llm {
                bail!(
                    "dma.{name} ({}ms) must exceed the llm bus timeout ({}ms)",
                    deadline.as_millis(),
                    llm.as_millis()
                );
            }
        }
        let g = &self.dma.guardrails;
        for (name, value) in [
            ("entropy_max", g.entropy_max),
            ("coherence_min", g.coherence_min),
            ("humility_min_certainty", g.humility_min_certainty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("dma.guardrails.{name} must be within [0, 1], got {value}");
            }
        }
        if g.optimization_veto_ratio <= 0.0 {
            bail!("dma.guardrails.optimization_veto_ratio must be positive");
        }
        let s = &self.scheduler;
        if s.max_active_thoughts == 0 || s.max_active_tasks == 0 {
            bail!("scheduler capacity caps must be at least 1");
        }
        if s.max_ponder_rounds == 0 || s.max_thought_depth == 0 {
            bail!("scheduler.max_ponder_rounds and max_thought_depth must be at least 1");
        }
        if !(s.variance_threshold > 0.0 && s.variance_threshold < 1.0) {
            bail!("scheduler.variance_threshold must be within (0, 1)");
        }
        if s.dream_deferral_step_secs == 0 {
            bail!("scheduler.dream_deferral_step_secs must be positive");
        }
        for entry in &s.whitelist_overrides {
            if !entry.allowed.contains(&HandlerAction::Defer) {
                bail!("whitelist override for {} must keep DEFER", entry.state);
            }
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Optional window; failures older than this restart the count.
    pub failure_window_secs: Option<u64>,
    /// Time an open breaker waits before allowing a probe.
    pub reset_timeout_secs: u64,
    /// Consecutive trips without recovery before the provider is unregistered.
    pub evict_after_trips: Option<u32>,
}

impl BreakerConfig {
    /// Failure window as a duration.
    #[must_use]
    pub fn failure_window(&self) -> Option<Duration> {
        self.failure_window_secs.map(Duration::from_secs)
    }

    /// Reset timeout as a duration.
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: None,
            reset_timeout_secs: 60,
            evict_after_trips: Some(10),
        }
    }
}

/// Per-category call deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Deadline used when a category has no override.
    pub default_timeout_ms: u64,
    /// LLM override.
    pub llm_timeout_ms: Option<u64>,
    /// Memory override.
    pub memory_timeout_ms: Option<u64>,
    /// Communication override.
    pub communication_timeout_ms: Option<u64>,
    /// Tool override.
    pub tool_timeout_ms: Option<u64>,
    /// Wise-authority override.
    pub wise_authority_timeout_ms: Option<u64>,
    /// Runtime-control override.
    pub runtime_control_timeout_ms: Option<u64>,
}

impl BusConfig {
    /// Deadline for one provider attempt in `category`.
    #[must_use]
    pub fn timeout_for(&self, category: ServiceCategory) -> Duration {
        let override_ms = match category {
            ServiceCategory::Llm => self.llm_timeout_ms,
            ServiceCategory::Memory => self.memory_timeout_ms,
            ServiceCategory::Communication => self.communication_timeout_ms,
            ServiceCategory::Tool => self.tool_timeout_ms,
            ServiceCategory::WiseAuthority => self.wise_authority_timeout_ms,
            ServiceCategory::RuntimeControl => self.runtime_control_timeout_ms,
        };
        Duration::from_millis(override_ms.unwrap_or(self.default_timeout_ms))
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            llm_timeout_ms: Some(10_000),
            memory_timeout_ms: None,
            communication_timeout_ms: None,
            tool_timeout_ms: None,
            wise_authority_timeout_ms: None,
            runtime_control_timeout_ms: Some(5_000),
        }
    }
}

/// Guardrail thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailConfig {
    /// Entropy must be at most this.
    pub entropy_max: f64,
    /// Coherence must be at least this.
    pub coherence_min: f64,
    /// Vetoes actions whose optimization ratio exceeds this.
    pub optimization_veto_ratio: f64,
    /// Non-deferring actions need at least this certainty.
    pub humility_min_certainty: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            entropy_max: 0.40,
            coherence_min: 0.60,
            optimization_veto_ratio: 10.0,
            humility_min_certainty: 0.5,
        }
    }
}

/// Domain evaluator declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainDmaConfig {
    /// Evaluator name.
    pub name: String,
    /// Domain label.
    pub domain: String,
    /// Domain knowledge appended to the evaluation prompt.
    #[serde(default)]
    pub knowledge: String,
}

/// Evaluation pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DmaConfig {
    /// Deadline for each fan-out evaluator.
    pub evaluator_timeout_ms: u64,
    /// Deadline for action selection.
    pub selection_timeout_ms: u64,
    /// Deadline for each epistemic faculty.
    pub faculty_timeout_ms: u64,
    /// Guardrail re-evaluation depth, at most [`MAX_GUARDRAIL_RECURSION`].
    pub max_guardrail_recursion: u8,
    /// Actions that skip faculties and guardrails.
    pub exempt_actions: Vec<HandlerAction>,
    /// Thresholds.
    pub guardrails: GuardrailConfig,
    /// Domain evaluators added to the fan-out.
    pub domains: Vec<DomainDmaConfig>,
}

impl DmaConfig {
    /// Fan-out deadline.
    #[must_use]
    pub const fn evaluator_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluator_timeout_ms)
    }

    /// Selection deadline.
    #[must_use]
    pub const fn selection_timeout(&self) -> Duration {
        Duration::from_millis(self.selection_timeout_ms)
    }

    /// Faculty deadline.
    #[must_use]
    pub const fn faculty_timeout(&self) -> Duration {
        Duration::from_millis(self.faculty_timeout_ms)
    }

    /// Recursion depth after clamping to the hard cap.
    #[must_use]
    pub fn recursion_depth(&self) -> u8 {
        self.max_guardrail_recursion.min(MAX_GUARDRAIL_RECURSION)
    }
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            evaluator_timeout_ms: 30_000,
            selection_timeout_ms: 45_000,
            faculty_timeout_ms: 15_000,
            max_guardrail_recursion: MAX_GUARDRAIL_RECURSION,
            exempt_actions: vec![
                HandlerAction::Observe,
                HandlerAction::Recall,
                HandlerAction::Defer,
                HandlerAction::Reject,
                HandlerAction::TaskComplete,
                HandlerAction::Ponder,
            ],
            guardrails: GuardrailConfig::default(),
            domains: Vec::new(),
        }
    }
}

/// Replacement whitelist for one state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhitelistOverride {
    /// State the whitelist applies to.
    pub state: CognitiveState,
    /// Allowed actions; must include DEFER.
    pub allowed: Vec<HandlerAction>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Pipelines allowed in flight.
    pub max_active_thoughts: usize,
    /// Tasks allowed to have thoughts in flight.
    pub max_active_tasks: usize,
    /// PONDER actions per task before forcing DEFER.
    pub max_ponder_rounds: u32,
    /// Continuation chain length before forcing DEFER.
    pub max_thought_depth: u32,
    /// Idle wait between rounds.
    pub round_interval_ms: u64,
    /// Idle WORK rounds before entering PLAY.
    pub play_after_idle_rounds: u64,
    /// Idle WORK rounds before entering SOLITUDE.
    pub solitude_after_idle_rounds: u64,
    /// PLAY rounds available between dreams.
    pub exploration_budget: u64,
    /// Delay between the end of a dream and the next invitation.
    pub dream_interval_secs: u64,
    /// Dream length.
    pub dream_duration_secs: u64,
    /// Postponement applied when the invitation is deferred.
    pub dream_deferral_step_secs: u64,
    /// How long past its due time an invitation may be deferred.
    pub dream_deferral_window_secs: u64,
    /// Variance ratio above which a review is escalated.
    pub variance_threshold: f64,
    /// Rounds between variance checks while dreaming.
    pub variance_check_rounds: u64,
    /// Grace period for in-flight pipelines at shutdown.
    pub shutdown_grace_ms: u64,
    /// How long terminal tasks stay live before archiving.
    pub task_retention_secs: u64,
    /// Archived tasks kept for status queries.
    pub archive_capacity: usize,
    /// Categories that must be healthy to leave WAKEUP.
    pub required_services: Vec<ServiceCategory>,
    /// Channel used by SPEAK and OBSERVE when neither the action nor the task names one.
    pub home_channel: Option<String>,
    /// Whitelist replacements.
    pub whitelist_overrides: Vec<WhitelistOverride>,
}

impl SchedulerConfig {
    /// Round interval as a duration.
    #[must_use]
    pub const fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }

    /// Shutdown grace as a duration.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_thoughts: 8,
            max_active_tasks: 4,
            max_ponder_rounds: 5,
            max_thought_depth: 7,
            round_interval_ms: 100,
            play_after_idle_rounds: 50,
            solitude_after_idle_rounds: 200,
            exploration_budget: 100,
            dream_interval_secs: 6 * 3600,
            dream_duration_secs: 30 * 60,
            dream_deferral_step_secs: 10 * 60,
            dream_deferral_window_secs: 2 * 3600,
            variance_threshold: 0.20,
            variance_check_rounds: 25,
            shutdown_grace_ms: 10_000,
            task_retention_secs: 3600,
            archive_capacity: 1024,
            required_services: vec![
                ServiceCategory::Llm,
                ServiceCategory::Communication,
                ServiceCategory::Memory,
            ],
            home_channel: None,
            whitelist_overrides: Vec::new(),
        }
    }
}

/// Identity baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Agent name.
    pub name: String,
    /// Tracked top-level attributes.
    pub attributes: IndexMap<String, String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let mut attributes = IndexMap::new();
        attributes.insert("purpose".into(), "assist the community it serves".into());
        attributes.insert("tone".into(), "calm and direct".into());
        attributes.insert("deferral_policy".into(), "defer when uncertain".into());
        Self {
            name: "cognos".into(),
            attributes,
        }
    }
}

/// Telemetry sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// JSON-lines log destination.
    pub log_path: Option<PathBuf>,
    /// JSON-lines event destination.
    pub event_log_path: Option<PathBuf>,
    /// Events retained by the in-memory bus.
    pub event_backlog: usize,
    /// Lowest level written to the log file.
    pub min_level: LogLevel,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log_path: None,
            event_backlog: 1024,
            min_level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.reset_timeout(), Duration::from_secs(60));
        assert_eq!(config.dma.recursion_depth(), 1);
        assert!((config.scheduler.variance_threshold - 0.20).abs() < f64::EPSILON);
        assert_eq!(
            config.bus.timeout_for(ServiceCategory::Tool),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn rejects_recursion_above_cap() {
        let err = RuntimeConfig::from_toml_str("[dma]\nmax_guardrail_recursion = 3\n").unwrap_err();
        assert!(err.to_string().contains("capped"));
    }

    #[test]
    fn rejects_whitelist_without_defer() {
        let raw = r#"
            [[scheduler.whitelist_overrides]]
            state = "DREAM"
            allowed = ["PONDER"]
        "#;
        assert!(RuntimeConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn stage_deadlines_must_outlast_the_llm_bus() {
        let defaults = RuntimeConfig::default();
        assert!(defaults.dma.faculty_timeout() > defaults.bus.timeout_for(ServiceCategory::Llm));

        let err = RuntimeConfig::from_toml_str("[bus]\nllm_timeout_ms = 60000\n").unwrap_err();
        assert!(err.to_string().contains("dma.evaluator_timeout_ms"));

        let err = RuntimeConfig::from_toml_str("[bus]\nllm_timeout_ms = 20000\n").unwrap_err();
        assert!(err.to_string().contains("dma.faculty_timeout_ms"));

        let raw = "[bus]\nllm_timeout_ms = 2000\n[dma]\nfaculty_timeout_ms = 2000\n";
        assert!(RuntimeConfig::from_toml_str(raw).is_err());

        let raw = "[bus]\nllm_timeout_ms = 2000\n[dma]\nfaculty_timeout_ms = 2001\n";
        assert!(RuntimeConfig::from_toml_str(raw).is_ok());
    }

    #[test]
    fn loads_sections_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cognos.toml");
        fs::write(
            &path,
            r#"
            [breaker]
            failure_threshold = 5

            [dma.guardrails]
            entropy_max = 0.8

            [[dma.domains]]
            name = "medical"
            domain = "triage"

            [scheduler]
            max_active_thoughts = 2
            required_services = ["llm"]

            [identity]
            name = "vigil"
            [identity.attributes]
            purpose = "watch"
            "#,
        )
        .unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!((config.dma.guardrails.entropy_max - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.dma.domains[0].name, "medical");
        assert_eq!(config.scheduler.required_services, vec![ServiceCategory::Llm]);
        assert_eq!(config.identity.name, "vigil");
        assert_eq!(config.identity.attributes.len(), 1);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RuntimeConfig::from_toml_str("[scheduler]\nmax_thoughts = 2\n").is_err());
    }
}
