//! Provider tables and the dispatch loop shared by every bus.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use cognos_kernel::{
    clock::Clock,
    config::{BreakerConfig, BusConfig, RuntimeConfig},
    error::ProviderError,
    services::{ServiceCategory, ServiceProvider},
    telemetry::RuntimeTelemetry,
    CognosError,
};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};

/// Provider priority inside a priority group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderPriority {
    /// Tried first.
    High,
    /// Default.
    #[default]
    Normal,
    /// Tried last.
    Low,
}

/// Capabilities a category's providers advertise unless told otherwise.
#[must_use]
pub const fn default_capabilities(category: ServiceCategory) -> &'static [&'static str] {
    match category {
        ServiceCategory::Memory => &["memorize", "recall", "forget"],
        ServiceCategory::Llm => &["generate"],
        ServiceCategory::Communication => &["send_message", "fetch_messages"],
        ServiceCategory::Tool => &["execute_tool", "list_tools"],
        ServiceCategory::WiseAuthority => &["fetch_guidance", "send_deferral"],
        ServiceCategory::RuntimeControl => &["notify_state_transition", "publish_status"],
    }
}

/// Registration request for one provider.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    /// Category the provider is registered under.
    pub category: ServiceCategory,
    /// Unique handle across every category.
    pub handle: String,
    /// Lower groups are tried first.
    pub priority_group: i32,
    /// Priority inside the group.
    pub priority: ProviderPriority,
    /// Advertised capabilities.
    pub capabilities: BTreeSet<String>,
    /// Provider object.
    pub provider: ServiceProvider,
}

impl ServiceRegistration {
    /// Registration in group 0 with NORMAL priority and the category's default capabilities.
    #[must_use]
    pub fn new(handle: impl Into<String>, provider: ServiceProvider) -> Self {
        let category = provider.category();
        Self {
            category,
            handle: handle.into(),
            priority_group: 0,
            priority: ProviderPriority::Normal,
            capabilities: default_capabilities(category)
                .iter()
                .map(|capability| (*capability).to_string())
                .collect(),
            provider,
        }
    }

    /// Sets the priority group.
    #[must_use]
    pub const fn with_group(mut self, priority_group: i32) -> Self {
        self.priority_group = priority_group;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: ProviderPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replaces the advertised capabilities.
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the declared category; mismatches are refused at registration.
    #[must_use]
    pub const fn with_category(mut self, category: ServiceCategory) -> Self {
        self.category = category;
        self
    }
}

struct ProviderEntry {
    registration: ServiceRegistration,
    sequence: u64,
    breaker: CircuitBreaker,
    last_used: AtomicU64,
}

impl ProviderEntry {
    fn rank(&self) -> (i32, ProviderPriority, u64, u64) {
        (
            self.registration.priority_group,
            self.registration.priority,
            self.last_used.load(Ordering::SeqCst),
            self.sequence,
        )
    }
}

/// Read-only view of a registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    /// Handle.
    pub handle: String,
    /// Priority group.
    pub priority_group: i32,
    /// Priority.
    pub priority: ProviderPriority,
    /// Breaker counters.
    pub breaker: BreakerSnapshot,
    /// Dispatch stamp of the last attempt; 0 when never used.
    pub last_used: u64,
}

/// Health of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryHealth {
    /// Registered providers.
    pub registered: usize,
    /// Providers reporting healthy with a breaker that is not OPEN.
    pub healthy: usize,
}

/// Result of [`RegistryContext::health_report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Per required category.
    pub categories: IndexMap<ServiceCategory, CategoryHealth>,
}

impl HealthReport {
    /// Whether every required category has a healthy provider.
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.categories.values().all(|health| health.healthy > 0)
    }

    /// Required categories without a healthy provider.
    #[must_use]
    pub fn missing(&self) -> Vec<ServiceCategory> {
        self.categories
            .iter()
            .filter(|(_, health)| health.healthy == 0)
            .map(|(category, _)| *category)
            .collect()
    }
}

enum AttemptOutcome {
    Success,
    Failure(String),
    Timeout,
}

impl AttemptOutcome {
    const fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
            Self::Timeout => "timeout",
        }
    }
}

/// Owns the provider table of every category.
///
/// Each category table sits behind its own `RwLock`; each provider has its own
/// breaker lock and an atomic LRU stamp.
pub struct RegistryContext {
    tables: HashMap<ServiceCategory, RwLock<Vec<Arc<ProviderEntry>>>>,
    breaker_config: BreakerConfig,
    bus_config: BusConfig,
    clock: Arc<dyn Clock>,
    telemetry: Option<RuntimeTelemetry>,
    sequence: AtomicU64,
    stamp: AtomicU64,
}

impl fmt::Debug for RegistryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: IndexMap<ServiceCategory, usize> = ServiceCategory::ALL
            .iter()
            .map(|category| (*category, self.table(*category).read().len()))
            .collect();
        f.debug_struct("RegistryContext")
            .field("providers", &counts)
            .finish()
    }
}

impl RegistryContext {
    /// Creates empty tables.
    #[must_use]
    pub fn new(breaker_config: BreakerConfig, bus_config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: ServiceCategory::ALL
                .iter()
                .map(|category| (*category, RwLock::new(Vec::new())))
                .collect(),
            breaker_config,
            bus_config,
            clock,
            telemetry: None,
            sequence: AtomicU64::new(0),
            stamp: AtomicU64::new(0),
        }
    }

    /// Creates empty tables from the runtime configuration.
    #[must_use]
    pub fn from_config(config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.breaker.clone(), config.bus.clone(), clock)
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: RuntimeTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn table(&self, category: ServiceCategory) -> &RwLock<Vec<Arc<ProviderEntry>>> {
        // Every category is inserted by the constructor.
        &self.tables[&category]
    }

    /// Registers a provider; refuses duplicate handles and category mismatches.
    pub fn register(&self, registration: ServiceRegistration) -> bool {
        if registration.provider.category() != registration.category {
            self.log(
                LogLevel::Warn,
                "bus.register.category_mismatch",
                json!({ "handle": registration.handle, "declared": registration.category, "actual": registration.provider.category() }),
            );
            return false;
        }
        if self.contains(&registration.handle) {
            self.log(
                LogLevel::Warn,
                "bus.register.duplicate",
                json!({ "handle": registration.handle }),
            );
            return false;
        }
        let category = registration.category;
        let handle = registration.handle.clone();
        let entry = Arc::new(ProviderEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            breaker: CircuitBreaker::new(self.breaker_config.clone(), Arc::clone(&self.clock)),
            last_used: AtomicU64::new(0),
            registration,
        });
        self.table(category).write().push(entry);
        self.log(
            LogLevel::Info,
            "bus.register",
            json!({ "handle": handle, "category": category }),
        );
        true
    }

    /// Removes a provider from whichever category holds it.
    pub fn unregister(&self, handle: &str) -> bool {
        for category in ServiceCategory::ALL {
            let mut table = self.table(category).write();
            if let Some(idx) = table.iter().position(|entry| entry.registration.handle == handle) {
                table.remove(idx);
                drop(table);
                self.log(
                    LogLevel::Info,
                    "bus.unregister",
                    json!({ "handle": handle, "category": category }),
                );
                return true;
            }
        }
        false
    }

    /// Whether a handle is registered in any category.
    #[must_use]
    pub fn contains(&self, handle: &str) -> bool {
        ServiceCategory::ALL.iter().any(|category| {
            self.table(*category)
                .read()
                .iter()
                .any(|entry| entry.registration.handle == handle)
        })
    }

    /// Providers of a category in registration order.
    #[must_use]
    pub fn providers(&self, category: ServiceCategory) -> Vec<ProviderSnapshot> {
        self.table(category)
            .read()
            .iter()
            .map(|entry| ProviderSnapshot {
                handle: entry.registration.handle.clone(),
                priority_group: entry.registration.priority_group,
                priority: entry.registration.priority,
                breaker: entry.breaker.snapshot(),
                last_used: entry.last_used.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Checks that every required category has a provider that reports
    /// healthy and whose breaker is not OPEN.
    pub async fn health_report(&self, required: &[ServiceCategory]) -> HealthReport {
        let mut categories = IndexMap::new();
        for category in required {
            let entries: Vec<Arc<ProviderEntry>> = self.table(*category).read().clone();
            let mut healthy = 0;
            for entry in &entries {
                if entry.breaker.state() != BreakerState::Open
                    && entry.registration.provider.health_check().await
                {
                    healthy += 1;
                }
            }
            categories.insert(
                *category,
                CategoryHealth {
                    registered: entries.len(),
                    healthy,
                },
            );
        }
        HealthReport { categories }
    }

    /// Providers advertising `capability`, best first.
    fn ranked(&self, category: ServiceCategory, capability: &str) -> Vec<Arc<ProviderEntry>> {
        let mut entries: Vec<Arc<ProviderEntry>> = self
            .table(category)
            .read()
            .iter()
            .filter(|entry| entry.registration.capabilities.contains(capability))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.rank());
        entries
    }

    /// Runs `call` against providers in selection order until one succeeds.
    ///
    /// Breakers are consulted lazily so a HALF_OPEN probe is only reserved
    /// for a provider that is actually called.
    pub async fn dispatch<'a, T, F>(
        &self,
        category: ServiceCategory,
        capability: &str,
        call: F,
    ) -> Result<T, CognosError>
    where
        F: Fn(ServiceProvider) -> BoxFuture<'a, Result<T, ProviderError>>,
    {
        let deadline = self.bus_config.timeout_for(category);
        let mut attempted = 0_usize;
        let mut timed_out = false;
        for entry in self.ranked(category, capability) {
            if !entry.breaker.is_callable() {
                continue;
            }
            attempted += 1;
            let stamp = self.stamp.fetch_add(1, Ordering::SeqCst) + 1;
            entry.last_used.store(stamp, Ordering::SeqCst);
            let started = Instant::now();
            let outcome = tokio::time::timeout(deadline, call(entry.registration.provider.clone())).await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match outcome {
                Ok(Ok(value)) => {
                    self.on_success(&entry);
                    self.attempt_event(category, capability, &entry, &AttemptOutcome::Success, elapsed_ms);
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    let outcome = AttemptOutcome::Failure(err.to_string());
                    self.attempt_event(category, capability, &entry, &outcome, elapsed_ms);
                    self.on_failure(category, &entry);
                }
                Err(_) => {
                    timed_out = true;
                    self.attempt_event(category, capability, &entry, &AttemptOutcome::Timeout, elapsed_ms);
                    self.on_failure(category, &entry);
                }
            }
        }
        if attempted > 0 && timed_out {
            return Err(CognosError::EvaluationTimeout {
                operation: format!("{category}.{capability}"),
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            });
        }
        self.log(
            LogLevel::Warn,
            "bus.dispatch.unavailable",
            json!({ "category": category, "capability": capability, "attempted": attempted }),
        );
        Err(CognosError::ServiceUnavailable(category))
    }

    fn on_success(&self, entry: &ProviderEntry) {
        if entry.breaker.record_success() == Some(BreakerState::Closed) {
            self.log(
                LogLevel::Info,
                "bus.breaker.closed",
                json!({ "handle": entry.registration.handle }),
            );
            self.event("bus.breaker.closed", json!({ "handle": entry.registration.handle }));
        }
    }

    fn on_failure(&self, category: ServiceCategory, entry: &ProviderEntry) {
        if entry.breaker.record_failure() != Some(BreakerState::Open) {
            return;
        }
        let trips = entry.breaker.trips();
        let handle = entry.registration.handle.as_str();
        self.log(
            LogLevel::Warn,
            "bus.breaker.opened",
            json!({ "handle": handle, "category": category, "trips": trips }),
        );
        self.event(
            "bus.breaker.opened",
            json!({ "handle": handle, "category": category, "trips": trips }),
        );
        if self
            .breaker_config
            .evict_after_trips
            .is_some_and(|limit| trips >= limit)
            && self.unregister(handle)
        {
            self.log(
                LogLevel::Warn,
                "bus.provider.evicted",
                json!({ "handle": handle, "category": category, "trips": trips }),
            );
            self.event("bus.provider.evicted", json!({ "handle": handle, "category": category }));
        }
    }

    fn attempt_event(
        &self,
        category: ServiceCategory,
        capability: &str,
        entry: &ProviderEntry,
        outcome: &AttemptOutcome,
        elapsed_ms: u64,
    ) {
        let error = match outcome {
            AttemptOutcome::Failure(message) => Some(message.as_str()),
            _ => None,
        };
        self.event(
            "bus.dispatch.attempt",
            json!({
                "category": category,
                "capability": capability,
                "provider": entry.registration.handle,
                "outcome": outcome.label(),
                "elapsed_ms": elapsed_ms,
                "error": error,
            }),
        );
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(event_type, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::FutureExt;

    use cognos_kernel::{
        loopback::{RecordingCommunication, ScriptedLlm},
        services::{LlmParams, LlmService},
        ManualClock,
    };
    use shared_event_bus::MemoryEventBus;

    fn registry(clock: &ManualClock) -> RegistryContext {
        RegistryContext::new(
            BreakerConfig::default(),
            BusConfig {
                llm_timeout_ms: Some(50),
                ..BusConfig::default()
            },
            Arc::new(clock.clone()),
        )
    }

    fn llm(name: &str) -> Arc<ScriptedLlm> {
        Arc::new(ScriptedLlm::new(name).with_response("*", name))
    }

    async fn generate(registry: &RegistryContext) -> Result<String, CognosError> {
        let params = LlmParams::default();
        registry
            .dispatch(ServiceCategory::Llm, "generate", |provider| {
                let params = &params;
                async move {
                    match provider {
                        ServiceProvider::Llm(llm) => llm.generate("ping", params).await.map(|r| r.text),
                        _ => Err(ProviderError::new("wrong category")),
                    }
                }
                .boxed()
            })
            .await
    }

    #[tokio::test]
    async fn equal_rank_providers_rotate() {
        let registry = registry(&ManualClock::default());
        assert!(registry.register(ServiceRegistration::new("a", ServiceProvider::Llm(llm("a")))));
        assert!(registry.register(ServiceRegistration::new("b", ServiceProvider::Llm(llm("b")))));
        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(generate(&registry).await.unwrap());
        }
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn group_and_priority_order_selection() {
        let registry = registry(&ManualClock::default());
        registry.register(ServiceRegistration::new("backup", ServiceProvider::Llm(llm("backup"))).with_group(1));
        registry.register(
            ServiceRegistration::new("low", ServiceProvider::Llm(llm("low"))).with_priority(ProviderPriority::Low),
        );
        registry.register(
            ServiceRegistration::new("high", ServiceProvider::Llm(llm("high"))).with_priority(ProviderPriority::High),
        );
        assert_eq!(generate(&registry).await.unwrap(), "high");
        assert_eq!(generate(&registry).await.unwrap(), "high");
    }

    #[tokio::test]
    async fn registration_rejects_duplicates_and_mismatches() {
        let registry = registry(&ManualClock::default());
        assert!(registry.register(ServiceRegistration::new("a", ServiceProvider::Llm(llm("a")))));
        assert!(!registry.register(ServiceRegistration::new("a", ServiceProvider::Llm(llm("a2")))));
        let mismatched = ServiceRegistration::new(
            "comm",
            ServiceProvider::Communication(Arc::new(RecordingCommunication::new("comm"))),
        )
        .with_category(ServiceCategory::Llm);
        assert!(!registry.register(mismatched));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(matches!(
            generate(&registry).await,
            Err(CognosError::ServiceUnavailable(ServiceCategory::Llm))
        ));
    }

    #[tokio::test]
    async fn capability_filter_skips_providers() {
        let registry = registry(&ManualClock::default());
        registry.register(
            ServiceRegistration::new("embed-only", ServiceProvider::Llm(llm("embed-only")))
                .with_capabilities(["embed"]),
        );
        assert!(matches!(
            generate(&registry).await,
            Err(CognosError::ServiceUnavailable(ServiceCategory::Llm))
        ));
    }

    #[tokio::test]
    async fn failures_fall_back_and_open_the_breaker() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        let broken = llm("broken");
        broken.switches().set_failing(true);
        registry.register(ServiceRegistration::new("broken", ServiceProvider::Llm(broken)).with_priority(ProviderPriority::High));
        registry.register(ServiceRegistration::new("spare", ServiceProvider::Llm(llm("spare"))));
        for _ in 0..3 {
            assert_eq!(generate(&registry).await.unwrap(), "spare");
        }
        let broken_snapshot = &registry.providers(ServiceCategory::Llm)[0];
        assert_eq!(broken_snapshot.breaker.state, BreakerState::Open);
        let before = broken_snapshot.breaker.consecutive_failures;
        generate(&registry).await.unwrap();
        assert_eq!(
            registry.providers(ServiceCategory::Llm)[0].breaker.consecutive_failures,
            before
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_reported_distinctly() {
        let registry = registry(&ManualClock::default());
        let slow = Arc::new(ScriptedLlm::new("slow").with_response("*", "late").with_delay(Duration::from_millis(500)));
        registry.register(ServiceRegistration::new("slow", ServiceProvider::Llm(slow)));
        let err = generate(&registry).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn persistent_failures_evict_the_provider() {
        let clock = ManualClock::default();
        let registry = RegistryContext::new(
            BreakerConfig {
                failure_threshold: 1,
                evict_after_trips: Some(2),
                ..BreakerConfig::default()
            },
            BusConfig::default(),
            Arc::new(clock.clone()),
        );
        let broken = llm("broken");
        broken.switches().set_failing(true);
        registry.register(ServiceRegistration::new("broken", ServiceProvider::Llm(broken)));
        assert!(generate(&registry).await.is_err());
        clock.advance(chrono::Duration::seconds(60));
        assert!(generate(&registry).await.is_err());
        assert!(!registry.contains("broken"));
    }

    #[tokio::test]
    async fn dispatch_attempts_are_published() {
        let bus = Arc::new(MemoryEventBus::new(32));
        let telemetry = RuntimeTelemetry::builder("bus")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let registry = registry(&ManualClock::default()).with_telemetry(telemetry);
        registry.register(ServiceRegistration::new("a", ServiceProvider::Llm(llm("a"))));
        generate(&registry).await.unwrap();
        for _ in 0..10 {
            if bus.count("bus.dispatch.attempt") == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.count("bus.dispatch.attempt"), 1);
    }

    #[tokio::test]
    async fn health_report_requires_a_healthy_closed_provider() {
        let registry = registry(&ManualClock::default());
        let sick = llm("sick");
        sick.switches().set_healthy(false);
        registry.register(ServiceRegistration::new("sick", ServiceProvider::Llm(sick)));
        let report = registry
            .health_report(&[ServiceCategory::Llm, ServiceCategory::Memory])
            .await;
        assert!(!report.all_healthy());
        assert_eq!(report.missing(), vec![ServiceCategory::Llm, ServiceCategory::Memory]);
        registry.register(ServiceRegistration::new("well", ServiceProvider::Llm(llm("well"))));
        let report = registry.health_report(&[ServiceCategory::Llm]).await;
        assert!(report.all_healthy());
        assert_eq!(report.categories[&ServiceCategory::Llm].registered, 2);
    }
}
