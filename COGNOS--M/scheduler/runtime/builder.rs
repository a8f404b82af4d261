use std::sync::Arc;

use anyhow::Result;
use cognos_dma::{DmaPipeline, Evaluator};
use cognos_kernel::{
    config::RuntimeConfig, services::AuditService, Clock, RuntimeTelemetry, SystemClock,
};
use cognos_servicebus::{RegistryContext, ServiceBuses, ServiceRegistration};
use parking_lot::Mutex;
use shared_event_bus::{FanoutPublisher, FileEventPublisher, MemoryEventBus};
use tokio::{sync::mpsc, task::JoinSet};

use super::{AgentRuntime, Ledger, RuntimeInner};
use crate::{
    dispatcher::Dispatcher, shutdown::ShutdownCoordinator, state_machine::StateMachine,
    whitelist::ActionWhitelist,
};

/// Builder used to configure an [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditService>>,
    events: Option<Arc<MemoryEventBus>>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    services: Vec<ServiceRegistration>,
}

impl std::fmt::Debug for AgentRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntimeBuilder")
            .field("audit", &self.audit.is_some())
            .field("evaluators", &self.evaluators.len())
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

impl AgentRuntimeBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            clock: None,
            audit: None,
            events: None,
            evaluators: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Overrides the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Attaches the audit sink.
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditService>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Uses an existing in-memory event bus.
    #[must_use]
    pub fn event_bus(mut self, events: Arc<MemoryEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Adds an evaluator to the pipeline fan-out.
    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Registers a provider before the first round.
    #[must_use]
    pub fn service(mut self, registration: ServiceRegistration) -> Self {
        self.services.push(registration);
        self
    }

    /// Validates the configuration and wires telemetry, registry, buses and
    /// the pipeline.
    pub fn build(self) -> Result<AgentRuntime> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(MemoryEventBus::new(config.telemetry.event_backlog)));

        let mut publisher = FanoutPublisher::new().with(events.clone());
        if let Some(path) = &config.telemetry.event_log_path {
            publisher = publisher.with(Arc::new(FileEventPublisher::new(path)?));
        }
        let mut telemetry = RuntimeTelemetry::builder("cognos.scheduler")
            .min_level(config.telemetry.min_level)
            .event_publisher(Arc::new(publisher));
        if let Some(path) = &config.telemetry.log_path {
            telemetry = telemetry.log_path(path.clone());
        }
        let telemetry = telemetry.build()?;

        let registry = Arc::new(
            RegistryContext::from_config(&config, Arc::clone(&clock))
                .with_telemetry(telemetry.child("cognos.servicebus")),
        );
        for registration in self.services {
            registry.register(registration);
        }
        let buses = ServiceBuses::new(registry);

        let mut pipeline = DmaPipeline::new(buses.llm.clone(), config.dma.clone())
            .with_telemetry(telemetry.child("cognos.dma"));
        for evaluator in self.evaluators {
            pipeline = pipeline.with_evaluator(evaluator);
        }

        let machine = StateMachine::new();
        let state = machine.reader();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let ledger = Ledger::new(&config, clock.now());

        Ok(AgentRuntime {
            inner: Arc::new(RuntimeInner {
                whitelist: ActionWhitelist::from_config(&config.scheduler),
                dispatcher: Dispatcher::new(buses.clone(), config.scheduler.home_channel.clone()),
                shutdown: ShutdownCoordinator::new(config.scheduler.shutdown_grace()),
                pipeline: Arc::new(pipeline),
                audit: self.audit,
                machine: Mutex::new(machine),
                ledger: Mutex::new(ledger),
                workers: Mutex::new(JoinSet::new()),
                completions_rx: Mutex::new(completions_rx),
                completions_tx,
                state,
                events,
                telemetry,
                buses,
                clock,
                config,
            }),
        })
    }
}
