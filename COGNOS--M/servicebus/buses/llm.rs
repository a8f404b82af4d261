use std::sync::Arc;

use cognos_kernel::{
    services::{LlmParams, LlmResponse, ServiceCategory, ServiceProvider},
    CognosError,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::category_mismatch;
use crate::registry::RegistryContext;

/// Running totals of provider-reported usage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageLedger {
    /// Successful calls.
    pub calls: u64,
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Sum of provider-reported cost.
    pub cost: f64,
}

/// Typed access to language models.
#[derive(Debug, Clone)]
pub struct LlmBus {
    registry: Arc<RegistryContext>,
    ledger: Arc<Mutex<UsageLedger>>,
}

impl LlmBus {
    /// Capability used for generation.
    pub const GENERATE: &'static str = "generate";

    /// Creates the bus.
    #[must_use]
    pub fn new(registry: Arc<RegistryContext>) -> Self {
        Self {
            registry,
            ledger: Arc::new(Mutex::new(UsageLedger::default())),
        }
    }

    /// Generates text with the best available provider.
    pub async fn generate(&self, prompt: &str, params: &LlmParams) -> Result<LlmResponse, CognosError> {
        let response = self
            .registry
            .dispatch(ServiceCategory::Llm, Self::GENERATE, |provider| {
                async move {
                    match provider {
                        ServiceProvider::Llm(llm) => llm.generate(prompt, params).await,
                        other => Err(category_mismatch(&other)),
                    }
                }
                .boxed()
            })
            .await?;
        let mut ledger = self.ledger.lock();
        ledger.calls += 1;
        ledger.input_tokens += response.token_usage.input_tokens;
        ledger.output_tokens += response.token_usage.output_tokens;
        ledger.cost += response.cost;
        Ok(response)
    }

    /// Usage accumulated so far.
    #[must_use]
    pub fn usage(&self) -> UsageLedger {
        *self.ledger.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cognos_kernel::{
        config::{BreakerConfig, BusConfig},
        loopback::ScriptedLlm,
        ManualClock,
    };

    use crate::registry::ServiceRegistration;

    #[tokio::test]
    async fn ledger_sums_reported_usage() {
        let registry = Arc::new(RegistryContext::new(
            BreakerConfig::default(),
            BusConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let llm = Arc::new(ScriptedLlm::new("model").with_response("*", "two words").with_cost(0.25));
        registry.register(ServiceRegistration::new("model", ServiceProvider::Llm(llm)));
        let bus = LlmBus::new(registry);
        for _ in 0..2 {
            bus.generate("a b c", &LlmParams::default()).await.unwrap();
        }
        let usage = bus.usage();
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.input_tokens, 6);
        assert_eq!(usage.output_tokens, 4);
        assert!((usage.cost - 0.5).abs() < f64::EPSILON);
    }
}
