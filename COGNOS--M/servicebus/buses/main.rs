//! One typed bus per service category.
//!
//! Buses hold the shared [`RegistryContext`] and translate typed calls into
//! registry dispatches with provider fallback.

/// Communication bus.
pub mod communication;
/// LLM bus and usage ledger.
pub mod llm;
/// Memory bus.
pub mod memory;
/// Runtime-control bus.
pub mod runtime_control;
/// Tool bus.
pub mod tool;
/// Wise-authority bus.
pub mod wise_authority;

use std::sync::Arc;

use cognos_kernel::{error::ProviderError, services::ServiceProvider};

pub use communication::CommunicationBus;
pub use llm::{LlmBus, UsageLedger};
pub use memory::MemoryBus;
pub use runtime_control::RuntimeControlBus;
pub use tool::ToolBus;
pub use wise_authority::WiseAuthorityBus;

use crate::registry::RegistryContext;

/// Every bus over one registry.
#[derive(Debug, Clone)]
pub struct ServiceBuses {
    /// Shared registry.
    pub registry: Arc<RegistryContext>,
    /// LLM bus.
    pub llm: LlmBus,
    /// Memory bus.
    pub memory: MemoryBus,
    /// Communication bus.
    pub communication: CommunicationBus,
    /// Tool bus.
    pub tool: ToolBus,
    /// Wise-authority bus.
    pub wise_authority: WiseAuthorityBus,
    /// Runtime-control bus.
    pub runtime_control: RuntimeControlBus,
}

impl ServiceBuses {
    /// Builds every bus over `registry`.
    #[must_use]
    pub fn new(registry: Arc<RegistryContext>) -> Self {
        Self {
            llm: LlmBus::new(Arc::clone(&registry)),
            memory: MemoryBus::new(Arc::clone(&registry)),
            communication: CommunicationBus::new(Arc::clone(&registry)),
            tool: ToolBus::new(Arc::clone(&registry)),
            wise_authority: WiseAuthorityBus::new(Arc::clone(&registry)),
            runtime_control: RuntimeControlBus::new(Arc::clone(&registry)),
            registry,
        }
    }
}

fn category_mismatch(provider: &ServiceProvider) -> ProviderError {
    ProviderError::new(format!(
        "provider {} is registered under {}",
        provider.name(),
        provider.category()
    ))
}
