#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! Service layer of the Cognos runtime.
//!
//! A [`registry::RegistryContext`] owns one provider table per category and a
//! circuit breaker per provider; each bus wraps it with typed calls, deadlines
//! and fallback across providers.

/// Per-provider circuit breaker.
#[path = "../breaker.rs"]
pub mod breaker;

/// Capability-indexed provider tables and dispatch.
#[path = "../registry.rs"]
pub mod registry;

/// Typed buses, one per service category.
#[path = "../buses/main.rs"]
pub mod buses;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use buses::{
    CommunicationBus, LlmBus, MemoryBus, RuntimeControlBus, ServiceBuses, ToolBus, UsageLedger,
    WiseAuthorityBus,
};
pub use registry::{
    CategoryHealth, HealthReport, ProviderPriority, ProviderSnapshot, RegistryContext,
    ServiceRegistration,
};
