#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! Cognitive state scheduler of the Cognos runtime.
//!
//! Orders thoughts by task priority, runs DMA pipelines under the capacity
//! caps, enforces the per-state action whitelists, dispatches through the
//! buses and drives the WAKEUP / WORK / PLAY / SOLITUDE / DREAM / SHUTDOWN
//! lifecycle.

/// Pending thought ordering.
#[path = "../queue.rs"]
pub mod queue;

/// Cognitive state transitions.
#[path = "../state_machine.rs"]
pub mod state_machine;

/// Per-state action whitelists.
#[path = "../whitelist.rs"]
pub mod whitelist;

/// Action dispatch through the buses.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// Dream invitation cadence.
#[path = "../dream.rs"]
pub mod dream;

/// Identity variance tracking.
#[path = "../variance.rs"]
pub mod variance;

/// Grace-bounded shutdown.
#[path = "../shutdown.rs"]
pub mod shutdown;

/// Archive of terminal tasks.
#[path = "../archive.rs"]
pub mod archive;

/// Agent runtime and round loop.
#[path = "../runtime/main.rs"]
pub mod runtime;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use state_machine::{StateMachine, TransitionRecord};
pub use variance::{IdentitySnapshot, VarianceReport};
pub use whitelist::{default_whitelist, ActionWhitelist};
