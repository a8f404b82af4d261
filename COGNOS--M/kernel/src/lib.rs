#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]

//! Cognos kernel: the shared vocabulary of the decision runtime.
//!
//! Tasks, thoughts, the closed action set, cognitive states, the error taxonomy,
//! the contracts expected from external collaborators, configuration and telemetry.

/// Error taxonomy shared across crates.
#[path = "../error.rs"]
pub mod error;

/// Task data model.
#[path = "../task.rs"]
pub mod task;

/// Thought data model and context snapshots.
#[path = "../thought.rs"]
pub mod thought;

/// Closed action vocabulary, typed parameters and evaluator results.
#[path = "../action.rs"]
pub mod action;

/// Cognitive state and the single-writer state cell.
#[path = "../state.rs"]
pub mod state;

/// Contracts consumed from external collaborators.
#[path = "../services.rs"]
pub mod services;

/// Arena-backed graph used by in-process memory providers.
#[path = "../graph.rs"]
pub mod graph;

/// Injected time sources.
#[path = "../clock.rs"]
pub mod clock;

/// Runtime configuration loaded from TOML.
#[path = "../config.rs"]
pub mod config;

/// Telemetry builder and handle.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// In-process provider implementations for wiring and tests.
#[path = "../loopback/main.rs"]
pub mod loopback;

pub use action::{
    ActionParams, ActionSelectionResult, DmaFamily, DmaResult, DmaVerdict, EthicalDecision,
    HandlerAction, RationaleEntry, RationaleStage,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RuntimeConfig;
pub use error::{CognosError, ProviderError};
pub use services::{ServiceCategory, ServiceProvider};
pub use state::{state_channel, CognitiveState, RuntimeStatus, StateReader, StateWriter};
pub use task::{Task, TaskId, TaskKind, TaskOrigin, TaskPriority, TaskSpec, TaskStatus};
pub use telemetry::{RuntimeTelemetry, RuntimeTelemetryBuilder};
pub use thought::{ContextSnapshot, Thought, ThoughtId, ThoughtStatus, ThoughtType};
