#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! Decision-making algorithms and the evaluation pipeline.
//!
//! A thought fans out to the ethical, common-sense and domain evaluators,
//! their results are triaged, one action is selected and then validated by
//! the epistemic faculties and guardrails with at most one re-selection.

/// Evaluator contract and the LLM-backed evaluators.
#[path = "../evaluators/main.rs"]
pub mod evaluators;

/// Action selection.
#[path = "../selection.rs"]
pub mod selection;

/// Epistemic faculties scored over a selected action.
#[path = "../faculties.rs"]
pub mod faculties;

/// Threshold checks over faculty scores.
#[path = "../guardrails.rs"]
pub mod guardrails;

/// The evaluation pipeline.
#[path = "../pipeline.rs"]
pub mod pipeline;

pub use evaluators::{Evaluator, TriagedInputs};
pub use faculties::{Faculty, FacultyReport, FacultyRunner};
pub use guardrails::{Guardrail, GuardrailFinding, GuardrailSet, GuardrailVerdict};
pub use pipeline::{DmaPipeline, PipelineOutcome};
pub use selection::{ActionSelector, GuardrailFeedback};
