//! In-process providers used to wire the binary and to script tests.
//!
//! Each provider records what it was asked to do so callers can assert on it.

/// Recording audit sink.
pub mod audit;
/// Recording messaging adapter.
pub mod communication;
/// Scripted language model.
pub mod llm;
/// Arena-backed graph memory.
pub mod memory;
/// Recording runtime-control surface.
pub mod control;
/// Static tool table.
pub mod tools;
/// Recording wise authority.
pub mod wise_authority;

pub use audit::{AuditEntry, RecordingAudit};
pub use communication::RecordingCommunication;
pub use control::RecordingRuntimeControl;
pub use llm::{LlmCall, ScriptedLlm, ANY_PURPOSE};
pub use memory::GraphMemory;
pub use tools::LoopbackTools;
pub use wise_authority::RecordingWiseAuthority;

use std::sync::atomic::{AtomicBool, Ordering};

/// Health and failure switches shared by every loopback provider.
#[derive(Debug)]
pub struct Switches {
    healthy: AtomicBool,
    failing: AtomicBool,
}

impl Default for Switches {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }
}

impl Switches {
    /// Reported health.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Sets reported health.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Whether calls currently fail.
    #[must_use]
    pub fn failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    /// Makes every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}
