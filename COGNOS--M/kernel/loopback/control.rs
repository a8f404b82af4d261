use async_trait::async_trait;
use parking_lot::Mutex;

use super::Switches;
use crate::{
    error::ProviderError,
    services::RuntimeControlService,
    state::{CognitiveState, RuntimeStatus},
};

/// Runtime-control surface that records announcements.
#[derive(Debug)]
pub struct RecordingRuntimeControl {
    name: String,
    transitions: Mutex<Vec<(CognitiveState, CognitiveState, String)>>,
    statuses: Mutex<Vec<RuntimeStatus>>,
    switches: Switches,
}

impl RecordingRuntimeControl {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transitions: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
            switches: Switches::default(),
        }
    }

    /// Announced `(from, to, reason)` transitions.
    #[must_use]
    pub fn transitions(&self) -> Vec<(CognitiveState, CognitiveState, String)> {
        self.transitions.lock().clone()
    }

    /// Published status snapshots.
    #[must_use]
    pub fn statuses(&self) -> Vec<RuntimeStatus> {
        self.statuses.lock().clone()
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }
}

#[async_trait]
impl RuntimeControlService for RecordingRuntimeControl {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.switches.healthy()
    }

    async fn notify_state_transition(
        &self,
        from: CognitiveState,
        to: CognitiveState,
        reason: &str,
    ) -> Result<(), ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        self.transitions.lock().push((from, to, reason.to_string()));
        Ok(())
    }

    async fn publish_status(&self, status: &RuntimeStatus) -> Result<(), ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new(format!("{} is failing", self.name)));
        }
        self.statuses.lock().push(status.clone());
        Ok(())
    }
}
