use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::Switches;
use crate::{
    action::HandlerAction,
    error::ProviderError,
    services::{AuditContext, AuditEntryId, AuditOutcome, AuditService},
};

/// One audit entry as stored by [`RecordingAudit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id.
    pub id: AuditEntryId,
    /// Dispatched action.
    pub action: HandlerAction,
    /// Context.
    pub context: AuditContext,
    /// Outcome.
    pub outcome: AuditOutcome,
}

/// Append-only in-memory audit sink.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    entries: Mutex<Vec<AuditEntry>>,
    switches: Switches,
}

impl RecordingAudit {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Health and failure switches.
    #[must_use]
    pub const fn switches(&self) -> &Switches {
        &self.switches
    }
}

#[async_trait]
impl AuditService for RecordingAudit {
    async fn log_action(
        &self,
        action: HandlerAction,
        context: &AuditContext,
        outcome: &AuditOutcome,
    ) -> Result<AuditEntryId, ProviderError> {
        if self.switches.failing() {
            return Err(ProviderError::new("audit sink is failing"));
        }
        let mut entries = self.entries.lock();
        let id = AuditEntryId(format!("audit-{}", entries.len() + 1));
        entries.push(AuditEntry {
            id: id.clone(),
            action,
            context: context.clone(),
            outcome: outcome.clone(),
        });
        Ok(id)
    }
}
