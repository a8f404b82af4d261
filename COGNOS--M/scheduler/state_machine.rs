//! Cognitive state transitions. The machine owns the only [`StateWriter`].

use chrono::{DateTime, Utc};
use cognos_kernel::{
    state::{state_channel, StateReader, StateWriter},
    CognitiveState, CognosError,
};
use serde::{Deserialize, Serialize};

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Previous state.
    pub from: CognitiveState,
    /// New state.
    pub to: CognitiveState,
    /// Why the scheduler moved.
    pub reason: String,
    /// When.
    pub at: DateTime<Utc>,
}

/// Whether `from -> to` is a legal edge.
#[must_use]
pub const fn is_allowed(from: CognitiveState, to: CognitiveState) -> bool {
    use CognitiveState::{Dream, Play, Shutdown, Solitude, Wakeup, Work};
    matches!(
        (from, to),
        (Wakeup, Work)
            | (Work, Play | Solitude | Dream)
            | (Play | Solitude | Dream, Work)
            | (Solitude, Dream)
            | (Wakeup | Work | Play | Solitude | Dream, Shutdown)
    )
}

/// State cell plus its transition history.
#[derive(Debug)]
pub struct StateMachine {
    writer: StateWriter,
    reader: StateReader,
    history: Vec<TransitionRecord>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Starts in WAKEUP.
    #[must_use]
    pub fn new() -> Self {
        let (writer, reader) = state_channel(CognitiveState::Wakeup);
        Self {
            writer,
            reader,
            history: Vec::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> CognitiveState {
        self.writer.current()
    }

    /// Reader handed to other components.
    #[must_use]
    pub fn reader(&self) -> StateReader {
        self.reader.clone()
    }

    /// Applies a transition, returning the record.
    pub fn transition(
        &mut self,
        to: CognitiveState,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionRecord, CognosError> {
        let from = self.current();
        if !is_allowed(from, to) {
            return Err(CognosError::InvalidTransition { from, to });
        }
        self.writer.set(to);
        let record = TransitionRecord {
            from,
            to,
            reason: reason.into(),
            at: now,
        };
        self.history.push(record.clone());
        Ok(record)
    }

    /// Every applied transition.
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        let mut machine = StateMachine::new();
        let reader = machine.reader();
        let now = Utc::now();
        machine.transition(CognitiveState::Work, "services healthy", now).unwrap();
        machine.transition(CognitiveState::Solitude, "idle", now).unwrap();
        machine.transition(CognitiveState::Dream, "invitation accepted", now).unwrap();
        assert_eq!(reader.current(), CognitiveState::Dream);
        let err = machine
            .transition(CognitiveState::Play, "explore", now)
            .unwrap_err();
        assert_eq!(
            err,
            CognosError::InvalidTransition {
                from: CognitiveState::Dream,
                to: CognitiveState::Play
            }
        );
        machine.transition(CognitiveState::Shutdown, "requested", now).unwrap();
        assert_eq!(machine.history().len(), 4);
    }

    #[test]
    fn shutdown_is_terminal() {
        for state in CognitiveState::ALL {
            assert!(!is_allowed(CognitiveState::Shutdown, state));
        }
        assert!(!is_allowed(CognitiveState::Wakeup, CognitiveState::Dream));
        assert!(!is_allowed(CognitiveState::Play, CognitiveState::Dream));
    }
}
