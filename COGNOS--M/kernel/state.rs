//! Cognitive state and the single-writer cell that holds it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Operating mode of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CognitiveState {
    /// Loading identity and checking services.
    Wakeup,
    /// Default task processing.
    Work,
    /// Exploration while idle.
    Play,
    /// Quiet reflection while idle.
    Solitude,
    /// Introspection, memory consolidation and identity variance checks.
    Dream,
    /// Terminal state.
    Shutdown,
}

impl CognitiveState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Wakeup,
        Self::Work,
        Self::Play,
        Self::Solitude,
        Self::Dream,
        Self::Shutdown,
    ];

    /// Upper-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Wakeup => "WAKEUP",
            Self::Work => "WORK",
            Self::Play => "PLAY",
            Self::Solitude => "SOLITUDE",
            Self::Dream => "DREAM",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for CognitiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Write half of the state cell. Owned by the scheduler's transition function.
#[derive(Debug)]
pub struct StateWriter {
    tx: watch::Sender<CognitiveState>,
}

/// Read half of the state cell, cloned into pipelines and bus hooks.
#[derive(Debug, Clone)]
pub struct StateReader {
    rx: watch::Receiver<CognitiveState>,
}

/// Creates a state cell starting at `initial`.
#[must_use]
pub fn state_channel(initial: CognitiveState) -> (StateWriter, StateReader) {
    let (tx, rx) = watch::channel(initial);
    (StateWriter { tx }, StateReader { rx })
}

impl StateWriter {
    /// Replaces the current state, returning the previous one.
    pub fn set(&self, next: CognitiveState) -> CognitiveState {
        self.tx.send_replace(next)
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> CognitiveState {
        *self.tx.borrow()
    }

    /// New reader attached to this cell.
    #[must_use]
    pub fn reader(&self) -> StateReader {
        StateReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl StateReader {
    /// Current state.
    #[must_use]
    pub fn current(&self) -> CognitiveState {
        *self.rx.borrow()
    }

    /// Waits for the next change and returns the new state.
    ///
    /// Returns `None` once the writer is gone.
    pub async fn changed(&mut self) -> Option<CognitiveState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Snapshot returned by `get_runtime_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Current cognitive state.
    pub current_state: CognitiveState,
    /// Thoughts with a pipeline in flight.
    pub active_thoughts: usize,
    /// Tasks with at least one thought in flight.
    pub active_tasks: usize,
    /// Completed rounds.
    pub round_number: u64,
    /// Thoughts waiting for capacity.
    pub pending_thoughts: usize,
    /// Non-terminal tasks known to the scheduler.
    pub open_tasks: usize,
    /// Whether shutdown was requested.
    pub shutdown_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readers_observe_writer_updates() {
        let (writer, reader) = state_channel(CognitiveState::Wakeup);
        let mut watcher = writer.reader();
        assert_eq!(writer.set(CognitiveState::Work), CognitiveState::Wakeup);
        assert_eq!(reader.current(), CognitiveState::Work);
        assert_eq!(watcher.changed().await, Some(CognitiveState::Work));
    }

    #[tokio::test]
    async fn changed_ends_when_writer_drops() {
        let (writer, mut reader) = state_channel(CognitiveState::Work);
        drop(writer);
        assert_eq!(reader.changed().await, None);
    }
}
