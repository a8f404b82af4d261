//! Pending thoughts ordered by task priority, then creation sequence.

use std::{cmp::Ordering, collections::BTreeSet};

use cognos_kernel::{task::TaskPriority, TaskId, ThoughtId};

/// Queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedThought {
    /// Priority of the owning task.
    pub priority: TaskPriority,
    /// Creation sequence of the thought.
    pub sequence: u64,
    /// Thought.
    pub thought_id: ThoughtId,
    /// Owning task.
    pub task_id: TaskId,
}

impl Ord for QueuedThought {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
            .then(self.thought_id.cmp(&other.thought_id))
    }
}

impl PartialOrd for QueuedThought {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Thoughts waiting for capacity. Nothing is ever dropped by the queue itself.
#[derive(Debug, Default)]
pub struct ThoughtQueue {
    entries: BTreeSet<QueuedThought>,
}

impl ThoughtQueue {
    /// Adds a thought.
    pub fn push(&mut self, entry: QueuedThought) {
        self.entries.insert(entry);
    }

    /// Removes and returns the first entry, in start order, accepted by `eligible`.
    pub fn take_first(&mut self, mut eligible: impl FnMut(&QueuedThought) -> bool) -> Option<QueuedThought> {
        let found = self.entries.iter().find(|entry| eligible(entry)).copied()?;
        self.entries.remove(&found);
        Some(found)
    }

    /// Removes every entry matching `remove`, returning them in start order.
    pub fn drain_where(&mut self, mut remove: impl FnMut(&QueuedThought) -> bool) -> Vec<QueuedThought> {
        let removed: Vec<QueuedThought> = self.entries.iter().filter(|entry| remove(entry)).copied().collect();
        for entry in &removed {
            self.entries.remove(entry);
        }
        removed
    }

    /// Whether any entry matches.
    pub fn any(&self, predicate: impl FnMut(&QueuedThought) -> bool) -> bool {
        self.entries.iter().any(predicate)
    }

    /// Entries in start order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedThought> {
        self.entries.iter()
    }

    /// Number of waiting thoughts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: TaskPriority, sequence: u64) -> QueuedThought {
        QueuedThought {
            priority,
            sequence,
            thought_id: ThoughtId::new(),
            task_id: TaskId::new(),
        }
    }

    #[test]
    fn priority_then_fifo() {
        let mut queue = ThoughtQueue::default();
        let late_high = entry(TaskPriority::High, 5);
        let early_normal = entry(TaskPriority::Normal, 1);
        let later_normal = entry(TaskPriority::Normal, 2);
        let critical = entry(TaskPriority::Critical, 9);
        for item in [later_normal, early_normal, late_high, critical] {
            queue.push(item);
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.take_first(|_| true))
            .map(|item| item.sequence)
            .collect();
        assert_eq!(order, vec![9, 5, 1, 2]);
    }

    #[test]
    fn skipped_entries_stay_queued() {
        let mut queue = ThoughtQueue::default();
        let blocked = entry(TaskPriority::High, 1);
        let free = entry(TaskPriority::Normal, 2);
        queue.push(blocked);
        queue.push(free);
        let taken = queue.take_first(|item| item.task_id != blocked.task_id).unwrap();
        assert_eq!(taken.sequence, 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain_where(|_| true), vec![blocked]);
        assert!(queue.is_empty());
    }
}
