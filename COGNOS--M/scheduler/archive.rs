//! Bounded store of terminal tasks kept for status queries.

use cognos_kernel::{Task, TaskId};
use indexmap::IndexMap;

/// Oldest-first eviction once `capacity` is reached.
#[derive(Debug)]
pub struct TaskArchive {
    capacity: usize,
    entries: IndexMap<TaskId, Task>,
}

impl TaskArchive {
    /// Creates the archive. A zero capacity keeps nothing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: IndexMap::new(),
        }
    }

    /// Stores a task, returning the evicted one if any.
    pub fn insert(&mut self, task: Task) -> Option<Task> {
        if self.capacity == 0 {
            return Some(task);
        }
        let evicted = if self.entries.len() >= self.capacity && !self.entries.contains_key(&task.id) {
            self.entries.shift_remove_index(0).map(|(_, task)| task)
        } else {
            None
        };
        self.entries.insert(task.id, task);
        evicted
    }

    /// Archived task by id.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.entries.get(id)
    }

    /// Archived tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is archived.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cognos_kernel::TaskSpec;

    #[test]
    fn evicts_oldest_first() {
        let mut archive = TaskArchive::new(2);
        let tasks: Vec<Task> = (0..3)
            .map(|i| Task::new(TaskSpec::new(format!("task {i}")), i, Utc::now()))
            .collect();
        assert!(archive.insert(tasks[0].clone()).is_none());
        assert!(archive.insert(tasks[1].clone()).is_none());
        let evicted = archive.insert(tasks[2].clone()).unwrap();
        assert_eq!(evicted.id, tasks[0].id);
        assert!(archive.get(&tasks[0].id).is_none());
        assert_eq!(archive.get(&tasks[2].id).unwrap().description, "task 2");
        assert_eq!(archive.len(), 2);
    }
}
