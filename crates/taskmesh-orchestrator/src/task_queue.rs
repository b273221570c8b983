use serde::Serialize;
use std::collections::{HashMap, HashSet};
use taskmesh_core::{Task, TaskStatus, TaskmeshError, TaskmeshResult};

/// Snapshot of queue contents.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of queued tasks still `Pending`.
    pub pending_tasks: usize,
    /// Count per lowercase status name.
    pub tasks_by_status: HashMap<String, usize>,
    /// Count per task type.
    pub tasks_by_type: HashMap<String, usize>,
}

/// In-memory queue ordered by descending priority, then ascending creation time.
///
/// The order is re-established after every mutation, so the head is always
/// the oldest task of the highest priority.
pub struct PriorityTaskQueue {
    tasks: Vec<Task>,
}

impl PriorityTaskQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    // Stable sort keeps submission order for identical timestamps.
    fn resort(&mut self) {
        self.tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
    }

    /// Insert a task. Rejects an empty id or an id already in the queue.
    pub fn enqueue(&mut self, task: Task) -> TaskmeshResult<()> {
        if task.id.is_empty() {
            return Err(TaskmeshError::InvalidInput("task id must not be empty".into()));
        }
        if self.contains(&task.id) {
            return Err(TaskmeshError::InvalidInput(format!(
                "task {} is already queued",
                task.id
            )));
        }
        self.tasks.push(task);
        self.resort();
        Ok(())
    }

    /// Remove and return the head.
    pub fn dequeue(&mut self) -> Option<Task> {
        if self.tasks.is_empty() {
            None
        } else {
            Some(self.tasks.remove(0))
        }
    }

    /// Inspect the head without removing it.
    pub fn peek(&self) -> Option<&Task> {
        self.tasks.first()
    }

    /// Remove a specific task. Returns whether it was queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.take(task_id).is_some()
    }

    /// Remove a specific task and return it.
    pub fn take(&mut self, task_id: &str) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.id == task_id)?;
        Some(self.tasks.remove(pos))
    }

    /// Whether a task with this id is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.iter().any(|t| t.id == task_id)
    }

    /// Look up a queued task.
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Every pending task whose dependencies are all in `completed`, in queue order.
    pub fn get_ready_tasks(&self, completed: &HashSet<String>) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .cloned()
            .collect()
    }

    /// Change a queued task's priority and restore ordering.
    pub fn update_priority(&mut self, task_id: &str, priority: i32) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => {
                task.priority = priority;
                self.resort();
                true
            }
            None => false,
        }
    }

    /// All tasks still `Pending`, in queue order.
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.tasks_by_status(TaskStatus::Pending)
    }

    /// Tasks with the given status, in queue order.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Tasks of the given type, in queue order.
    pub fn tasks_by_type(&self, task_type: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.task_type == task_type)
            .cloned()
            .collect()
    }

    /// All queued tasks, in queue order.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.clone()
    }

    /// Number of tasks held, ready or not.
    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    /// True when no task is held.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop every queued task. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let n = self.tasks.len();
        self.tasks.clear();
        n
    }

    /// Counts by status and type.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in &self.tasks {
            if task.status == TaskStatus::Pending {
                stats.pending_tasks += 1;
            }
            *stats
                .tasks_by_status
                .entry(task.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .tasks_by_type
                .entry(task.task_type.clone())
                .or_insert(0) += 1;
        }
        stats
    }
}

impl Default for PriorityTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
