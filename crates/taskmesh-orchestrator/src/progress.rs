use crate::handler::ProgressSink;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use taskmesh_core::{ObserverList, SubscriptionId, TaskProgress};
use tracing::debug;

/// Fans progress reports out to subscribers and remembers the latest per task.
pub struct ProgressHub {
    observers: ObserverList<TaskProgress>,
    latest: RwLock<HashMap<String, TaskProgress>>,
}

impl ProgressHub {
    /// A hub with no subscribers.
    pub fn new() -> Self {
        Self {
            observers: ObserverList::new("progress"),
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Add a progress subscriber.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TaskProgress) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    /// Record `progress` as the task's latest value and notify every subscriber.
    pub fn publish(&self, progress: TaskProgress) {
        debug!(
            task_id = %progress.task_id,
            worker_id = %progress.worker_id,
            progress = progress.progress,
            "Task progress"
        );
        self.observers.notify(&progress);
        self.latest.write().insert(progress.task_id.clone(), progress);
    }

    /// Last report received for a task.
    pub fn latest(&self, task_id: &str) -> Option<TaskProgress> {
        self.latest.read().get(task_id).cloned()
    }

    /// Drop the last report kept for `task_id`.
    pub fn forget(&self, task_id: &str) {
        self.latest.write().remove(task_id);
    }

    /// Drop every kept report.
    pub fn clear(&self) {
        self.latest.write().clear();
    }

    /// A sink that publishes into this hub.
    pub fn sink(self: &Arc<Self>) -> ProgressSink {
        let hub = Arc::clone(self);
        Arc::new(move |p: TaskProgress| hub.publish(p))
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}
