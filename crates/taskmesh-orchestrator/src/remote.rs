//! Bridge between pool workers and agents in other processes.
//!
//! A remote agent is represented in the pool by a [`Worker`](crate::Worker)
//! whose handler is a [`RemoteExecutor`]. The executor parks the task in the
//! agent's mailbox and waits; the agent claims it by polling and answers with
//! progress reports and a final result.

use crate::handler::{ProgressReporter, TaskContext, TaskHandler};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use taskmesh_core::protocol::PollResponse;
use taskmesh_core::{Task, TaskProgress, TaskResult, TaskmeshError, TaskmeshResult};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Pending {
    reply: oneshot::Sender<TaskResult>,
    progress: ProgressReporter,
    claimed: bool,
}

#[derive(Default)]
struct Mailbox {
    queued: VecDeque<Task>,
    pending: HashMap<String, Pending>,
    cancelled: HashSet<String>,
}

/// Per-worker mailboxes for remote execution.
#[derive(Default)]
pub struct RemoteDispatch {
    mailboxes: Mutex<HashMap<String, Mailbox>>,
}

impl RemoteDispatch {
    /// No mailboxes open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mailbox if none exists.
    pub fn open_mailbox(&self, worker_id: &str) {
        self.mailboxes
            .lock()
            .entry(worker_id.to_string())
            .or_default();
    }

    /// Whether `worker_id` has an open mailbox.
    pub fn has_mailbox(&self, worker_id: &str) -> bool {
        self.mailboxes.lock().contains_key(worker_id)
    }

    /// Drop a mailbox and fail everything still waiting in it. Returns how many
    /// tasks were failed.
    pub fn close_mailbox(&self, worker_id: &str) -> usize {
        let Some(mailbox) = self.mailboxes.lock().remove(worker_id) else {
            return 0;
        };
        let count = mailbox.pending.len();
        for (task_id, pending) in mailbox.pending {
            let _ = pending.reply.send(TaskResult::failure(
                task_id,
                worker_id,
                format!("Worker {worker_id} unregistered"),
                Utc::now(),
            ));
        }
        if count > 0 {
            warn!(worker_id = %worker_id, failed = count, "Mailbox closed with tasks outstanding");
        }
        count
    }

    /// Park a task for `worker_id` and return the channel its result arrives on.
    pub fn enqueue(
        &self,
        worker_id: &str,
        task: Task,
        progress: ProgressReporter,
    ) -> TaskmeshResult<oneshot::Receiver<TaskResult>> {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes
            .get_mut(worker_id)
            .ok_or_else(|| TaskmeshError::NotFound(format!("mailbox for worker {worker_id}")))?;
        let (tx, rx) = oneshot::channel();
        mailbox.pending.insert(
            task.id.clone(),
            Pending {
                reply: tx,
                progress,
                claimed: false,
            },
        );
        debug!(worker_id = %worker_id, task_id = %task.id, "Task parked in mailbox");
        mailbox.queued.push_back(task);
        Ok(rx)
    }

    /// Hand up to `max_tasks` queued tasks to the polling worker, together with
    /// any cancellations requested since the last poll.
    pub fn poll(&self, worker_id: &str, max_tasks: usize) -> TaskmeshResult<PollResponse> {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes
            .get_mut(worker_id)
            .ok_or_else(|| TaskmeshError::NotFound(format!("worker {worker_id}")))?;

        let mut tasks = Vec::new();
        while tasks.len() < max_tasks {
            let Some(task) = mailbox.queued.pop_front() else {
                break;
            };
            let abandoned = match mailbox.pending.get(&task.id) {
                Some(p) => p.reply.is_closed(),
                None => continue,
            };
            // The dispatcher gave up on this task (timeout or shutdown).
            if abandoned {
                mailbox.pending.remove(&task.id);
                continue;
            }
            if let Some(p) = mailbox.pending.get_mut(&task.id) {
                p.claimed = true;
            }
            tasks.push(task);
        }
        let cancelled: Vec<String> = mailbox.cancelled.drain().collect();
        Ok(PollResponse { tasks, cancelled })
    }

    /// Forward a progress report from the agent. False if the task is unknown.
    pub fn report_progress(&self, progress: &TaskProgress) -> bool {
        let mailboxes = self.mailboxes.lock();
        match mailboxes
            .get(&progress.worker_id)
            .and_then(|m| m.pending.get(&progress.task_id))
        {
            Some(pending) => {
                pending.progress.report(progress.progress, progress.message.clone());
                true
            }
            None => false,
        }
    }

    /// Deliver the agent's final result. False if nothing was waiting for it.
    pub fn complete(&self, result: TaskResult) -> bool {
        let mut mailboxes = self.mailboxes.lock();
        let Some(mailbox) = mailboxes.get_mut(&result.worker_id) else {
            return false;
        };
        mailbox.queued.retain(|t| t.id != result.task_id);
        mailbox.cancelled.remove(&result.task_id);
        match mailbox.pending.remove(&result.task_id) {
            Some(pending) => pending.reply.send(result).is_ok(),
            None => false,
        }
    }

    /// Request cancellation. An unclaimed task is failed immediately; a claimed
    /// one is flagged for the agent's next poll.
    pub fn cancel(&self, worker_id: &str, task_id: &str) -> bool {
        let mut mailboxes = self.mailboxes.lock();
        let Some(mailbox) = mailboxes.get_mut(worker_id) else {
            return false;
        };
        let claimed = match mailbox.pending.get(task_id) {
            Some(p) => p.claimed,
            None => return false,
        };
        if claimed {
            mailbox.cancelled.insert(task_id.to_string());
        } else {
            mailbox.queued.retain(|t| t.id != task_id);
            if let Some(p) = mailbox.pending.remove(task_id) {
                let _ = p.reply.send(TaskResult::failure(
                    task_id,
                    worker_id,
                    "Task cancelled before it was claimed",
                    Utc::now(),
                ));
            }
        }
        info!(worker_id = %worker_id, task_id = %task_id, claimed, "Remote cancellation requested");
        true
    }

    /// Number of tasks waiting for a result from `worker_id`.
    pub fn outstanding(&self, worker_id: &str) -> usize {
        self.mailboxes
            .lock()
            .get(worker_id)
            .map(|m| m.pending.len())
            .unwrap_or(0)
    }
}

/// Handler that runs tasks on a remote agent through its mailbox.
pub struct RemoteExecutor {
    worker_id: String,
    dispatch: Arc<RemoteDispatch>,
}

impl RemoteExecutor {
    /// An executor that forwards into `worker_id`'s mailbox.
    pub fn new(worker_id: impl Into<String>, dispatch: Arc<RemoteDispatch>) -> Self {
        Self {
            worker_id: worker_id.into(),
            dispatch,
        }
    }
}

#[async_trait]
impl TaskHandler for RemoteExecutor {
    async fn handle(&self, ctx: TaskContext) -> TaskmeshResult<Value> {
        let task_id = ctx.task.id.clone();
        let mut rx = self
            .dispatch
            .enqueue(&self.worker_id, ctx.task.clone(), ctx.progress.clone())?;

        let mut cancel_sent = false;
        let result = loop {
            tokio::select! {
                res = &mut rx => break res,
                _ = ctx.cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    self.dispatch.cancel(&self.worker_id, &task_id);
                }
            }
        };

        match result {
            Ok(r) if r.success => Ok(r.result.unwrap_or(Value::Null)),
            Ok(r) => Err(TaskmeshError::Worker(
                r.error.unwrap_or_else(|| "remote execution failed".into()),
            )),
            Err(_) => Err(TaskmeshError::Worker(format!(
                "Worker {} went away before reporting",
                self.worker_id
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn task(id: &str) -> Task {
        Task::new("shell", json!({"cmd": "ls"})).with_id(id)
    }

    #[tokio::test]
    async fn test_poll_and_complete() {
        let dispatch = RemoteDispatch::new();
        dispatch.open_mailbox("w1");
        let rx = dispatch
            .enqueue("w1", task("t1"), ProgressReporter::noop("t1", "w1"))
            .unwrap();

        let polled = dispatch.poll("w1", 5).unwrap();
        assert_eq!(polled.tasks.len(), 1);
        assert!(dispatch.poll("w1", 5).unwrap().tasks.is_empty());

        let done = TaskResult::success("t1", "w1", json!({"ok": true}), Utc::now());
        assert!(dispatch.complete(done));
        assert!(rx.await.unwrap().success);
        assert!(!dispatch.complete(TaskResult::success("t1", "w1", json!(1), Utc::now())));
    }

    #[test]
    fn test_unknown_mailbox() {
        let dispatch = RemoteDispatch::new();
        assert!(dispatch.poll("ghost", 1).is_err());
        assert!(dispatch
            .enqueue("ghost", task("t"), ProgressReporter::noop("t", "ghost"))
            .is_err());
    }

    #[test]
    fn test_poll_skips_abandoned_tasks() {
        let dispatch = RemoteDispatch::new();
        dispatch.open_mailbox("w1");
        let rx = dispatch
            .enqueue("w1", task("gone"), ProgressReporter::noop("gone", "w1"))
            .unwrap();
        drop(rx);
        let _keep = dispatch
            .enqueue("w1", task("live"), ProgressReporter::noop("live", "w1"))
            .unwrap();
        let polled = dispatch.poll("w1", 5).unwrap();
        assert_eq!(polled.tasks.len(), 1);
        assert_eq!(polled.tasks[0].id, "live");
        assert_eq!(dispatch.outstanding("w1"), 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let dispatch = RemoteDispatch::new();
        dispatch.open_mailbox("w1");
        let rx = dispatch
            .enqueue("w1", task("t1"), ProgressReporter::noop("t1", "w1"))
            .unwrap();
        assert_eq!(dispatch.close_mailbox("w1"), 1);
        let res = rx.await.unwrap();
        assert!(!res.success);
        assert!(res.error.unwrap().contains("unregistered"));
        assert!(!dispatch.has_mailbox("w1"));
    }

    #[tokio::test]
    async fn test_cancel_claimed_is_published_on_next_poll() {
        let dispatch = RemoteDispatch::new();
        dispatch.open_mailbox("w1");
        let _rx = dispatch
            .enqueue("w1", task("t1"), ProgressReporter::noop("t1", "w1"))
            .unwrap();
        dispatch.poll("w1", 1).unwrap();
        assert!(dispatch.cancel("w1", "t1"));
        let polled = dispatch.poll("w1", 1).unwrap();
        assert_eq!(polled.cancelled, vec!["t1"]);
        assert!(!dispatch.cancel("w1", "unknown"));
    }

    #[tokio::test]
    async fn test_cancel_unclaimed_fails_immediately() {
        let dispatch = RemoteDispatch::new();
        dispatch.open_mailbox("w1");
        let rx = dispatch
            .enqueue("w1", task("t1"), ProgressReporter::noop("t1", "w1"))
            .unwrap();
        assert!(dispatch.cancel("w1", "t1"));
        assert!(!rx.await.unwrap().success);
        assert!(dispatch.poll("w1", 1).unwrap().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_executor_round_trip() {
        let dispatch = Arc::new(RemoteDispatch::new());
        dispatch.open_mailbox("w1");
        let executor = RemoteExecutor::new("w1", dispatch.clone());

        let agent = {
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                loop {
                    let polled = dispatch.poll("w1", 1).unwrap();
                    if let Some(t) = polled.tasks.into_iter().next() {
                        dispatch.complete(TaskResult::success(
                            t.id,
                            "w1",
                            json!({"echo": t.payload}),
                            Utc::now(),
                        ));
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            })
        };

        let ctx = TaskContext {
            task: task("t1"),
            worker_id: "w1".into(),
            progress: ProgressReporter::noop("t1", "w1"),
            cancel: CancellationToken::new(),
        };
        let value = executor.handle(ctx).await.unwrap();
        assert_eq!(value["echo"]["cmd"], "ls");
        agent.await.unwrap();
    }
}
