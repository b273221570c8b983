use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use taskmesh_core::{Task, TaskProgress, TaskResult, TaskmeshResult, WILDCARD};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callback that receives progress reports.
pub type ProgressSink = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// Handed to a handler so it can report intermediate progress.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    worker_id: String,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    /// A reporter that forwards to `sink`.
    pub fn new(task_id: impl Into<String>, worker_id: impl Into<String>, sink: ProgressSink) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            sink: Some(sink),
        }
    }

    /// A reporter that discards everything.
    pub fn noop(task_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            sink: None,
        }
    }

    /// Emit a progress report. `progress` is clamped into `[0, 1]`.
    pub fn report(&self, progress: f64, message: impl Into<String>) {
        if let Some(sink) = &self.sink {
            sink(TaskProgress::new(
                &self.task_id,
                &self.worker_id,
                progress,
                message,
            ));
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.task_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Everything a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The task being executed.
    pub task: Task,
    /// Worker executing it.
    pub worker_id: String,
    /// Progress channel back to the master.
    pub progress: ProgressReporter,
    /// Cooperative cancellation signal.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Id of the task being run.
    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// Payload of the task being run.
    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    /// Whether cancellation was requested for this attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The work a task type maps to.
///
/// Handlers receive the task, a progress reporter and a cancellation token,
/// and return an opaque JSON result or an error.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt of the task.
    async fn handle(&self, ctx: TaskContext) -> TaskmeshResult<Value>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    /// Wrap an async closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = TaskmeshResult<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> TaskmeshResult<Value> {
        (self.0)(ctx).await
    }
}

/// Maps task types to handlers, with `"*"` as the catch-all.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `task_type`, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    /// Register an async closure for `task_type`.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskmeshResult<Value>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler::new(f)));
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister(&mut self, task_type: &str) -> bool {
        self.handlers.remove(task_type).is_some()
    }

    /// Exact match first, then the wildcard.
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_type)
            .or_else(|| self.handlers.get(WILDCARD))
            .cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered task types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

/// Run one attempt of `task` through `handlers`.
///
/// Performs exactly one handler lookup, enforces the task's timeout, and
/// always yields a [`TaskResult`]; handler errors become failed results.
pub async fn invoke(
    handlers: &HandlerRegistry,
    task: Task,
    worker_id: &str,
    progress: ProgressReporter,
    cancel: CancellationToken,
) -> TaskResult {
    let started_at = Utc::now();
    let task_id = task.id.clone();
    let retries = task.retry_count;

    let Some(handler) = handlers.resolve(&task.task_type) else {
        warn!(task_id = %task_id, task_type = %task.task_type, "No handler registered");
        return TaskResult::failure(
            task_id,
            worker_id,
            format!("No handler for task type: {}", task.task_type),
            started_at,
        )
        .with_retries(retries);
    };

    let deadline = task.timeout_duration();
    let timeout_secs = task.timeout;
    let ctx = TaskContext {
        task,
        worker_id: worker_id.to_string(),
        progress,
        cancel,
    };

    debug!(task_id = %task_id, worker_id = %worker_id, "Invoking handler");
    match tokio::time::timeout(deadline, handler.handle(ctx)).await {
        Ok(Ok(value)) => TaskResult::success(task_id, worker_id, value, started_at),
        Ok(Err(e)) => TaskResult::failure(task_id, worker_id, e.to_string(), started_at)
            .with_retries(retries),
        Err(_) => TaskResult::failure(
            task_id,
            worker_id,
            format!("Task timed out after {timeout_secs}s"),
            started_at,
        )
        .with_retries(retries),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use taskmesh_core::TaskmeshError;

    fn registry() -> HandlerRegistry {
        let mut reg = HandlerRegistry::new();
        reg.register_fn("shell", |ctx: TaskContext| async move {
            Ok::<_, TaskmeshError>(json!({"ran": ctx.payload()["cmd"].clone()}))
        });
        reg.register_fn("explode", |_ctx: TaskContext| async move {
            Err::<Value, _>(TaskmeshError::Handler("exploded".into()))
        });
        reg
    }

    #[tokio::test]
    async fn test_exact_match() {
        let task = Task::new("shell", json!({"cmd": "ls"})).with_id("t1");
        let res = invoke(
            &registry(),
            task,
            "w1",
            ProgressReporter::noop("t1", "w1"),
            CancellationToken::new(),
        )
        .await;
        assert!(res.success);
        assert_eq!(res.result.unwrap()["ran"], "ls");
        assert_eq!(res.worker_id, "w1");
    }

    #[tokio::test]
    async fn test_no_handler() {
        let task = Task::new("web_search", json!({})).with_id("t2");
        let res = invoke(
            &registry(),
            task,
            "w1",
            ProgressReporter::noop("t2", "w1"),
            CancellationToken::new(),
        )
        .await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("No handler for task type: web_search"));
    }

    #[tokio::test]
    async fn test_wildcard_fallback() {
        let mut reg = registry();
        reg.register_fn("*", |ctx: TaskContext| async move {
            Ok::<_, TaskmeshError>(json!({"echo": ctx.task.task_type}))
        });
        let task = Task::new("web_search", json!({})).with_id("t3");
        let res = invoke(
            &reg,
            task,
            "w1",
            ProgressReporter::noop("t3", "w1"),
            CancellationToken::new(),
        )
        .await;
        assert!(res.success);
        assert_eq!(res.result.unwrap()["echo"], "web_search");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_result() {
        let task = Task::new("explode", json!({})).with_id("t4").with_retry_count(2);
        let res = invoke(
            &registry(),
            task,
            "w1",
            ProgressReporter::noop("t4", "w1"),
            CancellationToken::new(),
        )
        .await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("exploded"));
        assert_eq!(res.retries_used, 2);
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let mut reg = HandlerRegistry::new();
        reg.register_fn("slow", |_ctx: TaskContext| async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok::<_, TaskmeshError>(json!(null))
        });
        let task = Task::new("slow", json!({})).with_id("t5").with_timeout(0.05);
        let res = invoke(
            &reg,
            task,
            "w1",
            ProgressReporter::noop("t5", "w1"),
            CancellationToken::new(),
        )
        .await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_progress_reaches_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |p: TaskProgress| sink_seen.lock().push(p));

        let mut reg = HandlerRegistry::new();
        reg.register_fn("steps", |ctx: TaskContext| async move {
            ctx.progress.report(0.5, "halfway");
            ctx.progress.report(1.0, "done");
            Ok::<_, TaskmeshError>(json!(true))
        });
        let task = Task::new("steps", json!({})).with_id("t6");
        let res = invoke(
            &reg,
            task,
            "w9",
            ProgressReporter::new("t6", "w9", sink),
            CancellationToken::new(),
        )
        .await;
        assert!(res.success);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].message, "halfway");
        assert_eq!(seen[1].worker_id, "w9");
    }

    #[test]
    fn test_registry_types() {
        let mut reg = registry();
        assert_eq!(reg.task_types(), vec!["explode", "shell"]);
        assert!(reg.unregister("explode"));
        assert!(!reg.unregister("explode"));
        assert_eq!(reg.len(), 1);
    }
}
