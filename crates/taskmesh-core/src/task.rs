use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle state of a [`Task`].
///
/// `Pending` is the only initial state; `Completed`, `Failed` and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Removed before dispatch, or cancelled while running.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition can happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::TaskmeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(crate::TaskmeshError::InvalidInput(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Named priority levels. Any integer is a valid priority; these are
/// the conventional anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// 0
    Low,
    /// 5
    Normal,
    /// 10
    High,
    /// 15
    Critical,
}

impl TaskPriority {
    /// Numeric value used for ordering.
    pub fn value(self) -> i32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 5,
            TaskPriority::High => 10,
            TaskPriority::Critical => 15,
        }
    }
}

impl From<TaskPriority> for i32 {
    fn from(p: TaskPriority) -> Self {
        p.value()
    }
}

fn default_task_type() -> String {
    "custom".to_string()
}

fn default_payload() -> Value {
    Value::Object(serde_json::Map::new())
}

fn default_priority() -> i32 {
    TaskPriority::Normal.value()
}

fn default_timeout() -> f64 {
    300.0
}

fn default_retry_count() -> u32 {
    3
}

/// A unit of schedulable work.
///
/// The `task_type` selects the handler and is matched against worker
/// capabilities. An empty `id` is replaced with a fresh UUID on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier. Accepts `task_id` on input.
    #[serde(default, alias = "task_id")]
    pub id: String,
    /// Capability tag, e.g. `"shell"`.
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    /// Opaque data handed verbatim to the handler.
    #[serde(default = "default_payload")]
    pub payload: Value,
    /// Higher runs first.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Ids that must reach `Completed` before this task is ready.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Execution deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Advisory retry budget surfaced to handlers; not enforced by the queue.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Arbitrary caller metadata.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Submission time, used as the ordering tie-break.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    /// Create a pending task with a generated id and default settings.
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            priority: default_priority(),
            dependencies: Vec::new(),
            timeout: default_timeout(),
            retry_count: default_retry_count(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            status: TaskStatus::Pending,
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority from a named level or any integer.
    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Set the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the timeout in seconds.
    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = secs;
        self
    }

    /// Set the advisory retry count.
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    /// Insert a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Assign a fresh UUID if the id is empty. Returns the final id.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// Whether the task has been alive longer than its timeout.
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.num_milliseconds() as f64 / 1000.0 > self.timeout
    }

    /// Timeout as a [`std::time::Duration`]; non-positive or unrepresentable
    /// values fall back to the 300 second default.
    pub fn timeout_duration(&self) -> std::time::Duration {
        let fallback = std::time::Duration::from_secs_f64(default_timeout());
        if self.timeout > 0.0 {
            std::time::Duration::try_from_secs_f64(self.timeout).unwrap_or(fallback)
        } else {
            fallback
        }
    }
}

/// Outcome of exactly one dispatched attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    /// Task this result belongs to.
    pub task_id: String,
    /// Worker that ran it.
    pub worker_id: String,
    /// Whether the handler returned successfully.
    pub success: bool,
    /// Handler output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Retries consumed by this attempt.
    #[serde(default)]
    pub retries_used: u32,
    /// When execution started.
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    /// When the result was produced.
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    /// Successful result with the handler's output.
    pub fn success(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        result: Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            success: true,
            result: Some(result),
            error: None,
            duration: elapsed_secs(started_at, completed_at),
            retries_used: 0,
            started_at,
            completed_at,
        }
    }

    /// Failed result carrying an error message.
    pub fn failure(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration: elapsed_secs(started_at, completed_at),
            retries_used: 0,
            started_at,
            completed_at,
        }
    }

    /// Set the retry counter.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_used = retries;
        self
    }
}

fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(0.0)
        .max(0.0)
}

/// Intermediate progress report for a running task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    /// Task being reported on.
    pub task_id: String,
    /// Worker running it.
    pub worker_id: String,
    /// Fraction complete in `[0, 1]`.
    pub progress: f64,
    /// Free-form status line.
    #[serde(default)]
    pub message: String,
    /// When the report was produced.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TaskProgress {
    /// Build a report, clamping `progress` into `[0, 1]`.
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        progress: f64,
        message: impl Into<String>,
    ) -> Self {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            progress,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_defaults() {
        let task = Task::new("shell", json!({"cmd": "ls"}));
        assert!(!task.id.is_empty());
        assert_eq!(task.priority, 5);
        assert_eq!(task.timeout, 300.0);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_task_wire_defaults() {
        let task: Task = serde_json::from_value(json!({"payload": {"x": 1}})).unwrap();
        assert!(task.id.is_empty());
        assert_eq!(task.task_type, "custom");
        assert_eq!(task.priority, TaskPriority::Normal.value());
        assert_eq!(task.retry_count, 3);

        let json = serde_json::to_value(Task::new("shell", json!({}))).unwrap();
        assert_eq!(json["type"], "shell");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_ensure_id_only_fills_empty() {
        let mut task = Task::new("shell", json!({})).with_id("");
        let generated = task.ensure_id().to_string();
        assert!(!generated.is_empty());
        assert_eq!(task.ensure_id(), generated);

        let mut named = Task::new("shell", json!({})).with_id("fixed");
        assert_eq!(named.ensure_id(), "fixed");
    }

    #[test]
    fn test_builders() {
        let task = Task::new("shell", json!({}))
            .with_priority(TaskPriority::Critical)
            .with_dependencies(["a", "b"])
            .with_timeout(2.5)
            .with_metadata("origin", json!("cli"));
        assert_eq!(task.priority, 15);
        assert_eq!(task.dependencies, vec!["a", "b"]);
        assert_eq!(task.timeout_duration().as_millis(), 2500);
        assert_eq!(task.metadata["origin"], "cli");

        let odd = Task::new("shell", json!({})).with_priority(7);
        assert_eq!(odd.priority, 7);
    }

    #[test]
    fn test_is_expired() {
        let mut task = Task::new("shell", json!({})).with_timeout(1.0);
        assert!(!task.is_expired());
        task.created_at = Utc::now() - chrono::Duration::seconds(5);
        assert!(task.is_expired());
    }

    #[test]
    fn test_status_parse_and_terminal() {
        assert_eq!("Completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("bogus".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(TaskProgress::new("t", "w", 1.7, "").progress, 1.0);
        assert_eq!(TaskProgress::new("t", "w", -0.2, "").progress, 0.0);
        assert_eq!(TaskProgress::new("t", "w", 0.4, "half").progress, 0.4);
    }

    #[test]
    fn test_result_constructors() {
        let start = Utc::now();
        let ok = TaskResult::success("t1", "w1", json!({"out": 1}), start);
        assert!(ok.success);
        assert!(ok.error.is_none());
        assert!(ok.duration >= 0.0);

        let err = TaskResult::failure("t1", "w1", "boom", start).with_retries(3);
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert_eq!(err.retries_used, 3);
    }
}
