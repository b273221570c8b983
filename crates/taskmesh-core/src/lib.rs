//! Core types and error definitions for the Taskmesh orchestrator.
//!
//! This crate provides the foundational types shared across all Taskmesh crates:
//! the task model, the unified error type, capability matching, the
//! [`DispatchTarget`] seam used by the load balancer, an isolated-failure
//! observer list, and the JSON wire protocol spoken between master and workers.
//!
//! # Main types
//!
//! - [`TaskmeshError`]: Unified error enum for all Taskmesh subsystems.
//! - [`TaskmeshResult`]: Convenience alias for `Result<T, TaskmeshError>`.
//! - [`Task`]: A schedulable unit of work.
//! - [`TaskResult`]: The outcome of one dispatched attempt.
//! - [`TaskProgress`]: An intermediate progress report.
//! - [`DispatchTarget`]: Anything the load balancer can pick.

/// Capability tags and wildcard matching.
pub mod capability;
/// Isolated-failure observer lists.
pub mod observer;
/// Request/response bodies shared by the HTTP surface, the bus and the worker agent.
pub mod protocol;
/// Task model: Task, TaskResult, TaskProgress, TaskStatus, TaskPriority.
pub mod task;
/// Worker status and the dispatch-target seam.
pub mod target;

pub use capability::{capability_matches, WILDCARD};
pub use observer::{Observer, ObserverList, SubscriptionId};
pub use task::{Task, TaskPriority, TaskProgress, TaskResult, TaskStatus};
pub use target::{DispatchTarget, HealthStatus, WorkerStatus};

// --- Error types ---

/// Top-level error type for the Taskmesh orchestrator.
///
/// Each variant corresponds to a subsystem or an error class that can be
/// surfaced to a caller.
#[derive(Debug, thiserror::Error)]
pub enum TaskmeshError {
    /// Malformed input rejected synchronously (empty worker id, duplicate task id, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A capacity ceiling was hit (registry full).
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// A referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error raised by a task handler during execution.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A handler or request exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An error from the priority queue.
    #[error("Queue error: {0}")]
    Queue(String),

    /// An error from a worker or the worker pool.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error from the worker registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// An error from the message bus transport.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error from the HTTP control surface or a client talking to it.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskmeshError {
    /// Whether the error is a transport-level failure worth reconnecting over.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TaskmeshError::Io(_)
                | TaskmeshError::Bus(_)
                | TaskmeshError::Gateway(_)
                | TaskmeshError::Timeout(_)
                | TaskmeshError::NotFound(_)
        )
    }
}

/// A convenience `Result` alias using [`TaskmeshError`].
pub type TaskmeshResult<T> = Result<T, TaskmeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TaskmeshError::Capacity("Maximum worker limit (2) reached".into());
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: Maximum worker limit (2) reached"
        );
    }

    #[test]
    fn test_json_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TaskmeshError = parse.unwrap_err().into();
        assert!(matches!(err, TaskmeshError::Json(_)));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(TaskmeshError::Gateway("connection refused".into()).is_connectivity());
        assert!(TaskmeshError::NotFound("worker w1".into()).is_connectivity());
        assert!(!TaskmeshError::InvalidInput("empty id".into()).is_connectivity());
        assert!(!TaskmeshError::Handler("boom".into()).is_connectivity());
    }
}
