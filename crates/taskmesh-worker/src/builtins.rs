use crate::agent::WorkerAgent;
use crate::client::MasterClient;
use crate::config::WorkerAgentConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use taskmesh_core::{TaskmeshError, TaskmeshResult, WILDCARD};
use taskmesh_orchestrator::{HandlerRegistry, TaskContext};

/// Echo the payload back. Registered as the wildcard handler.
async fn echo(ctx: TaskContext) -> TaskmeshResult<Value> {
    ctx.progress.report(1.0, "echoed");
    Ok(json!({
        "task_type": ctx.task.task_type,
        "echo": ctx.task.payload,
        "worker_id": ctx.worker_id,
    }))
}

/// Simple string transforms on `payload.text`.
async fn text_processing(ctx: TaskContext) -> TaskmeshResult<Value> {
    let text = ctx.payload()["text"].as_str().unwrap_or_default();
    let operation = ctx.payload()["operation"].as_str().unwrap_or("uppercase");
    ctx.progress.report(0.1, format!("Processing text: {operation}"));

    let result = match operation {
        "uppercase" => json!(text.to_uppercase()),
        "lowercase" => json!(text.to_lowercase()),
        "reverse" => json!(text.chars().rev().collect::<String>()),
        "word_count" => json!({
            "word_count": text.split_whitespace().count(),
            "char_count": text.chars().count(),
        }),
        other => {
            return Err(TaskmeshError::Handler(format!(
                "Unknown text operation: {other}"
            )))
        }
    };

    ctx.progress.report(1.0, "Text processing completed");
    Ok(json!({ "result": result, "operation": operation }))
}

/// Handlers every default worker carries.
pub fn default_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn(WILDCARD, echo);
    handlers.register_fn("text_processing", text_processing);
    handlers
}

/// An agent with [`default_handlers`] installed.
pub fn create_default_worker(
    config: WorkerAgentConfig,
    client: Arc<dyn MasterClient>,
) -> TaskmeshResult<WorkerAgent> {
    Ok(WorkerAgent::new(config, client)?.with_handlers(default_handlers()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskmesh_core::Task;
    use taskmesh_orchestrator::{invoke, ProgressReporter};
    use tokio_util::sync::CancellationToken;

    async fn run(task: Task) -> taskmesh_core::TaskResult {
        let id = task.id.clone();
        invoke(
            &default_handlers(),
            task,
            "w1",
            ProgressReporter::noop(id, "w1"),
            CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_echo_catches_everything() {
        let res = run(Task::new("anything", json!({"n": 1})).with_id("t1")).await;
        assert!(res.success);
        let value = res.result.unwrap();
        assert_eq!(value["echo"]["n"], 1);
        assert_eq!(value["task_type"], "anything");
    }

    #[tokio::test]
    async fn test_text_processing() {
        let res = run(
            Task::new(
                "text_processing",
                json!({"text": "hello big world", "operation": "word_count"}),
            )
            .with_id("t2"),
        )
        .await;
        assert_eq!(res.result.unwrap()["result"]["word_count"], 3);

        let res = run(
            Task::new("text_processing", json!({"text": "abc", "operation": "rot13"}))
                .with_id("t3"),
        )
        .await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("Unknown text operation: rot13"));
    }
}
