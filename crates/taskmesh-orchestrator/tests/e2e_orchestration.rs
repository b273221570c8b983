//! End-to-end dispatch tests.
//!
//! Drives the master loop with real in-process workers and checks priority
//! ordering, load distribution across weighted workers, circuit breaking of a
//! failing worker, and remote execution through the mailbox bridge.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{Task, TaskPriority, TaskResult, TaskmeshError};
use taskmesh_orchestrator::*;

fn echo_worker(id: &str) -> Worker {
    Worker::new(id, ["*"]).with_handler_fn("*", |ctx: TaskContext| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok::<_, TaskmeshError>(json!({"echo": ctx.task.payload, "worker": ctx.worker_id}))
    })
}

fn fast_master(strategy: LoadBalancingStrategy) -> MasterAgent {
    MasterAgent::new(MasterConfig {
        strategy,
        dispatch_interval: Duration::from_millis(5),
        ..MasterConfig::default()
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// Priority scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_high_priority_dispatched_first() {
    let master = fast_master(LoadBalancingStrategy::LeastLoaded);
    master.register_worker(echo_worker("w1"));
    master.register_worker(echo_worker("w2"));

    let n1 = master
        .submit_task(Task::new("shell", json!({"n": 1})))
        .await
        .unwrap();
    let n2 = master
        .submit_task(Task::new("shell", json!({"n": 2})))
        .await
        .unwrap();
    let high = master
        .submit_task(Task::new("shell", json!({"n": 3})).with_priority(TaskPriority::High))
        .await
        .unwrap();

    let summary = master.run(Duration::from_secs(10)).await;
    assert_eq!(summary.total_tasks, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.successful, 3);

    let high_started = summary.results[&high].started_at;
    assert!(high_started <= summary.results[&n1].started_at);
    assert!(high_started <= summary.results[&n2].started_at);
}

// ---------------------------------------------------------------------------
// Load distribution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_round_robin_spreads_work() {
    let master = fast_master(LoadBalancingStrategy::RoundRobin);
    master.register_worker(echo_worker("w1"));
    master.register_worker(echo_worker("w2"));

    let tasks: Vec<Task> = (0..6).map(|i| Task::new("shell", json!(i))).collect();
    master.submit_tasks(tasks).await.unwrap();
    let summary = master.run(Duration::from_secs(10)).await;
    assert_eq!(summary.successful, 6);

    let on_w1 = summary
        .results
        .values()
        .filter(|r| r.worker_id == "w1")
        .count();
    assert!(on_w1 > 0 && on_w1 < 6);
    let stats = master.get_worker_pool_stats();
    assert_eq!(stats.total_tasks_completed, 6);
    assert_eq!(stats.idle_workers, 2);
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_worker_is_circuit_broken() {
    let master = MasterAgent::new(MasterConfig {
        strategy: LoadBalancingStrategy::RoundRobin,
        dispatch_interval: Duration::from_millis(5),
        max_failures: 2,
        ..MasterConfig::default()
    })
    .unwrap();
    master.register_worker(Worker::new("broken", ["shell"]).with_handler_fn(
        "shell",
        |_ctx: TaskContext| async move {
            Err::<Value, _>(TaskmeshError::Handler("disk full".into()))
        },
    ));
    master.register_worker(echo_worker("healthy"));

    for i in 0..8 {
        master
            .submit_task(Task::new("shell", json!(i)))
            .await
            .unwrap();
    }
    let summary = master.run(Duration::from_secs(10)).await;
    assert_eq!(summary.total_tasks, 8);
    assert!(summary.failed >= 2);
    assert_eq!(summary.successful + summary.failed, 8);
    assert!(master.balancer().is_circuit_open("broken"));
    let broken = master.pool().get_worker("broken").unwrap();
    assert_eq!(broken.tasks_failed() as usize, summary.failed);

    let status = master.get_status().await;
    assert!(status.circuit_breakers["broken"].circuit_open);
}

// ---------------------------------------------------------------------------
// Remote bridge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_remote_worker_through_mailbox() {
    let master = fast_master(LoadBalancingStrategy::LeastLoaded);
    let dispatch = Arc::new(RemoteDispatch::new());
    dispatch.open_mailbox("remote-1");
    master.register_worker(
        Worker::new("remote-1", ["shell"])
            .with_kind(WorkerKind::Remote)
            .with_handler("*", Arc::new(RemoteExecutor::new("remote-1", dispatch.clone()))),
    );

    // Simulated agent: poll, report progress, finish.
    let agent = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move {
            loop {
                let polled = dispatch.poll("remote-1", 1).unwrap();
                if let Some(task) = polled.tasks.into_iter().next() {
                    dispatch.report_progress(&taskmesh_core::TaskProgress::new(
                        &task.id, "remote-1", 0.5, "halfway",
                    ));
                    dispatch.complete(TaskResult::success(
                        task.id.clone(),
                        "remote-1",
                        json!({"remote": true}),
                        chrono::Utc::now(),
                    ));
                    return task.id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let id = master
        .submit_task(Task::new("shell", json!({"cmd": "uptime"})))
        .await
        .unwrap();
    let summary = master.run(Duration::from_secs(5)).await;
    assert_eq!(agent.await.unwrap(), id);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.results[&id].result.as_ref().unwrap()["remote"], true);
    assert_eq!(
        master.progress_hub().latest(&id).unwrap().message,
        "halfway"
    );
}
