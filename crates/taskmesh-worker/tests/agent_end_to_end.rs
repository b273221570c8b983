//! Worker agents against a live master.
//!
//! Each test boots a master with its control plane, exposes it over HTTP or
//! the message bus, and lets a real [`WorkerAgent`] claim and run tasks.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_bus::{BusConfig, MessageBus};
use taskmesh_core::{Task, TaskStatus};
use taskmesh_gateway::{AuthConfig, BusBridge, ControlPlane, GatewayServer};
use taskmesh_orchestrator::{MasterAgent, MasterConfig};
use taskmesh_registry::{RegistryConfig, WorkerRegistry};
use taskmesh_worker::*;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Master {
    plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
}

impl Master {
    fn new() -> Self {
        let master = Arc::new(
            MasterAgent::new(MasterConfig {
                dispatch_interval: Duration::from_millis(5),
                ..MasterConfig::default()
            })
            .unwrap(),
        );
        let registry = Arc::new(WorkerRegistry::new(RegistryConfig::default()));
        let plane = Arc::new(ControlPlane::new(master.clone(), registry).unwrap());

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { master.serve(token).await });
        Self { plane, shutdown }
    }

    async fn serve_http(&self, auth: AuthConfig) -> String {
        let app = GatewayServer::build_with_auth(self.plane.clone(), auth);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn wait_for_status(&self, task_id: &str, status: TaskStatus) {
        for _ in 0..600 {
            if self.plane.master().task_status(task_id).await == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status:?}");
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn quick(worker_id: &str) -> WorkerAgentConfig {
    WorkerAgentConfig {
        max_concurrent_tasks: 2,
        heartbeat_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        reconnect_delay: Duration::from_millis(20),
        ..WorkerAgentConfig::new(worker_id, ["*"])
    }
}

fn spawn_agent(agent: &Arc<WorkerAgent>) -> tokio::task::JoinHandle<()> {
    let agent = agent.clone();
    tokio::spawn(async move { agent.start().await.unwrap() })
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_http_agent_executes_tasks() {
    let master = Master::new();
    let url = master.serve_http(AuthConfig::new(vec!["secret".into()])).await;

    let config = WorkerAgentConfig {
        master_url: url.clone(),
        api_key: Some("secret".into()),
        ..quick("remote-1")
    };
    let agent = Arc::new(WorkerAgent::connect(config).await.unwrap().with_handlers(default_handlers()));
    let runner = spawn_agent(&agent);

    let client = HttpMasterClient::new(&url, Some("secret".into()));
    let echo = client
        .submit_task(&Task::new("greet", json!({"name": "ada"})).with_id("echo-1"))
        .await
        .unwrap();
    let upper = client
        .submit_task(
            &Task::new(
                "text_processing",
                json!({"text": "quiet", "operation": "uppercase"}),
            )
            .with_id("upper-1"),
        )
        .await
        .unwrap();

    master.wait_for_status(&echo.task_id, TaskStatus::Completed).await;
    master.wait_for_status(&upper.task_id, TaskStatus::Completed).await;

    let result = client.task_result("echo-1").await.unwrap();
    assert_eq!(result.worker_id, "remote-1");
    assert_eq!(result.result.unwrap()["echo"]["name"], "ada");
    let result = client.task_result("upper-1").await.unwrap();
    assert_eq!(result.result.unwrap()["result"], "QUIET");
    assert_eq!(agent.tasks_executed(), 2);

    agent.stop().await;
    runner.await.unwrap();
    assert!(master.plane.registry().get_worker("remote-1").await.is_none());
    assert!(master.plane.master().pool().get_worker("remote-1").is_none());
}

#[tokio::test]
async fn test_http_agent_rejected_without_key() {
    let master = Master::new();
    let url = master.serve_http(AuthConfig::new(vec!["secret".into()])).await;

    let agent = Arc::new(
        WorkerAgent::connect(WorkerAgentConfig {
            master_url: url,
            ..quick("remote-2")
        })
        .await
        .unwrap(),
    );
    let err = agent.start().await.unwrap_err();
    assert!(err.to_string().contains("401"));
    assert_eq!(agent.state(), AgentState::Disconnected);
}

#[tokio::test]
async fn test_handler_failure_fails_task_at_master() {
    let master = Master::new();
    let url = master.serve_http(AuthConfig::default()).await;

    let agent = Arc::new(
        WorkerAgent::connect(WorkerAgentConfig {
            master_url: url,
            ..quick("remote-3")
        })
        .await
        .unwrap()
        .with_handlers(default_handlers()),
    );
    let runner = spawn_agent(&agent);

    let task = Task::new("text_processing", json!({"text": "x", "operation": "rot13"}))
        .with_id("bad-op");
    master.plane.submit_task(task).await.unwrap();
    master.wait_for_status("bad-op", TaskStatus::Failed).await;

    let result = master.plane.master().get_task_result("bad-op").unwrap();
    assert!(result.error.unwrap().contains("Unknown text operation: rot13"));
    assert_eq!(agent.tasks_failed(), 1);

    agent.stop().await;
    runner.await.unwrap();
}

// ---------------------------------------------------------------------------
// Bus transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bus_agent_executes_tasks() {
    let master = Master::new();
    let coord = Arc::new(
        MessageBus::coordinator(BusConfig {
            pub_port: 0,
            rep_port: 0,
            ..BusConfig::default()
        })
        .await
        .unwrap(),
    );
    let _bridge = BusBridge::attach(coord.clone(), master.plane.clone()).unwrap();

    let config = WorkerAgentConfig {
        transport: Transport::Bus,
        bus: BusConfig {
            pub_port: coord.pub_addr().unwrap().port(),
            rep_port: coord.rep_addr().unwrap().port(),
            request_timeout: Duration::from_secs(2),
            ..BusConfig::default()
        },
        ..quick("bus-1")
    };
    let agent = Arc::new(WorkerAgent::connect(config).await.unwrap().with_handlers(default_handlers()));
    let runner = spawn_agent(&agent);

    master
        .plane
        .submit_task(
            Task::new("text_processing", json!({"text": "abc", "operation": "reverse"}))
                .with_id("rev-1"),
        )
        .await
        .unwrap();
    master.wait_for_status("rev-1", TaskStatus::Completed).await;

    let result = master.plane.master().get_task_result("rev-1").unwrap();
    assert_eq!(result.worker_id, "bus-1");
    assert_eq!(result.result.unwrap()["result"], "cba");

    agent.stop().await;
    runner.await.unwrap();
    assert!(master.plane.registry().get_worker("bus-1").await.is_none());
}
