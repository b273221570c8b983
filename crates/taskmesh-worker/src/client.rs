use crate::config::{Transport, WorkerAgentConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use taskmesh_bus::{BusConfig, MessageBus};
use taskmesh_core::protocol::{
    topics, Ack, HeartbeatResponse, PollRequest, PollResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, SubmitTaskResponse, WorkerIdRequest, HTTP_API_PREFIX,
};
use taskmesh_core::{Task, TaskProgress, TaskResult, TaskmeshError, TaskmeshResult};
use tracing::{debug, info};

/// The master as seen from a worker agent.
///
/// Unknown workers surface as [`TaskmeshError::NotFound`] so the agent can
/// re-register after the master forgot it.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn register(&self, request: &RegisterWorkerRequest)
        -> TaskmeshResult<RegisterWorkerResponse>;

    async fn heartbeat(&self, worker_id: &str) -> TaskmeshResult<HeartbeatResponse>;

    async fn unregister(&self, worker_id: &str) -> TaskmeshResult<Ack>;

    async fn poll(&self, request: &PollRequest) -> TaskmeshResult<PollResponse>;

    async fn report_progress(&self, progress: &TaskProgress) -> TaskmeshResult<Ack>;

    async fn report_result(&self, result: &TaskResult) -> TaskmeshResult<Ack>;

    /// Re-establish the underlying connection, if the transport has one.
    async fn reconnect(&self) -> TaskmeshResult<()> {
        Ok(())
    }
}

/// Build the client `config.transport` asks for.
pub async fn connect_client(config: &WorkerAgentConfig) -> TaskmeshResult<Arc<dyn MasterClient>> {
    match config.transport {
        Transport::Http => Ok(Arc::new(HttpMasterClient::new(
            &config.master_url,
            config.api_key.clone(),
        ))),
        Transport::Bus => Ok(Arc::new(BusMasterClient::connect(config.bus.clone()).await?)),
    }
}

// --- HTTP ---

/// Talks to the master's HTTP control surface.
pub struct HttpMasterClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpMasterClient {
    /// `master_url` is the server root, e.g. `http://127.0.0.1:8000`.
    pub fn new(master_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: format!("{}{HTTP_API_PREFIX}", master_url.trim_end_matches('/')),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    /// Root URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> TaskmeshResult<Resp> {
        let req = self.http.post(format!("{}{path}", self.base_url)).json(body);
        self.send(req).await
    }

    async fn get<Resp: DeserializeOwned>(&self, path: &str) -> TaskmeshResult<Resp> {
        let req = self.http.get(format!("{}{path}", self.base_url));
        self.send(req).await
    }

    async fn send<Resp: DeserializeOwned>(
        &self,
        mut req: reqwest::RequestBuilder,
    ) -> TaskmeshResult<Resp> {
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TaskmeshError::Gateway(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| TaskmeshError::Gateway(format!("Malformed response: {e}")));
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or(body);
        Err(match status.as_u16() {
            400 => TaskmeshError::InvalidInput(message),
            404 => TaskmeshError::NotFound(message),
            409 => TaskmeshError::Capacity(message),
            code => TaskmeshError::Gateway(format!("HTTP {code}: {message}")),
        })
    }

    /// Queue a task on the master.
    pub async fn submit_task(&self, task: &Task) -> TaskmeshResult<SubmitTaskResponse> {
        self.post("/tasks/submit", task).await
    }

    /// Fetch a recorded result; `NotFound` while the task has none.
    pub async fn task_result(&self, task_id: &str) -> TaskmeshResult<TaskResult> {
        self.get(&format!("/tasks/result/{task_id}")).await
    }

    /// The master's status report as raw JSON.
    pub async fn status(&self) -> TaskmeshResult<Value> {
        self.get("/status").await
    }

    /// Fetch the master's queue counters.
    pub async fn queue_stats(&self) -> TaskmeshResult<Value> {
        self.get("/queue/stats").await
    }
}

#[async_trait]
impl MasterClient for HttpMasterClient {
    async fn register(
        &self,
        request: &RegisterWorkerRequest,
    ) -> TaskmeshResult<RegisterWorkerResponse> {
        self.post("/registry/workers/register", request).await
    }

    async fn heartbeat(&self, worker_id: &str) -> TaskmeshResult<HeartbeatResponse> {
        self.post(
            "/registry/workers/heartbeat",
            &WorkerIdRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    async fn unregister(&self, worker_id: &str) -> TaskmeshResult<Ack> {
        self.post(
            "/registry/workers/unregister",
            &WorkerIdRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    async fn poll(&self, request: &PollRequest) -> TaskmeshResult<PollResponse> {
        self.post("/tasks/poll", request).await
    }

    async fn report_progress(&self, progress: &TaskProgress) -> TaskmeshResult<Ack> {
        self.post("/tasks/progress", progress).await
    }

    async fn report_result(&self, result: &TaskResult) -> TaskmeshResult<Ack> {
        self.post("/tasks/report", result).await
    }
}

// --- Bus ---

/// Talks to the master over the message bus as a satellite.
pub struct BusMasterClient {
    config: BusConfig,
    bus: RwLock<Arc<MessageBus>>,
}

impl BusMasterClient {
    /// Connect a bus satellite to the coordinator in `config`.
    pub async fn connect(config: BusConfig) -> TaskmeshResult<Self> {
        let bus = MessageBus::satellite(config.clone()).await?;
        Ok(Self {
            config,
            bus: RwLock::new(Arc::new(bus)),
        })
    }

    /// The current satellite connection.
    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.read().clone()
    }

    async fn call<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        topic: &str,
        body: &Req,
    ) -> TaskmeshResult<Resp> {
        let bus = self.bus();
        let reply = bus.request(topic, serde_json::to_value(body)?).await?;
        debug!(topic = %topic, "Bus reply received");
        Ok(serde_json::from_value(reply)?)
    }
}

#[async_trait]
impl MasterClient for BusMasterClient {
    async fn register(
        &self,
        request: &RegisterWorkerRequest,
    ) -> TaskmeshResult<RegisterWorkerResponse> {
        self.call(topics::REGISTER, request).await
    }

    async fn heartbeat(&self, worker_id: &str) -> TaskmeshResult<HeartbeatResponse> {
        self.call(
            topics::HEARTBEAT,
            &WorkerIdRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    async fn unregister(&self, worker_id: &str) -> TaskmeshResult<Ack> {
        self.call(
            topics::UNREGISTER,
            &WorkerIdRequest {
                worker_id: worker_id.to_string(),
            },
        )
        .await
    }

    async fn poll(&self, request: &PollRequest) -> TaskmeshResult<PollResponse> {
        self.call(topics::POLL, request).await
    }

    async fn report_progress(&self, progress: &TaskProgress) -> TaskmeshResult<Ack> {
        self.call(topics::PROGRESS, progress).await
    }

    async fn report_result(&self, result: &TaskResult) -> TaskmeshResult<Ack> {
        self.call(topics::REPORT, result).await
    }

    async fn reconnect(&self) -> TaskmeshResult<()> {
        if self.bus().is_connected() {
            return Ok(());
        }
        let fresh = MessageBus::satellite(self.config.clone()).await?;
        let stale = std::mem::replace(&mut *self.bus.write(), Arc::new(fresh));
        stale.shutdown().await;
        info!(host = %self.config.host, "Bus connection re-established");
        Ok(())
    }
}
