use std::sync::Arc;
use taskmesh_core::protocol::{
    Ack, CancelTaskResponse, HeartbeatResponse, PollRequest, PollResponse, RegisterWorkerRequest,
    RegisterWorkerResponse, SubmitBatchResponse, SubmitTaskResponse,
};
use taskmesh_core::{
    SubscriptionId, Task, TaskProgress, TaskResult, TaskmeshError, TaskmeshResult, WILDCARD,
};
use taskmesh_orchestrator::{MasterAgent, RemoteDispatch, RemoteExecutor, Worker, WorkerKind};
use taskmesh_registry::{ServiceDiscovery, WorkerInfo, WorkerRegistry};
use tracing::{debug, info};

/// Operations the master offers to remote callers, independent of transport.
///
/// Registering a remote worker records it in the registry and adds a pool
/// worker whose handler forwards into that worker's mailbox. Removal from the
/// registry, explicit or by the health loop, detaches both again.
pub struct ControlPlane {
    master: Arc<MasterAgent>,
    registry: Arc<WorkerRegistry>,
    discovery: ServiceDiscovery,
    dispatch: Arc<RemoteDispatch>,
    detach_subscription: SubscriptionId,
}

impl ControlPlane {
    /// Wire a control plane over `master` and `registry`.
    pub fn new(master: Arc<MasterAgent>, registry: Arc<WorkerRegistry>) -> TaskmeshResult<Self> {
        let dispatch = Arc::new(RemoteDispatch::new());
        let detach_subscription = {
            let master = master.clone();
            let dispatch = dispatch.clone();
            registry.subscribe("unregister", move |event| {
                detach(&master, &dispatch, event.worker_id());
            })?
        };
        Ok(Self {
            discovery: ServiceDiscovery::new(registry.clone()),
            master,
            registry,
            dispatch,
            detach_subscription,
        })
    }

    /// The master this plane fronts.
    pub fn master(&self) -> &Arc<MasterAgent> {
        &self.master
    }

    /// The worker registry.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Capability lookups over the registry.
    pub fn discovery(&self) -> &ServiceDiscovery {
        &self.discovery
    }

    /// Mailboxes of the attached remote workers.
    pub fn dispatch(&self) -> &Arc<RemoteDispatch> {
        &self.dispatch
    }

    // --- Remote workers ---

    /// Record a remote worker and attach its pool worker and mailbox.
    pub async fn register_worker(
        &self,
        request: RegisterWorkerRequest,
    ) -> TaskmeshResult<RegisterWorkerResponse> {
        let info = self
            .registry
            .register_worker(WorkerInfo::from(request))
            .await?;
        self.dispatch.open_mailbox(&info.worker_id);

        let pool = self.master.pool();
        match pool.get_worker(&info.worker_id) {
            // Keep the slot accounting of tasks already running there.
            Some(existing) if !existing.active_tasks().is_empty() => {
                existing.update_profile(
                    info.capabilities.clone(),
                    info.weight,
                    info.max_concurrent_tasks,
                );
                existing.update_heartbeat();
                debug!(
                    worker_id = %info.worker_id,
                    running = existing.active_tasks().len(),
                    "Pool worker profile refreshed in place"
                );
            }
            _ => {
                let executor = RemoteExecutor::new(info.worker_id.clone(), self.dispatch.clone());
                self.master.register_worker(
                    Worker::new(info.worker_id.clone(), info.capabilities.clone())
                        .with_kind(WorkerKind::Remote)
                        .with_weight(info.weight)
                        .with_max_concurrent_tasks(info.max_concurrent_tasks)
                        .with_handler(WILDCARD, Arc::new(executor)),
                );
            }
        }

        info!(worker_id = %info.worker_id, capabilities = ?info.capabilities, "Remote worker attached");
        Ok(RegisterWorkerResponse {
            success: true,
            message: format!("Worker {} registered successfully", info.worker_id),
            worker_id: info.worker_id,
            address: info.address,
            capabilities: info.capabilities,
        })
    }

    /// Remove a remote worker. Detaching follows from the registry event.
    pub async fn unregister_worker(&self, worker_id: &str) -> Ack {
        if self.registry.unregister_worker(worker_id).await {
            Ack::new(true, format!("Worker {worker_id} unregistered"))
        } else {
            Ack::new(false, format!("Worker not found: {worker_id}"))
        }
    }

    /// Refresh liveness in the registry and the pool.
    pub async fn heartbeat(&self, worker_id: &str) -> TaskmeshResult<HeartbeatResponse> {
        let info = self
            .registry
            .update_heartbeat(worker_id)
            .await
            .ok_or_else(|| TaskmeshError::NotFound(format!("Worker not found: {worker_id}")))?;
        if let Some(worker) = self.master.pool().get_worker(worker_id) {
            worker.update_heartbeat();
        }
        Ok(HeartbeatResponse {
            success: true,
            worker_id: info.worker_id,
            health_status: info.health_status,
            last_heartbeat: info.last_heartbeat,
        })
    }

    /// Hand queued work to a polling agent. A poll also counts as liveness
    /// for the pool worker and refreshes the registry's load figure.
    /// `max_tasks == 0` only collects pending cancellations.
    pub async fn poll(&self, request: &PollRequest) -> TaskmeshResult<PollResponse> {
        let response = self.dispatch.poll(&request.worker_id, request.max_tasks)?;
        if let Some(worker) = self.master.pool().get_worker(&request.worker_id) {
            worker.update_heartbeat();
            self.registry
                .update_load(&request.worker_id, worker.active_tasks().len())
                .await;
        }
        if !response.tasks.is_empty() || !response.cancelled.is_empty() {
            debug!(
                worker_id = %request.worker_id,
                tasks = response.tasks.len(),
                cancelled = response.cancelled.len(),
                "Poll answered"
            );
        }
        Ok(response)
    }

    /// Forward progress from a remote agent to the master's subscribers.
    pub fn report_progress(&self, progress: &TaskProgress) -> Ack {
        if self.dispatch.report_progress(progress) {
            Ack::new(true, "")
        } else {
            Ack::new(false, format!("No running task {} on {}", progress.task_id, progress.worker_id))
        }
    }

    /// Settle a remote task with the agent's result.
    pub fn report_result(&self, result: TaskResult) -> Ack {
        let task_id = result.task_id.clone();
        if self.dispatch.complete(result) {
            Ack::new(true, "Result recorded")
        } else {
            Ack::new(false, format!("No task waiting for result: {task_id}"))
        }
    }

    // --- Tasks ---

    /// Queue one task.
    pub async fn submit_task(&self, task: Task) -> TaskmeshResult<SubmitTaskResponse> {
        let task_id = self.master.submit_task(task).await?;
        Ok(SubmitTaskResponse {
            success: true,
            message: format!("Task {task_id} submitted"),
            task_id,
        })
    }

    /// Queue several tasks at once.
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> TaskmeshResult<SubmitBatchResponse> {
        let task_ids = self.master.submit_tasks(tasks).await?;
        Ok(SubmitBatchResponse {
            success: true,
            count: task_ids.len(),
            task_ids,
        })
    }

    /// Cancel a pending or running task.
    pub async fn cancel_task(&self, task_id: &str) -> CancelTaskResponse {
        let success = self.master.cancel_task(task_id).await;
        CancelTaskResponse {
            success,
            task_id: task_id.to_string(),
            message: if success {
                "Task cancelled successfully".into()
            } else {
                "Task not found".into()
            },
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.detach_subscription);
    }
}

fn detach(master: &MasterAgent, dispatch: &RemoteDispatch, worker_id: &str) {
    let removed = master.unregister_worker(worker_id);
    let failed = dispatch.close_mailbox(worker_id);
    if removed || failed > 0 {
        info!(worker_id = %worker_id, failed, "Remote worker detached");
    }
}
