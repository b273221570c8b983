use crate::control::ControlPlane;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use taskmesh_bus::MessageBus;
use taskmesh_core::protocol::{topics, Ack, PollRequest, RegisterWorkerRequest, WorkerIdRequest};
use taskmesh_core::{SubscriptionId, Task, TaskProgress, TaskResult, TaskmeshError, TaskmeshResult};
use taskmesh_orchestrator::MasterEvent;
use taskmesh_registry::{RegistryEvent, REGISTRY_EVENTS};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exposes a [`ControlPlane`] on a coordinator bus.
///
/// Worker-facing operations become request topics (see
/// [`topics`](taskmesh_core::protocol::topics)); master and registry events
/// are republished as broadcasts. Dropping the bridge stops the forwarding.
pub struct BusBridge {
    plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
    forwarder: JoinHandle<()>,
    registry_subscriptions: Vec<SubscriptionId>,
}

impl BusBridge {
    /// Register the request handlers and start forwarding events. Fails if
    /// `bus` is not a coordinator.
    pub fn attach(bus: Arc<MessageBus>, plane: Arc<ControlPlane>) -> TaskmeshResult<Self> {
        route(&bus, topics::REGISTER, &plane, |plane, req: RegisterWorkerRequest| async move {
            plane.register_worker(req).await
        })?;
        route(&bus, topics::HEARTBEAT, &plane, |plane, req: WorkerIdRequest| async move {
            plane.heartbeat(&req.worker_id).await
        })?;
        route(&bus, topics::UNREGISTER, &plane, |plane, req: WorkerIdRequest| async move {
            Ok::<Ack, TaskmeshError>(plane.unregister_worker(&req.worker_id).await)
        })?;
        route(&bus, topics::POLL, &plane, |plane, req: PollRequest| async move {
            plane.poll(&req).await
        })?;
        route(&bus, topics::PROGRESS, &plane, |plane, progress: TaskProgress| async move {
            Ok::<Ack, TaskmeshError>(plane.report_progress(&progress))
        })?;
        route(&bus, topics::REPORT, &plane, |plane, result: TaskResult| async move {
            Ok::<Ack, TaskmeshError>(plane.report_result(result))
        })?;
        route(&bus, topics::SUBMIT, &plane, |plane, task: Task| async move {
            plane.submit_task(task).await
        })?;

        let mut registry_subscriptions = Vec::with_capacity(REGISTRY_EVENTS.len());
        for name in REGISTRY_EVENTS {
            let bus = bus.clone();
            let id = plane.registry().subscribe(name, move |event: &RegistryEvent| {
                let topic = match event {
                    RegistryEvent::Registered { .. } => topics::WORKER_REGISTERED,
                    RegistryEvent::Unregistered { .. } => topics::WORKER_UNREGISTERED,
                    RegistryEvent::Unhealthy { .. } => topics::WORKER_UNHEALTHY,
                };
                publish(&bus, topic, event);
            })?;
            registry_subscriptions.push(id);
        }

        let shutdown = CancellationToken::new();
        let forwarder = tokio::spawn(forward_master_events(
            bus.clone(),
            plane.master().subscribe_events(),
            shutdown.clone(),
        ));

        info!(topics = ?bus.handler_topics(), "Bus bridge attached");
        Ok(Self {
            plane,
            shutdown,
            forwarder,
            registry_subscriptions,
        })
    }
}

impl Drop for BusBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.forwarder.abort();
        for id in self.registry_subscriptions.drain(..) {
            self.plane.registry().unsubscribe(id);
        }
    }
}

/// Bind `topic` to a typed operation on the control plane.
fn route<Req, Resp, F, Fut>(
    bus: &MessageBus,
    topic: &'static str,
    plane: &Arc<ControlPlane>,
    op: F,
) -> TaskmeshResult<()>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<ControlPlane>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskmeshResult<Resp>> + Send + 'static,
{
    let plane = plane.clone();
    let op = Arc::new(op);
    bus.register_handler_fn(topic, move |payload: Value| {
        let plane = plane.clone();
        let op = op.clone();
        async move {
            let request: Req = serde_json::from_value(payload)
                .map_err(|e| TaskmeshError::InvalidInput(format!("{topic}: {e}")))?;
            let response = op(plane, request).await?;
            Ok(serde_json::to_value(response)?)
        }
    })
}

fn publish<T: Serialize>(bus: &MessageBus, topic: &str, body: &T) {
    let payload = match serde_json::to_value(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Event not serialisable");
            return;
        }
    };
    match bus.publish(topic, payload) {
        Ok(receivers) => debug!(topic = %topic, receivers, "Event published"),
        Err(e) => warn!(topic = %topic, error = %e, "Event publish failed"),
    }
}

async fn forward_master_events(
    bus: Arc<MessageBus>,
    mut events: broadcast::Receiver<MasterEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => publish(&bus, event.topic(), &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event forwarder fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use taskmesh_bus::BusConfig;
    use taskmesh_core::protocol::{PollResponse, SubmitTaskResponse};
    use taskmesh_orchestrator::{MasterAgent, MasterConfig};
    use taskmesh_registry::WorkerRegistry;

    async fn coordinator() -> Arc<MessageBus> {
        Arc::new(
            MessageBus::coordinator(BusConfig {
                pub_port: 0,
                rep_port: 0,
                ..BusConfig::default()
            })
            .await
            .unwrap(),
        )
    }

    async fn satellite_of(coord: &MessageBus) -> MessageBus {
        MessageBus::satellite(BusConfig {
            pub_port: coord.pub_addr().unwrap().port(),
            rep_port: coord.rep_addr().unwrap().port(),
            request_timeout: Duration::from_secs(2),
            ..BusConfig::default()
        })
        .await
        .unwrap()
    }

    fn plane() -> Arc<ControlPlane> {
        let master = Arc::new(MasterAgent::new(MasterConfig::default()).unwrap());
        Arc::new(ControlPlane::new(master, Arc::new(WorkerRegistry::default())).unwrap())
    }

    #[tokio::test]
    async fn test_satellite_registers_and_polls() {
        let coord = coordinator().await;
        let plane = plane();
        let _bridge = BusBridge::attach(coord.clone(), plane.clone()).unwrap();
        let sat = satellite_of(&coord).await;

        let resp = sat
            .request(
                topics::REGISTER,
                json!({"worker_id": "w1", "capabilities": ["*"]}),
            )
            .await
            .unwrap();
        assert_eq!(resp["success"], true);
        assert!(plane.master().pool().get_worker("w1").is_some());

        let resp = sat
            .request(topics::POLL, json!({"worker_id": "w1"}))
            .await
            .unwrap();
        let poll: PollResponse = serde_json::from_value(resp).unwrap();
        assert!(poll.tasks.is_empty());

        let err = sat
            .request(topics::HEARTBEAT, json!({"worker_id": "ghost"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Worker not found: ghost"));

        let err = sat
            .request(topics::POLL, json!({"nope": 1}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(topics::POLL));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let coord = coordinator().await;
        let plane = plane();
        let _bridge = BusBridge::attach(coord.clone(), plane.clone()).unwrap();
        let sat = satellite_of(&coord).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        sat.subscribe("", move |e| s.lock().push(e.topic.clone()))
            .unwrap();
        for _ in 0..200 {
            if coord.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let resp = sat
            .request(
                topics::SUBMIT,
                json!({"type": "shell", "payload": {"cmd": "ls"}}),
            )
            .await
            .unwrap();
        let submitted: SubmitTaskResponse = serde_json::from_value(resp).unwrap();
        assert!(submitted.success);
        sat.request(topics::REGISTER, json!({"worker_id": "w1"}))
            .await
            .unwrap();

        for _ in 0..200 {
            if seen.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let seen = seen.lock().clone();
        assert!(seen.contains(&"task_submitted".to_string()));
        assert!(seen.contains(&topics::WORKER_REGISTERED.to_string()));
    }

    #[tokio::test]
    async fn test_attach_requires_coordinator() {
        let coord = coordinator().await;
        let sat = Arc::new(satellite_of(&coord).await);
        assert!(BusBridge::attach(sat, plane()).is_err());
    }
}
