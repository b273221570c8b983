use crate::info::WorkerInfo;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskmesh_core::{
    capability_matches, HealthStatus, ObserverList, SubscriptionId, TaskmeshError, TaskmeshResult,
    WorkerStatus,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event names accepted by [`WorkerRegistry::subscribe`].
pub const REGISTRY_EVENTS: [&str; 3] = ["register", "unregister", "unhealthy"];

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Registry tuning. Durations serialise as fractional seconds.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryConfig {
    /// Heartbeat age after which a worker counts as unhealthy.
    #[serde(serialize_with = "as_secs")]
    pub heartbeat_timeout: Duration,
    /// Period of the background health pass.
    #[serde(serialize_with = "as_secs")]
    pub health_check_interval: Duration,
    /// Remove workers that stay unhealthy past `auto_remove_delay`.
    pub auto_remove_unhealthy: bool,
    /// Extra grace after `heartbeat_timeout` before auto-removal.
    #[serde(serialize_with = "as_secs")]
    pub auto_remove_delay: Duration,
    /// Registration ceiling; 0 means unlimited.
    pub max_workers: usize,
    /// Whether the discovery facade is exposed.
    pub enable_discovery: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            auto_remove_unhealthy: true,
            auto_remove_delay: Duration::from_secs(60),
            max_workers: 0,
            enable_discovery: true,
        }
    }
}

/// Lifecycle notification delivered to registry subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    Registered { worker: WorkerInfo },
    Unregistered { worker_id: String },
    Unhealthy { worker: WorkerInfo },
}

impl RegistryEvent {
    /// Subscription name this event is delivered under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "register",
            Self::Unregistered { .. } => "unregister",
            Self::Unhealthy { .. } => "unhealthy",
        }
    }

    /// Worker the event is about.
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Registered { worker } | Self::Unhealthy { worker } => &worker.worker_id,
            Self::Unregistered { worker_id } => worker_id,
        }
    }
}

/// Aggregate counters for `GET /registry/stats`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistryStatistics {
    /// Registered workers.
    pub total_workers: usize,
    /// Workers with a fresh heartbeat.
    pub healthy_workers: usize,
    /// Workers past the heartbeat timeout.
    pub unhealthy_workers: usize,
    /// Workers with spare capacity.
    pub idle_workers: usize,
    /// `None` when unlimited.
    pub max_workers: Option<usize>,
    /// Heartbeat timeout in seconds.
    pub heartbeat_timeout: f64,
    /// Health loop period in seconds.
    pub health_check_interval: f64,
    /// Whether the health loop is active.
    pub health_loop_running: bool,
}

/// What one health pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckReport {
    /// Workers that turned unhealthy during this pass.
    pub newly_unhealthy: Vec<String>,
    /// Workers removed because they stayed unhealthy too long.
    pub removed: Vec<String>,
}

struct HealthLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Bookkeeping for workers living in other processes.
///
/// Records are keyed by worker id and only mutated under the registry's write
/// lock. Event callbacks run after the lock is released.
pub struct WorkerRegistry {
    config: RegistryConfig,
    workers: RwLock<HashMap<String, WorkerInfo>>,
    observers: ObserverList<RegistryEvent>,
    health_loop: Mutex<Option<HealthLoop>>,
}

impl WorkerRegistry {
    /// An empty registry. Call `start` to run the health loop.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
            observers: ObserverList::new("registry"),
            health_loop: Mutex::new(None),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // --- Health loop ---

    /// Start the background health pass. Returns false (and warns) if it is
    /// already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut slot = self.health_loop.lock();
        if slot.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            warn!("Worker registry health loop already running");
            return false;
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let registry = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.run_health_check().await;
                    }
                }
            }
        });
        *slot = Some(HealthLoop { shutdown, handle });
        info!(interval_ms = interval.as_millis() as u64, "Worker registry started");
        true
    }

    /// Stop the health pass and wait for it to exit. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(health_loop) = self.health_loop.lock().take() else {
            return false;
        };
        health_loop.shutdown.cancel();
        let _ = health_loop.handle.await;
        info!("Worker registry stopped");
        true
    }

    /// Whether the health loop is active.
    pub fn is_running(&self) -> bool {
        self.health_loop
            .lock()
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }

    // --- Registration ---

    /// Register a worker, or overwrite an existing record with the same id.
    ///
    /// Only first-time registrations fire `register` and count against
    /// `max_workers`.
    pub async fn register_worker(&self, mut info: WorkerInfo) -> TaskmeshResult<WorkerInfo> {
        if info.worker_id.is_empty() {
            return Err(TaskmeshError::InvalidInput(
                "worker_id cannot be empty".into(),
            ));
        }

        let is_update = {
            let mut workers = self.workers.write().await;
            let is_update = workers.contains_key(&info.worker_id);
            let max = self.config.max_workers;
            if !is_update && max > 0 && workers.len() >= max {
                return Err(TaskmeshError::Capacity(format!(
                    "Maximum worker limit ({max}) reached"
                )));
            }
            let now = Utc::now();
            info.registered_at = now;
            info.last_heartbeat = now;
            info.status = WorkerStatus::Idle;
            info.health_status = HealthStatus::Unknown;
            info.active_tasks = 0;
            workers.insert(info.worker_id.clone(), info.clone());
            is_update
        };

        if is_update {
            info!(worker_id = %info.worker_id, "Worker re-registered");
        } else {
            info!(
                worker_id = %info.worker_id,
                capabilities = ?info.capabilities,
                address = %info.address,
                "Worker registered"
            );
            self.observers.notify(&RegistryEvent::Registered {
                worker: info.clone(),
            });
        }
        Ok(info)
    }

    /// Remove a worker. Unknown ids are a no-op returning false.
    pub async fn unregister_worker(&self, worker_id: &str) -> bool {
        let removed = self.workers.write().await.remove(worker_id).is_some();
        if removed {
            info!(worker_id = %worker_id, "Worker unregistered");
            self.observers.notify(&RegistryEvent::Unregistered {
                worker_id: worker_id.to_string(),
            });
        } else {
            warn!(worker_id = %worker_id, "Unregister for unknown worker");
        }
        removed
    }

    /// Record a heartbeat. Returns the refreshed record, or `None` if unknown.
    pub async fn update_heartbeat(&self, worker_id: &str) -> Option<WorkerInfo> {
        let mut workers = self.workers.write().await;
        match workers.get_mut(worker_id) {
            Some(info) => {
                info.update_heartbeat();
                debug!(worker_id = %worker_id, "Heartbeat");
                Some(info.clone())
            }
            None => {
                warn!(worker_id = %worker_id, "Heartbeat from unknown worker");
                None
            }
        }
    }

    /// Record how many tasks a worker is running; status follows the load
    /// unless the worker is offline.
    pub async fn update_load(&self, worker_id: &str, active_tasks: usize) -> bool {
        let mut workers = self.workers.write().await;
        let Some(info) = workers.get_mut(worker_id) else {
            return false;
        };
        info.active_tasks = active_tasks;
        if info.status != WorkerStatus::Offline {
            info.status = if active_tasks >= info.max_concurrent_tasks {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Idle
            };
        }
        true
    }

    // --- Queries ---

    /// Copy of one worker's record.
    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// Every record, oldest registration first.
    pub async fn all_workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.read().await;
        sorted(workers.values().cloned().collect())
    }

    /// Number of registered workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Workers whose heartbeat is within `heartbeat_timeout`.
    pub async fn get_healthy_workers(&self) -> Vec<WorkerInfo> {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout;
        let workers = self.workers.read().await;
        sorted(
            workers
                .values()
                .filter(|w| w.is_healthy_at(timeout, now))
                .cloned()
                .collect(),
        )
    }

    /// Workers able to run `capability`, optionally restricted to healthy ones.
    pub async fn discover_workers(&self, capability: &str, healthy_only: bool) -> Vec<WorkerInfo> {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout;
        let workers = self.workers.read().await;
        sorted(
            workers
                .values()
                .filter(|w| !healthy_only || w.is_healthy_at(timeout, now))
                .filter(|w| capability_matches(&w.capabilities, capability))
                .cloned()
                .collect(),
        )
    }

    /// Counts by health and load.
    pub async fn statistics(&self) -> RegistryStatistics {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout;
        let workers = self.workers.read().await;
        let total = workers.len();
        let healthy = workers
            .values()
            .filter(|w| w.is_healthy_at(timeout, now))
            .count();
        let idle = workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count();
        RegistryStatistics {
            total_workers: total,
            healthy_workers: healthy,
            unhealthy_workers: total - healthy,
            idle_workers: idle,
            max_workers: (self.config.max_workers > 0).then_some(self.config.max_workers),
            heartbeat_timeout: timeout.as_secs_f64(),
            health_check_interval: self.config.health_check_interval.as_secs_f64(),
            health_loop_running: self.is_running(),
        }
    }

    // --- Events ---

    /// Subscribe to one of [`REGISTRY_EVENTS`]. Any other name is rejected.
    pub fn subscribe<F>(&self, event: &str, callback: F) -> TaskmeshResult<SubscriptionId>
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let Some(&name) = REGISTRY_EVENTS.iter().find(|e| **e == event) else {
            return Err(TaskmeshError::InvalidInput(format!(
                "Unknown event type: {event}"
            )));
        };
        Ok(self.observers.subscribe(move |e: &RegistryEvent| {
            if e.name() == name {
                callback(e);
            }
        }))
    }

    /// Drop an event subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    // --- Health ---

    /// One health pass at the current time.
    pub async fn run_health_check(&self) -> HealthCheckReport {
        self.run_health_check_at(Utc::now()).await
    }

    /// One health pass as if the clock read `now`.
    ///
    /// `unhealthy` fires once per healthy-to-unhealthy transition, not once
    /// per pass.
    pub async fn run_health_check_at(&self, now: DateTime<Utc>) -> HealthCheckReport {
        let timeout = self.config.heartbeat_timeout;
        let removal_age = timeout + self.config.auto_remove_delay;
        let mut report = HealthCheckReport::default();
        let mut unhealthy_events = Vec::new();

        {
            let mut workers = self.workers.write().await;
            for info in workers.values_mut() {
                if info.is_healthy_at(timeout, now) {
                    continue;
                }
                if info.health_status != HealthStatus::Unhealthy {
                    info.health_status = HealthStatus::Unhealthy;
                    info.status = WorkerStatus::Offline;
                    warn!(
                        worker_id = %info.worker_id,
                        heartbeat_age_ms = info.heartbeat_age_at(now).as_millis() as u64,
                        "Worker unhealthy"
                    );
                    report.newly_unhealthy.push(info.worker_id.clone());
                    unhealthy_events.push(RegistryEvent::Unhealthy {
                        worker: info.clone(),
                    });
                }
                if self.config.auto_remove_unhealthy && info.heartbeat_age_at(now) > removal_age {
                    report.removed.push(info.worker_id.clone());
                }
            }
            for id in &report.removed {
                workers.remove(id);
            }
        }

        for event in &unhealthy_events {
            self.observers.notify(event);
        }
        for id in &report.removed {
            info!(worker_id = %id, reason = "unhealthy", "Worker auto-removed");
            self.observers.notify(&RegistryEvent::Unregistered {
                worker_id: id.clone(),
            });
        }
        report
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        if let Some(health_loop) = self.health_loop.get_mut().take() {
            health_loop.shutdown.cancel();
        }
    }
}

fn sorted(mut workers: Vec<WorkerInfo>) -> Vec<WorkerInfo> {
    workers.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });
    workers
}
