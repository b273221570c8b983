//! Task orchestration engine: priority queue, worker pool, load balancer and
//! the master dispatch loop.
//!
//! Tasks submitted to the [`MasterAgent`] wait in a [`PriorityTaskQueue`]
//! until their dependencies complete, are matched to a [`Worker`] by the
//! [`LoadBalancer`], and run as independent tokio tasks whose results are
//! reconciled on later loop iterations.
//!
//! # Main types
//!
//! - [`MasterAgent`]: Owns task lifecycle and result aggregation.
//! - [`PriorityTaskQueue`]: Priority-then-age ordered queue with dependency gating.
//! - [`Worker`] / [`WorkerPool`]: In-process execution slots.
//! - [`LoadBalancer`]: Strategy-based selection with a circuit breaker.
//! - [`TaskHandler`]: The boundary to the code that does the actual work.
//! - [`RemoteDispatch`]: Mailboxes that let pool workers forward to remote agents.

/// Load balancing strategies and the circuit breaker.
pub mod balancer;
/// Handler trait, registry and the single-attempt invoker.
pub mod handler;
/// The master dispatch loop.
pub mod master;
/// Progress fan-out.
pub mod progress;
/// Pool workers backed by remote agents.
pub mod remote;
/// Priority task queue.
pub mod task_queue;
/// In-process workers and the worker pool.
pub mod worker;

pub use balancer::{BalancerConfig, CircuitStatus, LoadBalancer, LoadBalancingStrategy};
pub use handler::{
    invoke, FnHandler, HandlerRegistry, ProgressReporter, ProgressSink, TaskContext, TaskHandler,
};
pub use master::{MasterAgent, MasterConfig, MasterEvent, MasterStatus, RunSummary};
pub use progress::ProgressHub;
pub use remote::{RemoteDispatch, RemoteExecutor};
pub use task_queue::{PriorityTaskQueue, QueueStats};
pub use worker::{PoolStats, Worker, WorkerKind, WorkerPool, WorkerSnapshot};
