//! Registry of remote workers for the Taskmesh orchestrator.
//!
//! Workers running in other processes announce themselves here and keep
//! their record alive with heartbeats. A background health pass marks silent
//! workers unhealthy and optionally removes them, notifying subscribers of
//! every lifecycle transition.
//!
//! # Main types
//!
//! - [`WorkerRegistry`]: Owns the worker records and the health loop.
//! - [`WorkerInfo`]: A remote worker's registration record.
//! - [`ServiceDiscovery`]: Capability lookups over healthy workers.

/// Capability lookups over the registry.
pub mod discovery;
/// Remote worker records.
pub mod info;
/// The registry, its configuration and lifecycle events.
pub mod registry;

pub use discovery::{DiscoveryStrategy, ServiceDiscovery};
pub use info::WorkerInfo;
pub use registry::{
    HealthCheckReport, RegistryConfig, RegistryEvent, RegistryStatistics, WorkerRegistry,
    REGISTRY_EVENTS,
};
