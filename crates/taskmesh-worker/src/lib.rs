//! Remote worker agent for the Taskmesh orchestrator.
//!
//! A [`WorkerAgent`] runs in its own process: it registers with the master,
//! heartbeats, polls for work, runs tasks through a
//! [`HandlerRegistry`](taskmesh_orchestrator::HandlerRegistry) and reports
//! progress and results back. The master is reached through a
//! [`MasterClient`], over HTTP or the message bus.

/// The agent loop and its lifecycle.
pub mod agent;
/// Built-in handlers.
pub mod builtins;
/// Transports to the master.
pub mod client;
/// Agent settings.
pub mod config;

pub use agent::{AgentState, AgentStatus, WorkerAgent};
pub use builtins::{create_default_worker, default_handlers};
pub use client::{connect_client, BusMasterClient, HttpMasterClient, MasterClient};
pub use config::{Transport, WorkerAgentConfig};
