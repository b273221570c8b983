//! Remote control surface of the Taskmesh master.
//!
//! [`ControlPlane`] ties the master's pool to the worker registry and to the
//! mailboxes remote agents poll. It is exposed two ways: an axum router under
//! `/api/orchestration` built by [`GatewayServer`], and request topics on the
//! message bus attached with [`BusBridge`].

/// Bus request handlers and event forwarding.
pub mod bus_bridge;
/// Shared operations behind both transports.
pub mod control;
/// Error to HTTP response mapping.
pub mod error;
/// API key authentication.
pub mod middleware;
/// Route handlers.
pub mod routes;
/// Router assembly.
pub mod server;

pub use bus_bridge::BusBridge;
pub use control::ControlPlane;
pub use error::{ApiError, ApiResult};
pub use middleware::AuthConfig;
pub use server::GatewayServer;
