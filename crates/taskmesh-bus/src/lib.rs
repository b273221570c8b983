//! Message bus transport for Taskmesh.
//!
//! An alternative to HTTP polling for master/worker coordination. Every
//! message is an [`Envelope`] encoded as one line of JSON over TCP. A
//! coordinator binds two ports: one fans broadcasts out to every connected
//! satellite, the other answers satellite requests by topic. Replies carry
//! the request's id in `reply_to`, so one connection can have many requests
//! in flight.

/// Coordinator and satellite roles over TCP.
pub mod bus;
/// The wire envelope and topic matching.
pub mod envelope;

pub use bus::{BusConfig, BusRole, MessageBus, RequestHandler};
pub use envelope::{topic_matches, Envelope, MessageType};
