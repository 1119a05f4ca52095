//! Core coordination primitives for fleetbeat
//!
//! This crate provides the two subsystems that let a fleet of independent
//! daemon processes cooperate through nothing but a shared relational store:
//!
//! - [`heartbeat`]: liveness rows per (executable, host, pid, thread) and the
//!   rank/population snapshot used to split work without a coordinator
//! - [`outbox`]: a durable message outbox with service routing, overflow
//!   payloads, claim-based fail-fast dequeue and archive-on-consume
//!
//! Neither subsystem keeps state in process memory between calls. Every
//! operation opens its own transaction against the [`store::Store`] handle.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod home;
pub mod logging;
pub mod outbox;
pub mod partition;
pub mod process;
pub mod store;

pub use error::{CoordError, Result};
pub use heartbeat::{Actor, Assignment, ExecutableId, HeartbeatRegistry, ThreadIdentity, calc_hash};
pub use outbox::{DeliveryService, Message, MessageOutbox, NewMessage, RetrieveOptions};
pub use partition::Partition;
pub use store::Store;

// Re-export toml for callers that extend the config file
pub use toml;
