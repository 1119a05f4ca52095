//! fleetbeat dispatcher daemon
//!
//! Drains the message outbox into delivery transports, with work split among
//! peer dispatchers by heartbeat rank.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::{
    DispatchError, DispatchSettings, Dispatcher, TickReport, run, service_executable,
};
pub use transport::{ConfiguredTransport, LogTransport, SpoolTransport, Transport, TransportError};
