//! Stratum (Electrum-style) protocol layer: line-delimited JSON-RPC over
//! TCP or TLS, with a queue-bounded pull model for outbound requests.

pub mod connection;
pub mod messages;
pub mod task;
pub mod wire;


pub use connection::{ConnectOptions, Connection, ConnectionEvents, ServerConnection};
pub use task::{Task, TaskError, TaskOutcome};
