//! Resilient consumer-group reader for the mesh trace stream.
//!
//! The consumer tolerates an absent or flapping event bus: construction never
//! fails on bus unavailability, a background connection manager reconnects
//! with exponential backoff, and the registry keeps serving requests without
//! tracing while the bus is down.

pub mod config;
pub mod connection;
pub mod consumer;

pub use config::ConsumerConfig;
pub use connection::{backoff_delay, ConnectionInfo, ConnectionState};
pub use consumer::{ConsumerError, ConsumerInfo, StreamConsumer};
