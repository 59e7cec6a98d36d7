//! Port definitions (hexagonal architecture)
//!
//! Ports define the interfaces to the outside world. Services depend only on
//! these traits; adapters provide the engine-specific implementations.

pub mod connection;
pub mod dialect;
pub mod events;

pub use connection::{Connection, ConnectionParams, Driver, DriverResult, Row};
pub use dialect::DialectRequests;
pub use events::{EventSink, MemorySink, NullSink};
