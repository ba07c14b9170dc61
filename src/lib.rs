//! galaxybus - process-local publish/subscribe bus with an optional bridge
//! to a remote STOMP message broker.
//!
//! - `bus`: channels, subscriptions and message envelopes
//! - `bridge`: broker connections and channel-to-destination mappings
//! - `services`: request dispatcher, scheduled producer and the service host

pub mod arguments;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod errors;
pub mod logger;
pub mod services;

pub use bridge::{BrokerConnection, ConnectionState, Connector, MemoryBroker};
pub use bus::{EventBus, Message, Payload, Request, Response, Subscription};
pub use errors::{BusError, BusResult};
