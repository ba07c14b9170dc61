/// Broker bridge - mirrors local channels onto remote broker destinations
///
/// - `transport`: the collaborator contract a wire protocol implements
/// - `connection`: broker connections, galactic mappings, reader/forwarder tasks
/// - `memory`: in-memory broker for tests and loopback runs
/// - `stomp`: STOMP 1.2 over WebSocket (feature `stomp`)
pub mod connection;
pub mod memory;
#[cfg(feature = "stomp")]
pub mod stomp;
pub mod transport;

pub use connection::{BrokerConnection, ConnectionId, ConnectionState, Mapping};
pub use memory::MemoryBroker;
#[cfg(feature = "stomp")]
pub use stomp::StompConnector;
pub use transport::{Connector, Frame, InboundSink, Transport};
