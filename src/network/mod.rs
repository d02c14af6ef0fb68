//! Network subsystem: the persistent channel to the agent

pub mod transport;
pub mod websocket;

pub use transport::{MockPeer, MockTransport, Transport, TransportEvent, TransportSession};
pub use websocket::WebSocketTransport;
