//! Protocol Responder and Request Initiator, plus the seams they're built
//! on: a packet [`transport`], a [`retry`] policy, and a [`persist`] sink
//! for terminal `Request` snapshots.

pub mod initiator;
pub mod persist;
pub mod responder;
pub mod retry;
pub mod transport;

pub use initiator::RequestInitiator;
pub use persist::{ChannelSink, NullSink, PersistSink};
pub use responder::InboundDispatcher;
pub use retry::RetryPolicy;
pub use transport::{ChannelTransport, Transport, TransportError};
