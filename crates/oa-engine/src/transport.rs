//! Packet transport seam: `oa-engine` never opens a socket itself; it sends
//! through whatever implements [`Transport`] and is fed inbound packets by
//! whoever owns the real socket (`oa-agent`, or an in-memory channel in
//! tests), forwarding parsed frames to a channel-driven consumer rather
//! than running a single monolithic loop.

use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use oa_proto::Packet;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport send failed: {0}")]
    Send(String),
}

/// One outbound leg of the wire: encode is the caller's job (the `Topology`
/// the sender is using), `Transport` only moves already-built packets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, dest: IpAddr, pkt: Packet) -> Result<(), TransportError>;
}

/// A transport over an in-process `tokio::sync::mpsc` channel — the
/// counterpart end feeds a peer's inbound queue directly, with no socket at
/// all. Used for unit/integration tests of the state machine.
pub struct ChannelTransport {
    local: IpAddr,
    tx: tokio::sync::mpsc::UnboundedSender<(IpAddr, IpAddr, Packet)>,
}

impl ChannelTransport {
    pub fn new(
        local: IpAddr,
        tx: tokio::sync::mpsc::UnboundedSender<(IpAddr, IpAddr, Packet)>,
    ) -> Self {
        Self { local, tx }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, dest: IpAddr, pkt: Packet) -> Result<(), TransportError> {
        self.tx
            .send((self.local, dest, pkt))
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
