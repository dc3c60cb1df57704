//! UDP-backed [`Transport`] for the offload wire protocol.
//!
//! A UDP datagram per packet keeps the protocol's "no transport-level
//! reliability" property without binding the agent to raw sockets or a
//! particular L2 framing — the retry/timeout loop in `oa-engine` already
//! assumes the transport can silently drop a packet.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use oa_engine::{InboundDispatcher, Transport, TransportError};
use oa_proto::{accept_inbound, Packet, Topology};

/// The default port the offload wire protocol's own packets (HREQ..DWAIT)
/// are exchanged on, distinct from the orchestrator keepalive port
/// (`ORCHESTRATOR_UDP_PORT`) and from the orchestrator's REST API port.
pub const DEFAULT_PROTOCOL_PORT: u16 = 7071;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
    topology: Topology,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, port: u16, topology: Topology) -> Self {
        Self { socket, port, topology }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, dest: IpAddr, pkt: Packet) -> Result<(), TransportError> {
        let bytes = pkt.encode(self.topology).map_err(|e| TransportError::Send(e.to_string()))?;
        self.socket
            .send_to(&bytes, (dest, self.port))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }
}

/// Reads datagrams off `socket` forever, decodes them, and hands each
/// successfully decoded packet to `dispatcher`. Malformed datagrams are
/// logged and dropped — the protocol has no reliability guarantees to
/// begin with.
pub async fn inbound_loop(
    socket: Arc<UdpSocket>,
    topology: Topology,
    local_ip: IpAddr,
    dispatcher: Arc<InboundDispatcher>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "udp recv failed");
                continue;
            }
        };
        let bytes = bytes::Bytes::copy_from_slice(&buf[..len]);
        match Packet::decode(bytes, topology) {
            Ok(pkt) if accept_inbound(&pkt, src.ip(), local_ip) => {
                dispatcher.handle_packet(pkt, src.ip()).await;
            }
            Ok(_) => debug!(%src, "rejected inbound packet (self or unspecified source)"),
            Err(err) => debug!(%err, %src, "dropped malformed packet"),
        }
    }
}
