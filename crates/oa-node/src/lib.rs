//! Node identity, interface enumeration and the three periodic node tasks:
//! join, UDP keepalive, and spec reporting, each tracked against a
//! five-state connection machine (`Disconnected`/`Configuring`/`Joining`/
//! `Connected`/`Disconnecting`).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use oa_clock::now;
use oa_orchclient::{OrchClient, OrchError, StatusOutcome};
use oa_proto::{Interface, Node, NodeSpecs, NodeType};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no MAC address found to derive a node id from")]
    NoInterface,
    #[error("--dpid must be hexadecimal, got {0:?}")]
    InvalidDpid(String),
}

/// Node connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Configuring,
    Joining,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Configuring => 1,
            ConnectionState::Joining => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Disconnecting => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Configuring,
            2 => ConnectionState::Joining,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Tracks connection health the way `GardenHealth` tracks a ZMQ peer's:
/// an atomic state plus a consecutive-failure counter that, past a
/// threshold, forces a state reversal.
pub struct NodeHealth {
    state: AtomicU8,
}

impl NodeHealth {
    pub fn new() -> Self {
        Self { state: AtomicU8::new(ConnectionState::Disconnected.to_u8()) }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.to_u8(), Ordering::Relaxed);
    }

    /// Sustained spec-reporter failure reverses `Connected` back to
    /// `Joining` so `join_loop` resumes trying.
    pub fn demote_to_joining_if_connected(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connected.to_u8(),
            ConnectionState::Joining.to_u8(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Supplies the volatile half of a spec-reporter snapshot. The constant
/// half (`cpu_count`/`memory_total`/`disk_total`) is fixed at build time;
/// the rest is read from whatever tracks free capacity (the resource
/// ledger, in `oa-agent`'s wiring) — `oa-node` stays free of any direct
/// dependency on resource accounting, matching exclusion of
/// real OS-level monitoring from this system's scope.
pub trait SpecsSource: Send + Sync {
    fn snapshot(&self) -> NodeSpecs;
}

/// Always reports the constant specs baked into the `Node` at build time,
/// with zero volatility. Used by switch-mode agents, which do not offload.
pub struct StaticSpecsSource(pub NodeSpecs);

impl SpecsSource for StaticSpecsSource {
    fn snapshot(&self) -> NodeSpecs {
        self.0
    }
}

/// Assembles a [`Node`] the way `manager.py::_build` does: id defaults to
/// the first non-loopback interface's MAC, label to the hostname, and a
/// switch's id is the caller-supplied hex DPID instead.
#[derive(Default)]
pub struct NodeBuilder {
    id: Option<String>,
    label: Option<String>,
    node_type: Option<NodeType>,
    threshold: f64,
    dpid: Option<String>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn dpid(mut self, dpid: impl Into<String>) -> Self {
        self.dpid = Some(dpid.into());
        self
    }

    pub fn build(self) -> Result<Node, NodeError> {
        let interfaces = enumerate_interfaces();

        let id = if let Some(dpid) = self.dpid {
            if dpid.is_empty() || !dpid.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(NodeError::InvalidDpid(dpid));
            }
            dpid
        } else if let Some(id) = self.id {
            id
        } else {
            machine_mac().ok_or(NodeError::NoInterface)?
        };

        let label = self.label.unwrap_or_else(|| {
            hostname().unwrap_or_else(|| id.clone())
        });

        let node_type = self.node_type.unwrap_or(NodeType::Server);
        let mut node = Node::new(id, label, node_type, self.threshold);
        node.interfaces = interfaces;
        Ok(node)
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        let output = std::process::Command::new("hostname").output().ok()?;
        String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
    })
}

/// The machine's MAC address, used as the default node id when neither
/// `--dpid` nor `--id` is given.
fn machine_mac() -> Option<String> {
    mac_address::get_mac_address().ok().flatten().map(|m| m.to_string())
}

/// Enumerates local interfaces, skipping loopback.
fn enumerate_interfaces() -> std::collections::HashMap<String, Interface> {
    let mut out = std::collections::HashMap::new();
    let Ok(addrs) = if_addrs::get_if_addrs() else {
        return out;
    };
    for addr in addrs {
        if addr.is_loopback() {
            continue;
        }
        let entry = out.entry(addr.name.clone()).or_insert_with(|| Interface::new(addr.name.clone()));
        if entry.mac.is_none() {
            entry.mac = mac_address::mac_address_by_name(&addr.name)
                .ok()
                .flatten()
                .map(|m| m.to_string());
        }
        if let std::net::IpAddr::V4(v4) = addr.ip() {
            entry.ipv4 = Some(v4);
        }
    }
    out
}

/// How `join_loop` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The orchestrator accepted this node under a fresh id.
    Joined,
    /// The orchestrator already has a different node registered under this
    /// id. This is fatal: the caller must not keep running as this node.
    AlreadyExists,
    /// `cancel` fired before either of the above happened.
    Cancelled,
}

/// The node-side agent loop bundle: join, UDP keepalive and spec-reporter
/// tasks, each cancellable via a shared [`CancellationToken`].
pub struct NodeAgent {
    pub node: Node,
    pub orch: Arc<OrchClient>,
    pub health: Arc<NodeHealth>,
    pub is_switch: bool,
}

impl NodeAgent {
    pub fn new(node: Node, orch: Arc<OrchClient>, is_switch: bool) -> Self {
        Self { node, orch, health: Arc::new(NodeHealth::new()), is_switch }
    }

    /// Unbounded retry of `add_node` at 1s spacing. Returns
    /// [`JoinOutcome::Joined`] once the orchestrator accepts this node under
    /// a fresh id, or [`JoinOutcome::AlreadyExists`] if the id is already
    /// owned by a different node — the latter is a fatal condition the
    /// caller must act on, not a successful join. Logs the first occurrence
    /// of each distinct error at `error!` level and every subsequent
    /// recurrence at `debug!`, matching `manager.py`'s `_code` dedup
    /// variable.
    pub async fn join_loop(&self, cancel: CancellationToken) -> JoinOutcome {
        self.health.set_state(ConnectionState::Joining);
        let mut last_logged: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return JoinOutcome::Cancelled;
            }
            match self.orch.add_node(&self.node).await {
                Ok(StatusOutcome::Performed) => {
                    info!(node_id = %self.node.id, "joined orchestrator");
                    self.health.set_state(ConnectionState::Connected);
                    return JoinOutcome::Joined;
                }
                Ok(StatusOutcome::AlreadyExists) => {
                    error!(node_id = %self.node.id, "node id already registered by another node");
                    return JoinOutcome::AlreadyExists;
                }
                Err(err) => {
                    let key = err.to_string();
                    if last_logged.as_deref() != Some(key.as_str()) {
                        error!(node_id = %self.node.id, %err, "failed to join orchestrator");
                        last_logged = Some(key);
                    } else {
                        debug!(node_id = %self.node.id, %err, "still failing to join orchestrator");
                    }
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = cancel.cancelled() => return JoinOutcome::Cancelled,
            }
        }
    }

    /// Sends a UDP datagram containing the node id every `udp_timeout / 2`.
    pub async fn udp_keepalive_loop(
        &self,
        server_ip: Ipv4Addr,
        udp_port: u16,
        udp_timeout: Duration,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let target = (server_ip, udp_port);
        let interval = udp_timeout / 2;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(err) = socket.send_to(self.node.id.as_bytes(), target).await {
                        debug!(%err, "udp keepalive send failed");
                    }
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// Every `monitor_period`, snapshots specs via `source` and reports
    /// them; on failure (non-switch nodes only) re-issues `add_node` and
    /// reverses `Connected` back to `Joining`.
    pub async fn spec_reporter_loop(
        &self,
        source: Arc<dyn SpecsSource>,
        monitor_period: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(monitor_period) => {}
                _ = cancel.cancelled() => return,
            }
            let mut specs = source.snapshot();
            specs.timestamp = Some(now());
            let mut node = self.node.clone();
            node.specs = specs;

            match self.orch.update_node_specs(&node).await {
                Ok(_) => {}
                Err(OrchError::UnexpectedStatus { status, .. }) if !self.is_switch => {
                    warn!(status, node_id = %self.node.id, "spec report rejected, re-joining");
                    self.health.demote_to_joining_if_connected();
                    let _ = self.orch.add_node(&node).await;
                }
                Err(err) => {
                    debug!(%err, node_id = %self.node.id, "spec report failed");
                    if !self.is_switch {
                        self.health.demote_to_joining_if_connected();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_transitions_connected_to_joining_on_demote() {
        let health = NodeHealth::new();
        health.set_state(ConnectionState::Connected);
        health.demote_to_joining_if_connected();
        assert_eq!(health.state(), ConnectionState::Joining);
    }

    #[test]
    fn demote_is_noop_when_not_connected() {
        let health = NodeHealth::new();
        health.set_state(ConnectionState::Disconnected);
        health.demote_to_joining_if_connected();
        assert_eq!(health.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn builder_rejects_non_hex_dpid() {
        let result = NodeBuilder::new().dpid("not-hex!").build();
        assert!(matches!(result, Err(NodeError::InvalidDpid(_))));
    }

    #[test]
    fn builder_accepts_hex_dpid_as_id() {
        let node = NodeBuilder::new().dpid("1a2b3c").node_type(NodeType::Switch).build().unwrap();
        assert_eq!(node.id, "1a2b3c");
        assert_eq!(node.node_type, NodeType::Switch);
    }

    #[tokio::test]
    async fn join_loop_reports_already_exists_without_connecting() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/node"))
            .respond_with(ResponseTemplate::new(303))
            .mount(&server)
            .await;
        let addr = server.address();
        let orch = Arc::new(OrchClient::new(addr.ip(), addr.port()));
        let node = Node::new("aa:bb:cc:dd:ee:ff", "host1", NodeType::Server, 0.1);
        let agent = NodeAgent::new(node, orch, false);
        let cancel = CancellationToken::new();

        let outcome = tokio::time::timeout(Duration::from_secs(2), agent.join_loop(cancel))
            .await
            .expect("join_loop should terminate promptly on AlreadyExists");
        assert_eq!(outcome, JoinOutcome::AlreadyExists);
        assert_ne!(agent.health.state(), ConnectionState::Connected);
    }
}
