//! CLI entry point and process wiring for the offload agent. Parses the
//! subcommand, layers configuration, joins the orchestrator, and drives
//! every periodic/inbound loop until SIGINT or SIGTERM.

mod iface;
mod udp;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oa_config::{Config, SendTo};
use oa_engine::{InboundDispatcher, NullSink, RequestInitiator, RetryPolicy};
use oa_executor::{Executor, SimulatedExecutor};
use oa_ledger::{Capacity, Mode, ResourceLedger};
use oa_node::{JoinOutcome, NodeAgent, NodeBuilder, SpecsSource, StaticSpecsSource};
use oa_orchclient::{OrchClient, StatusOutcome};
use oa_proto::{CoS, CoSRequirement, ConsumerRegistry, NodeType, ProviderRegistry, Topology};

use udp::{UdpTransport, DEFAULT_PROTOCOL_PORT};

/// `oa-agent switch --dpid <hex> --server IP:PORT [-v]`
/// `oa-agent client --server IP:PORT [--id S] [--label S] [-v]`
/// `oa-agent resource --server IP:PORT [--id S] [--label S] [--cpu N] [--ram MB] [--disk GB] [-v]`
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Join as an OVS-backed switch (no offload role).
    Switch {
        #[arg(long)]
        dpid: String,
        #[arg(long)]
        server: String,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Join as an offload consumer.
    Client {
        #[arg(long)]
        server: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Join as an offload resource provider.
    Resource {
        #[arg(long)]
        server: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        cpu: Option<u32>,
        #[arg(long)]
        ram: Option<f64>,
        #[arg(long)]
        disk: Option<f64>,
        #[arg(short, long)]
        verbose: bool,
    },
}

fn parse_server(s: &str) -> Result<(IpAddr, u16)> {
    let addr: SocketAddr = s.parse().context("--server must be IP:PORT")?;
    Ok((addr.ip(), addr.port()))
}

fn default_cos_catalog() -> Arc<DashMap<u32, CoS>> {
    let catalog = Arc::new(DashMap::new());
    catalog.insert(
        1,
        CoS {
            id: 1,
            name: "best-effort".into(),
            requirement: CoSRequirement {
                max_response_time: None,
                min_bandwidth: None,
                max_delay: None,
                max_jitter: None,
                max_loss_rate: None,
                min_cpu: 1.0,
                min_ram: 128.0,
                min_disk: 1.0,
            },
        },
    );
    catalog
}

fn init_logging(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose || std::env::var("PROTOCOL_VERBOSE").map(|v| v == "TRUE").unwrap_or(false) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Logs at `error!`, attempts a best-effort `DELETE /node`, then exits
/// non-zero — the one path fatal misconfiguration and SIGINT/SIGTERM both
/// funnel through.
async fn fatal_exit(msg: impl std::fmt::Display, orch: Option<(Arc<OrchClient>, &str)>) -> ! {
    error!("{msg}");
    if let Some((orch, node_id)) = orch {
        let _ = orch.delete_node(node_id).await;
    }
    std::process::exit(1);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Switch { dpid, server, verbose } => run_switch(dpid, server, verbose).await,
        Commands::Client { server, id, label, verbose } => {
            run_offload(server, id, label, None, None, None, false, verbose).await
        }
        Commands::Resource { server, id, label, cpu, ram, disk, verbose } => {
            run_offload(server, id, label, cpu, ram, disk, true, verbose).await
        }
    }
}

/// Loads the layered configuration (defaults, then the orchestrator's
/// `/config`, then the process environment) once an `OrchClient` can be
/// addressed from the CLI's `--server`.
async fn load_config(orch: &OrchClient, server_ip: IpAddr, server_api_port: u16) -> Result<Config> {
    std::env::set_var("SERVER_IP", server_ip.to_string());
    std::env::set_var("SERVER_API_PORT", server_api_port.to_string());
    match orch.get_config().await {
        Ok(remote) => Config::apply_remote(&remote),
        Err(err) => warn!(%err, "could not fetch remote config, continuing with local environment"),
    }
    Ok(Config::from_env()?)
}

async fn run_switch(dpid: String, server: String, verbose: bool) -> Result<()> {
    init_logging(verbose);
    let (server_ip, server_api_port) = parse_server(&server)?;
    let orch = Arc::new(OrchClient::new(server_ip, server_api_port));

    let node = NodeBuilder::new()
        .dpid(dpid)
        .node_type(NodeType::Switch)
        .build()
        .unwrap_or_else(|err| {
            // No orchestrator to notify yet, so this path exits directly.
            error!(%err, "failed to build switch node descriptor");
            std::process::exit(1);
        });
    let node_id = node.id.clone();
    let agent = Arc::new(NodeAgent::new(node, orch.clone(), true));

    let cancel = CancellationToken::new();
    let join_cancel = cancel.clone();
    let join_agent = agent.clone();
    let join_node_id = node_id.clone();
    tokio::spawn(async move {
        if let JoinOutcome::AlreadyExists = join_agent.join_loop(join_cancel).await {
            fatal_exit(format!("node id {join_node_id} is already registered by another node"), None).await;
        }
    });

    let specs_cancel = cancel.clone();
    let specs_agent = agent.clone();
    let source: Arc<dyn SpecsSource> = Arc::new(StaticSpecsSource(Default::default()));
    tokio::spawn(async move {
        specs_agent.spec_reporter_loop(source, Duration::from_secs(1), specs_cancel).await
    });

    wait_for_shutdown(cancel).await;
    let _ = orch.delete_node(&node_id).await;
    info!("switch agent disconnected cleanly");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_offload(
    server: String,
    id: Option<String>,
    label: Option<String>,
    cpu: Option<u32>,
    ram: Option<f64>,
    disk: Option<f64>,
    is_resource: bool,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose);
    let (server_ip, server_api_port) = parse_server(&server)?;
    let orch = Arc::new(OrchClient::new(server_ip, server_api_port));
    let cfg = load_config(&orch, server_ip, server_api_port).await?;

    let mut builder = NodeBuilder::new()
        .node_type(NodeType::Server)
        .threshold(oa_ledger::threshold_from_limit_percent(cfg.resource_limit_percent));
    if let Some(id) = id {
        builder = builder.id(id);
    }
    if let Some(label) = label {
        builder = builder.label(label);
    }
    let node = match builder.build() {
        Ok(node) => node,
        Err(err) => fatal_exit(format!("failed to build node descriptor: {err}"), None).await,
    };
    let node_id = node.id.clone();
    let local_ip = node
        .interfaces
        .values()
        .find_map(|i| i.ipv4)
        .map(IpAddr::V4)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let agent = Arc::new(NodeAgent::new(node, orch.clone(), false));
    let cancel = CancellationToken::new();

    let join_cancel = cancel.clone();
    let join_agent = agent.clone();
    let join_node_id = node_id.clone();
    tokio::spawn(async move {
        if let JoinOutcome::AlreadyExists = join_agent.join_loop(join_cancel).await {
            fatal_exit(format!("node id {join_node_id} is already registered by another node"), None).await;
        }
    });

    let udp_cancel = cancel.clone();
    let udp_agent = agent.clone();
    let orch_udp_port = cfg.orchestrator_udp_port;
    let orch_udp_timeout = cfg.orchestrator_udp_timeout;
    let server_ipv4 = match server_ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => {
            fatal_exit("SERVER_IP must be IPv4 for the UDP keepalive", Some((orch.clone(), node_id.as_str()))).await
        }
    };
    tokio::spawn(async move {
        if let Err(err) = udp_agent
            .udp_keepalive_loop(server_ipv4, orch_udp_port, orch_udp_timeout, udp_cancel)
            .await
        {
            warn!(%err, "udp keepalive loop exited with an error");
        }
    });

    let capacity = Capacity {
        cpu: cpu.or(cfg.host_cpu).unwrap_or(0) as f64,
        ram: ram.or(cfg.host_ram).unwrap_or(0.0),
        disk: disk.or(cfg.host_disk).unwrap_or(0.0),
    };
    let ledger_mode = if cfg.simulator_active { Mode::Simulated } else { Mode::Measured };
    let ledger = Arc::new(ResourceLedger::new(capacity, cfg.resource_limit_percent, ledger_mode));

    let specs_cancel = cancel.clone();
    let specs_agent = agent.clone();
    let specs_ledger = ledger.clone();
    let monitor_period = cfg.monitor_period;
    let source: Arc<dyn SpecsSource> = Arc::new(LedgerSpecsSource { ledger: specs_ledger, cpu: capacity.cpu });
    tokio::spawn(async move { specs_agent.spec_reporter_loop(source, monitor_period, specs_cancel).await });

    let topology = match cfg.protocol_send_to {
        SendTo::Broadcast => Topology::Broadcast,
        SendTo::Orchestrator => Topology::Orchestrator,
        SendTo::None => {
            warn!("PROTOCOL_SEND_TO=NONE, offload protocol disabled for this node");
            wait_for_shutdown(cancel).await;
            let _ = orch.delete_node(&node_id).await;
            return Ok(());
        }
    };

    let broadcast_addr = if topology == Topology::Broadcast {
        iface::select_interface(cfg.network_address.as_deref())
            .map(|(_, bcast)| IpAddr::V4(bcast))
            .unwrap_or_else(iface::fallback_broadcast)
    } else {
        iface::fallback_broadcast()
    };

    let socket = Arc::new(
        UdpSocket::bind(format!("0.0.0.0:{DEFAULT_PROTOCOL_PORT}"))
            .await
            .context("failed to bind the offload protocol UDP socket")?,
    );
    socket.set_broadcast(true).ok();

    let consumer = Arc::new(ConsumerRegistry::new());
    let provider = Arc::new(ProviderRegistry::new());
    let retry = RetryPolicy::new(cfg.protocol_timeout, cfg.protocol_retries);
    let executor: Arc<dyn Executor> =
        Arc::new(SimulatedExecutor::new(cfg.simulator_exec_min, cfg.simulator_exec_max));
    let transport = Arc::new(UdpTransport::new(socket.clone(), DEFAULT_PROTOCOL_PORT, topology));

    let dispatcher = InboundDispatcher::new(
        topology,
        is_resource,
        local_ip,
        None,
        cfg.controller_decoy_ip,
        default_cos_catalog(),
        ledger.clone(),
        executor,
        consumer.clone(),
        provider,
        transport.clone(),
        retry,
        Arc::new(NullSink),
    );

    let inbound_cancel = cancel.clone();
    let inbound_socket = socket.clone();
    let inbound_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = udp::inbound_loop(inbound_socket, topology, local_ip, inbound_dispatcher) => {}
            _ = inbound_cancel.cancelled() => {}
        }
    });

    // The request initiator is built and ready for whoever in this process
    // originates offload requests; submission itself rides an external
    // front-end out of this agent's scope.
    let _initiator = RequestInitiator::new(
        topology,
        None,
        broadcast_addr,
        cfg.controller_decoy_mac.clone(),
        cfg.controller_decoy_ip,
        consumer,
        transport,
        retry,
        Arc::new(NullSink),
    );

    wait_for_shutdown(cancel).await;

    match orch.delete_node(&node_id).await {
        Ok(StatusOutcome::Performed) | Ok(StatusOutcome::AlreadyExists) => {
            info!(node_id = %node_id, "disconnected cleanly");
        }
        Err(err) => warn!(%err, "disconnect call failed, exiting anyway"),
    }
    Ok(())
}

/// Supplies spec-reporter snapshots from the resource ledger's live
/// headroom instead of raw OS counters.
struct LedgerSpecsSource {
    ledger: Arc<ResourceLedger>,
    cpu: f64,
}

impl SpecsSource for LedgerSpecsSource {
    fn snapshot(&self) -> oa_proto::NodeSpecs {
        let free = self.ledger.snapshot(None);
        let totals = self.ledger.totals();
        oa_proto::NodeSpecs {
            cpu_count: self.cpu as u32,
            cpu_free: free.cpu,
            memory_total: totals.ram,
            memory_free: free.ram,
            disk_total: totals.disk,
            disk_free: free.disk,
            timestamp: None,
        }
    }
}

/// Blocks until SIGINT or SIGTERM, then cancels every task sharing `cancel`.
async fn wait_for_shutdown(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down gracefully");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM, shutting down gracefully");
        }
    }
    cancel.cancel();
}
