//! End-to-end scenarios for the offload protocol, run over
//! an in-memory packet bus instead of real sockets — each simulated node
//! owns an [`InboundDispatcher`] fed by a [`BusTransport`], the same shape
//! `oa-agent` will wire around a real socket.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use oa_engine::transport::{Transport, TransportError};
use oa_engine::{ChannelSink, InboundDispatcher, NullSink, RequestInitiator, RetryPolicy};
use oa_executor::{EchoExecutor, Executor};
use oa_ledger::{Capacity, Mode, ResourceLedger};
use oa_proto::{CoS, CoSRequirement, ConsumerRegistry, Packet, ProviderRegistry, ReqState, Topology};

const BROADCAST: &str = "255.255.255.255";

fn broadcast_addr() -> IpAddr {
    BROADCAST.parse().unwrap()
}

fn cos_with(min_cpu: f64, min_ram: f64, min_disk: f64) -> CoS {
    CoS {
        id: 1,
        name: "best-effort".into(),
        requirement: CoSRequirement {
            max_response_time: None,
            min_bandwidth: None,
            max_delay: None,
            max_jitter: None,
            max_loss_rate: None,
            min_cpu,
            min_ram,
            min_disk,
        },
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(80), 3)
}

struct Bus {
    inboxes: DashMap<IpAddr, mpsc::UnboundedSender<(IpAddr, Packet)>>,
}

impl Bus {
    fn new() -> Arc<Self> {
        Arc::new(Self { inboxes: DashMap::new() })
    }
}

struct BusTransport {
    local: IpAddr,
    bus: Arc<Bus>,
}

#[async_trait]
impl Transport for BusTransport {
    async fn send(&self, dest: IpAddr, pkt: Packet) -> Result<(), TransportError> {
        if dest == broadcast_addr() {
            for entry in self.bus.inboxes.iter() {
                if *entry.key() != self.local {
                    let _ = entry.value().send((self.local, pkt.clone()));
                }
            }
        } else if let Some(tx) = self.bus.inboxes.get(&dest) {
            let _ = tx.send((self.local, pkt));
        }
        Ok(())
    }
}

fn register(bus: &Arc<Bus>, ip: IpAddr) -> mpsc::UnboundedReceiver<(IpAddr, Packet)> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.inboxes.insert(ip, tx);
    rx
}

fn pump(dispatcher: Arc<InboundDispatcher>, mut rx: mpsc::UnboundedReceiver<(IpAddr, Packet)>) {
    tokio::spawn(async move {
        while let Some((src, pkt)) = rx.recv().await {
            dispatcher.handle_packet(pkt, src).await;
        }
    });
}

#[allow(clippy::too_many_arguments)]
fn provider_node(
    bus: &Arc<Bus>,
    ip: &str,
    topology: Topology,
    capacity: Capacity,
    orch_addr: Option<IpAddr>,
) -> Arc<InboundDispatcher> {
    let ip: IpAddr = ip.parse().unwrap();
    let rx = register(bus, ip);
    let ledger = Arc::new(ResourceLedger::new(capacity, 0.0, Mode::Simulated));
    let catalog = Arc::new(DashMap::new());
    catalog.insert(1, cos_with(1.0, 128.0, 1.0));
    let consumer = Arc::new(ConsumerRegistry::new());
    let provider = Arc::new(ProviderRegistry::new());
    let transport = Arc::new(BusTransport { local: ip, bus: bus.clone() });
    let dispatcher = InboundDispatcher::new(
        topology,
        true,
        ip,
        None,
        orch_addr,
        catalog,
        ledger,
        Arc::new(EchoExecutor) as Arc<dyn Executor>,
        consumer,
        provider,
        transport,
        fast_retry(),
        Arc::new(NullSink),
    );
    pump(dispatcher.clone(), rx);
    dispatcher
}

fn consumer_node(
    bus: &Arc<Bus>,
    ip: &str,
    topology: Topology,
    decoy_ip: Option<IpAddr>,
) -> (Arc<InboundDispatcher>, Arc<RequestInitiator>) {
    let ip: IpAddr = ip.parse().unwrap();
    let rx = register(bus, ip);
    let ledger = Arc::new(ResourceLedger::new(Capacity::ZERO, 0.0, Mode::Simulated));
    let catalog = Arc::new(DashMap::new());
    let consumer = Arc::new(ConsumerRegistry::new());
    let provider = Arc::new(ProviderRegistry::new());
    let transport = Arc::new(BusTransport { local: ip, bus: bus.clone() });
    let dispatcher = InboundDispatcher::new(
        topology,
        false,
        ip,
        None,
        decoy_ip,
        catalog,
        ledger,
        Arc::new(EchoExecutor) as Arc<dyn Executor>,
        consumer.clone(),
        provider,
        transport.clone(),
        fast_retry(),
        Arc::new(NullSink),
    );
    pump(dispatcher.clone(), rx);
    let initiator = RequestInitiator::new(
        topology,
        None,
        broadcast_addr(),
        None,
        decoy_ip,
        consumer,
        transport,
        fast_retry(),
        Arc::new(NullSink),
    );
    (dispatcher, initiator)
}

/// S1: two providers reply to a broadcast HREQ; the consumer reserves and
/// executes against the first responder; the ledger returns to zero once
/// `DACK` is processed.
#[tokio::test]
async fn happy_broadcast_with_two_providers() {
    let bus = Bus::new();
    let p1 = provider_node(&bus, "10.0.0.1", Topology::Broadcast, Capacity { cpu: 4.0, ram: 4096.0, disk: 40.0 }, None);
    let p2 = provider_node(&bus, "10.0.0.2", Topology::Broadcast, Capacity { cpu: 4.0, ram: 4096.0, disk: 40.0 }, None);
    let (_consumer_d, initiator) = consumer_node(&bus, "10.0.0.9", Topology::Broadcast, None);

    let req = initiator.send_request(cos_with(1.0, 128.0, 1.0), b"payload".to_vec()).await;

    assert_eq!(req.state, ReqState::Dres);
    assert_eq!(req.result.as_deref(), Some(&b"payload"[..]));
    assert!(req.host.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p1.ledger().reserved(), Capacity::ZERO);
    assert_eq!(p2.ledger().reserved(), Capacity::ZERO);
}

/// S2: no provider has enough capacity to ever reply HRES; the consumer
/// exhausts its retries and the request ends in FAIL with no reservation
/// ever created.
#[tokio::test]
async fn admission_failure_ends_in_fail() {
    let bus = Bus::new();
    let p1 = provider_node(&bus, "10.0.0.1", Topology::Broadcast, Capacity::ZERO, None);
    let (_consumer_d, initiator) = consumer_node(&bus, "10.0.0.9", Topology::Broadcast, None);

    let req = initiator.send_request(cos_with(1.0, 128.0, 1.0), b"payload".to_vec()).await;

    assert_eq!(req.state, ReqState::Fail);
    assert!(req.host.is_none());
    assert_eq!(p1.ledger().reserved(), Capacity::ZERO);
}

/// S6: two concurrent requests from the same consumer never collide on
/// req_id and each reaches its own independent terminal state.
#[tokio::test]
async fn concurrent_duplicate_requests_stay_independent() {
    let bus = Bus::new();
    let _p1 = provider_node(&bus, "10.0.0.1", Topology::Broadcast, Capacity { cpu: 4.0, ram: 4096.0, disk: 40.0 }, None);
    let (_consumer_d, initiator) = consumer_node(&bus, "10.0.0.9", Topology::Broadcast, None);

    let (r1, r2) = tokio::join!(
        initiator.send_request(cos_with(1.0, 128.0, 1.0), b"one".to_vec()),
        initiator.send_request(cos_with(1.0, 128.0, 1.0), b"two".to_vec()),
    );

    assert_ne!(r1.id, r2.id);
    assert_eq!(r1.state, ReqState::Dres);
    assert_eq!(r2.state, ReqState::Dres);
    assert_eq!(r1.result.as_deref(), Some(&b"one"[..]));
    assert_eq!(r2.result.as_deref(), Some(&b"two"[..]));
}

/// S5: orchestrator topology addresses HREQ to the decoy, and the
/// discovered host replies directly to the consumer for DREQ/DRES.
#[tokio::test]
async fn orchestrator_mediated_request_reaches_real_host() {
    let bus = Bus::new();
    let orch_ip: IpAddr = "10.0.0.254".parse().unwrap();
    // The "orchestrator" here plays provider role too: it answers HREQ
    // directly with host_ip pointing at the real executing host, matching
    // protocol_orch.py's HRES carrying host_mac/host_ip rather than offers.
    let real_host = provider_node(
        &bus,
        "10.0.0.5",
        Topology::Orchestrator,
        Capacity { cpu: 4.0, ram: 4096.0, disk: 40.0 },
        Some(orch_ip),
    );

    // A minimal orchestrator stand-in: relays HREQ into a real RREQ/RACK
    // reservation round-trip with the chosen host, then tells the consumer
    // where to go — the orchestrator's own admission/selection policy is
    // an external collaborator out of this crate's scope, but the wire
    // exchange it drives is the real one.
    let orch_rx = register(&bus, orch_ip);
    let orch_bus = bus.clone();
    let real_host_ip: IpAddr = "10.0.0.5".parse().unwrap();
    tokio::spawn(async move {
        let mut rx = orch_rx;
        let mut consumers: std::collections::HashMap<String, IpAddr> = std::collections::HashMap::new();
        while let Some((src, pkt)) = rx.recv().await {
            match pkt.state {
                oa_proto::State::Hreq => {
                    consumers.insert(pkt.req_id.clone(), src);
                    let mut rreq = Packet::new(oa_proto::State::Rreq, pkt.req_id.clone(), pkt.attempt_no);
                    rreq.cos_id = Some(1);
                    rreq.src_ip = Some(src.to_string());
                    if let Some(tx) = orch_bus.inboxes.get(&real_host_ip) {
                        let _ = tx.value().send((orch_ip, rreq));
                    }
                }
                oa_proto::State::Rres => {
                    let mut rack = Packet::new(oa_proto::State::Rack, pkt.req_id.clone(), pkt.attempt_no);
                    rack.src_mac = pkt.src_mac.clone();
                    rack.src_ip = pkt.src_ip.clone();
                    if let Some(tx) = orch_bus.inboxes.get(&src) {
                        let _ = tx.value().send((orch_ip, rack));
                    }
                    if let Some(consumer_ip) = consumers.get(&pkt.req_id) {
                        let mut hres = Packet::new(oa_proto::State::Hres, pkt.req_id.clone(), pkt.attempt_no);
                        hres.host_ip = Some(real_host_ip.to_string());
                        hres.host_mac = Some("aa:bb:cc:dd:ee:ff".to_string());
                        if let Some(tx) = orch_bus.inboxes.get(consumer_ip) {
                            let _ = tx.value().send((orch_ip, hres));
                        }
                    }
                }
                oa_proto::State::Dack | oa_proto::State::Dcan => {
                    // the consumer's ack is addressed to the orchestrator,
                    // which relays it on to the real host.
                    if let Some(tx) = orch_bus.inboxes.get(&real_host_ip) {
                        let _ = tx.value().send((orch_ip, pkt.clone()));
                    }
                }
                _ => {}
            }
        }
    });

    let (_consumer_d, initiator) = consumer_node(&bus, "10.0.0.9", Topology::Orchestrator, Some(orch_ip));
    let req = initiator.send_request(cos_with(1.0, 128.0, 1.0), b"payload".to_vec()).await;

    assert_eq!(req.state, ReqState::Dres);
    assert_eq!(req.host.as_deref(), Some("10.0.0.5"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(real_host.ledger().reserved(), Capacity::ZERO);
}

/// S3: a provider reserves against an RREQ but the consumer never follows
/// up with DREQ; once the reservation's hold window elapses the provider
/// frees the capacity on its own and tells the consumer RCAN.
#[tokio::test]
async fn reservation_released_on_dreq_timeout() {
    let bus = Bus::new();
    let p1 = provider_node(&bus, "10.0.0.1", Topology::Broadcast, Capacity { cpu: 4.0, ram: 4096.0, disk: 40.0 }, None);
    let consumer_ip: IpAddr = "10.0.0.9".parse().unwrap();
    let mut rx = register(&bus, consumer_ip);

    let cos = cos_with(1.0, 128.0, 1.0);
    let mut hreq = Packet::new(oa_proto::State::Hreq, "req-s3".to_string(), 1);
    hreq.cos_id = Some(cos.id);
    p1.handle_packet(hreq, consumer_ip).await;
    let (_src, hres) = rx.recv().await.expect("provider sends HRES");
    assert_eq!(hres.state, oa_proto::State::Hres);

    let mut rreq = Packet::new(oa_proto::State::Rreq, "req-s3".to_string(), 1);
    rreq.cos_id = Some(cos.id);
    p1.handle_packet(rreq, consumer_ip).await;

    let (_src, rres) = rx.recv().await.expect("provider sends RRES");
    assert_eq!(rres.state, oa_proto::State::Rres);
    assert_eq!(p1.ledger().reserved(), Capacity { cpu: 1.0, ram: 128.0, disk: 1.0 });

    // never send DREQ; the provider retries RRES for its whole retry budget,
    // then frees the reservation on its own and notifies the consumer RCAN.
    let cancel = loop {
        let (_src, pkt) = rx.recv().await.expect("provider eventually sends RCAN");
        match pkt.state {
            oa_proto::State::Rres => continue,
            other => break other,
        }
    };
    assert_eq!(cancel, oa_proto::State::Rcan);
    assert_eq!(p1.ledger().reserved(), Capacity::ZERO);
}

/// Two consumers race for a provider with capacity for exactly one
/// reservation: both see the offer (HRES), but only one `RREQ` wins the
/// `reserve`; the loser gets `RCAN` and restarts host discovery on a fresh
/// attempt instead of failing outright, succeeding once the winner's
/// `DACK` frees the slot back up.
#[tokio::test]
async fn rcan_during_reservation_restarts_host_discovery() {
    let bus = Bus::new();
    let capacity = Capacity { cpu: 1.0, ram: 128.0, disk: 1.0 };
    let p1 = provider_node(&bus, "10.0.0.1", Topology::Broadcast, capacity, None);
    let (_c1, initiator_a) = consumer_node(&bus, "10.0.0.9", Topology::Broadcast, None);
    let (_c2, initiator_b) = consumer_node(&bus, "10.0.0.10", Topology::Broadcast, None);

    let cos = cos_with(1.0, 128.0, 1.0);
    let (req_a, req_b) = tokio::join!(
        initiator_a.send_request(cos.clone(), b"from-a".to_vec()),
        initiator_b.send_request(cos, b"from-b".to_vec()),
    );

    assert_eq!(req_a.state, ReqState::Dres, "loser should restart and still finish");
    assert_eq!(req_b.state, ReqState::Dres, "loser should restart and still finish");
    assert!(
        req_a.attempts.len() >= 2 || req_b.attempts.len() >= 2,
        "the reservation loser should have needed a second attempt after RCAN"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p1.ledger().reserved(), Capacity::ZERO);
}

/// Late DRES reconciliation: a DRES that arrives after the request already
/// completed against a different host is rejected with DCAN instead of
/// silently overwriting the accepted result.
#[tokio::test]
async fn late_dres_from_a_different_host_is_rejected() {
    let bus = Bus::new();
    let consumer_ip: IpAddr = "10.0.0.9".parse().unwrap();
    let rx = register(&bus, consumer_ip);
    let ledger = Arc::new(ResourceLedger::new(Capacity::ZERO, 0.0, Mode::Simulated));
    let catalog = Arc::new(DashMap::new());
    let consumer = Arc::new(ConsumerRegistry::new());
    let provider_reg = Arc::new(ProviderRegistry::new());
    let transport = Arc::new(BusTransport { local: consumer_ip, bus: bus.clone() });
    let (sink, mut persisted) = ChannelSink::new();
    let dispatcher = InboundDispatcher::new(
        Topology::Broadcast,
        false,
        consumer_ip,
        None,
        None,
        catalog,
        ledger,
        Arc::new(EchoExecutor) as Arc<dyn Executor>,
        consumer.clone(),
        provider_reg,
        transport,
        fast_retry(),
        Arc::new(sink),
    );
    pump(dispatcher.clone(), rx);

    let id = consumer.alloc_unique_id();
    let mut req = oa_proto::Request::new(id.clone(), cos_with(1.0, 128.0, 1.0), b"payload".to_vec());
    req.new_attempt();
    consumer.insert(req);

    let h2: IpAddr = "10.0.0.2".parse().unwrap();
    let h1: IpAddr = "10.0.0.1".parse().unwrap();
    let mut dres_from_h2 = Packet::new(oa_proto::State::Dres, id.clone(), 1);
    dres_from_h2.data = Some(bytes::Bytes::from_static(b"from h2"));
    dispatcher.handle_packet(dres_from_h2, h2).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = persisted.try_recv().expect("first DRES persisted");
    assert_eq!(settled.host.as_deref(), Some("10.0.0.2"));

    let mut dres_from_h1 = Packet::new(oa_proto::State::Dres, id.clone(), 1);
    dres_from_h1.data = Some(bytes::Bytes::from_static(b"from h1, too late"));
    dispatcher.handle_packet(dres_from_h1, h1).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let req = consumer.get(&id).unwrap();
    assert_eq!(req.host.as_deref(), Some("10.0.0.2"));
    assert_eq!(req.result.as_deref(), Some(&b"from h2"[..]));
}
