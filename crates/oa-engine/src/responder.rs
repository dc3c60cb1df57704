//! Protocol Responder.
//!
//! `InboundDispatcher` owns every collaborator a reply decision touches —
//! the ledger, the executor, both registries — and dispatches on
//! `Packet.state`. Both topologies share this one dispatcher; only
//! addressing and whether a reservation waits on an explicit `RACK` differ
//! (`has_src`/`has_host` on [`oa_proto::State`] already carry that
//! distinction into the wire form).

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use oa_executor::Executor;
use oa_ledger::ResourceLedger;
use oa_proto::{
    AttemptState, CoS, ConsumerRegistry, LateDresOutcome, Packet, ProviderKey, ProviderRegistry,
    ProviderRequest, ProviderState, State, Topology,
};

use crate::persist::PersistSink;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// Outcome of a provider's wait for the orchestrator's acknowledgement of a
/// reservation — `RACK` only exists in orchestrator topology; broadcast
/// providers wait directly for `DREQ`/`RCAN` instead, which arrive as
/// ordinary state transitions on the `ProviderRegistry` entry and need no
/// side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RackSignal {
    Acked,
    Cancelled,
}

pub struct InboundDispatcher {
    topology: Topology,
    is_resource: bool,
    local_ip: IpAddr,
    local_mac: Option<String>,
    orch_addr: Option<IpAddr>,
    cos_catalog: Arc<DashMap<u32, CoS>>,
    ledger: Arc<ResourceLedger>,
    executor: Arc<dyn Executor>,
    consumer: Arc<ConsumerRegistry>,
    provider: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    persist: Arc<dyn PersistSink>,
    rack_board: DashMap<ProviderKey, RackSignal>,
}

impl InboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: Topology,
        is_resource: bool,
        local_ip: IpAddr,
        local_mac: Option<String>,
        orch_addr: Option<IpAddr>,
        cos_catalog: Arc<DashMap<u32, CoS>>,
        ledger: Arc<ResourceLedger>,
        executor: Arc<dyn Executor>,
        consumer: Arc<ConsumerRegistry>,
        provider: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        persist: Arc<dyn PersistSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topology,
            is_resource,
            local_ip,
            local_mac,
            orch_addr,
            cos_catalog,
            ledger,
            executor,
            consumer,
            provider,
            transport,
            retry,
            persist,
            rack_board: DashMap::new(),
        })
    }

    pub fn consumer_registry(&self) -> Arc<ConsumerRegistry> {
        self.consumer.clone()
    }

    /// Main dispatch entry point; call once per inbound packet. A node is
    /// either in resource (provider) or client (consumer) mode, never
    /// both, so `is_resource` alone picks which half of the state machine
    /// applies to each shared wire state.
    pub async fn handle_packet(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        match pkt.state {
            State::Hreq if self.is_resource && self.topology == Topology::Broadcast => {
                self.on_hreq_broadcast(pkt, source).await;
            }
            State::Hres if !self.is_resource => self.on_hres(pkt, source).await,
            State::Rreq if self.is_resource => self.on_rreq(pkt, source).await,
            State::Rres if !self.is_resource => self.on_rres_consumer(pkt, source).await,
            State::Rres | State::Rack if self.is_resource => self.on_provider_signal(pkt, source).await,
            State::Rcan if self.is_resource => self.on_provider_signal(pkt, source).await,
            State::Rcan if !self.is_resource => self.on_consumer_cancel(pkt, source, AttemptState::Rcan).await,
            State::Dreq if self.is_resource => self.on_dreq(pkt, source).await,
            State::Dres if !self.is_resource => self.on_dres(pkt, source).await,
            State::Dwait if !self.is_resource => self.on_dwait(pkt).await,
            State::Dack if self.is_resource => self.on_dack(pkt, source).await,
            State::Dcan if self.is_resource => self.on_dcan(pkt, source).await,
            State::Dcan if !self.is_resource => self.on_consumer_cancel(pkt, source, AttemptState::Dcan).await,
            other => debug!(?other, %source, "no handler for inbound state in this role"),
        }
    }

    /// In orchestrator topology, `RREQ`/`RRES`/`RACK`/`RCAN`/`DACK`/`DCAN`
    /// travel through the orchestrator (`source` is its address, so the
    /// real consumer identity rides in the packet's `src_ip` field), while
    /// `DREQ`/`DRES` go straight between consumer and host (`source` is
    /// already the real consumer address) — matching which states
    /// `has_src` puts that field on in the wire codec.
    fn provider_key(&self, pkt: &Packet, source: IpAddr) -> Option<ProviderKey> {
        match self.topology {
            Topology::Broadcast => Some((source, pkt.req_id.clone())),
            Topology::Orchestrator => {
                let relayed = matches!(
                    pkt.state,
                    State::Rreq | State::Rres | State::Rack | State::Rcan | State::Dack | State::Dcan
                );
                if relayed {
                    let src_ip: IpAddr = pkt.src_ip.as_deref()?.trim().parse().ok()?;
                    Some((src_ip, pkt.req_id.clone()))
                } else {
                    Some((source, pkt.req_id.clone()))
                }
            }
        }
    }

    /// Where a provider's reply is actually addressed: in broadcast
    /// topology it goes straight to the consumer; in orchestrator topology,
    /// phases that are consumer/provider-local (HRES is sent by the
    /// orchestrator, not the provider, in this topology — providers only
    /// ever reply to `RREQ` via the orchestrator and to `DREQ` directly to
    /// the consumer, matching `protocol_orch.py`).
    fn reply_dest(&self, to_orchestrator: bool, source: IpAddr) -> IpAddr {
        if to_orchestrator {
            self.orch_addr.unwrap_or(source)
        } else {
            source
        }
    }

    // ---- Provider: HREQ (broadcast only) ----

    async fn on_hreq_broadcast(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        let Some(cos) = pkt.cos_id.and_then(|id| self.cos_catalog.get(&id).map(|c| c.clone())) else {
            warn!(cos_id = ?pkt.cos_id, "unknown cos_id in HREQ, dropping");
            return;
        };
        let key = (source, pkt.req_id.clone());
        let mut entry = self.provider.entry_or_insert_with(key.clone(), || ProviderRequest::new(cos.clone()));
        if !matches!(entry.state, ProviderState::Hreq | ProviderState::Hres) {
            return;
        }
        entry.cos = cos.clone();
        info!(req_id = %pkt.req_id, %source, "recv host request");
        if self.ledger.check(&cos, None) {
            entry.state = ProviderState::Hres;
            drop(entry);
            let totals = self.ledger.totals();
            let mut reply = Packet::new(State::Hres, pkt.req_id.clone(), pkt.attempt_no);
            reply.cpu_offer = Some(totals.cpu);
            reply.ram_offer = Some(totals.ram);
            reply.disk_offer = Some(totals.disk);
            let _ = self.transport.send(source, reply).await;
        } else {
            debug!(req_id = %pkt.req_id, "resources insufficient, not replying");
            entry.state = ProviderState::Hreq;
        }
    }

    // ---- Consumer: HRES ----

    async fn on_hres(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        let Some(mut req) = self.consumer.get_mut(&pkt.req_id) else { return };
        if matches!(req.state, oa_proto::ReqState::Dres | oa_proto::ReqState::Fail) {
            return;
        }
        match self.topology {
            Topology::Broadcast => {
                let cpu = pkt.cpu_offer.unwrap_or(0.0);
                let ram = pkt.ram_offer.unwrap_or(0.0);
                let disk = pkt.disk_offer.unwrap_or(0.0);
                let host = source.to_string();
                req.host = Some(host.clone());
                if let Some(att) = req.current_attempt_mut() {
                    att.host = Some(host.clone());
                    att.hres_at = Some(oa_clock::now());
                    att.responses.push(oa_proto::Response {
                        host,
                        cpu_offer: cpu,
                        ram_offer: ram,
                        disk_offer: disk,
                        timestamp: Some(oa_clock::now()),
                    });
                }
            }
            Topology::Orchestrator => {
                let host_ip = pkt.host_ip.as_deref().unwrap_or_default().trim().to_string();
                req.host = Some(host_ip.clone());
                req.state = oa_proto::ReqState::Dreq;
                if let Some(att) = req.current_attempt_mut() {
                    att.host = Some(host_ip);
                    att.state = AttemptState::Dreq;
                    att.hres_at = Some(oa_clock::now());
                }
            }
        }
        drop(req);
        self.consumer.event_for(&pkt.req_id).notify_one();
    }

    /// `DWAIT` carries no new state, only a ping telling the consumer the
    /// host is still executing and the wait should keep going. Woken
    /// initiators distinguish this from a terminal state by re-reading the
    /// `Request`'s state after the wake.
    async fn on_dwait(self: &Arc<Self>, pkt: Packet) {
        self.consumer.event_for(&pkt.req_id).notify_one();
    }

    /// A provider cancelled this attempt (`RCAN` from an exhausted
    /// reservation hold in broadcast topology, or `DCAN` from a DREQ the
    /// provider could not honor) — mark the current attempt so the
    /// initiator's retry loop knows to try the next offer or give up.
    async fn on_consumer_cancel(self: &Arc<Self>, pkt: Packet, source: IpAddr, outcome: AttemptState) {
        let Some(mut req) = self.consumer.get_mut(&pkt.req_id) else { return };
        if matches!(req.state, oa_proto::ReqState::Dres | oa_proto::ReqState::Fail) {
            return;
        }
        let current_host_matches = req
            .current_attempt_mut()
            .and_then(|att| att.host.clone())
            .map(|h| h == source.to_string())
            .unwrap_or(true);
        if !current_host_matches {
            return; // stale cancellation from a host we already moved past
        }
        if let Some(att) = req.current_attempt_mut() {
            att.state = outcome;
        }
        drop(req);
        self.consumer.event_for(&pkt.req_id).notify_one();
    }

    /// Consumer-side (broadcast topology only — orchestrator mode has no
    /// consumer-visible reservation phase): the host we reserved against
    /// confirmed, so lock the attempt onto it before moving to `DREQ`.
    async fn on_rres_consumer(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        let Some(mut req) = self.consumer.get_mut(&pkt.req_id) else { return };
        if matches!(req.state, oa_proto::ReqState::Dres | oa_proto::ReqState::Fail) {
            return;
        }
        req.host = Some(source.to_string());
        req.state = oa_proto::ReqState::Dreq;
        if let Some(att) = req.current_attempt_mut() {
            att.host = Some(source.to_string());
            att.state = AttemptState::Dreq;
            att.rres_at = Some(oa_clock::now());
        }
        drop(req);
        self.consumer.event_for(&pkt.req_id).notify_one();
    }

    // ---- Provider: RREQ ----

    async fn on_rreq(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        let Some(key) = self.provider_key(&pkt, source) else { return };
        let to_orch = self.topology == Topology::Orchestrator;

        let should_spawn = {
            let mut entry = match self.topology {
                Topology::Broadcast => match self.provider.get_mut(&key) {
                    Some(e) => e,
                    None => return,
                },
                Topology::Orchestrator => {
                    let cos = match pkt.cos_id.and_then(|id| self.cos_catalog.get(&id).map(|c| c.clone())) {
                        Some(c) => c,
                        None => return,
                    };
                    self.provider.entry_or_insert_with(key.clone(), || ProviderRequest::new(cos))
                }
            };
            match entry.state {
                ProviderState::Hres if self.topology == Topology::Broadcast => {
                    if self.ledger.reserve(&entry.cos, None) {
                        entry.state = ProviderState::Rres;
                        entry.freed = false;
                        true
                    } else {
                        entry.state = ProviderState::Hreq;
                        false
                    }
                }
                ProviderState::Hreq | ProviderState::Rreq | ProviderState::Rcan
                    if self.topology == Topology::Orchestrator =>
                {
                    if self.ledger.reserve(&entry.cos, None) {
                        entry.state = ProviderState::Rres;
                        entry.freed = false;
                        true
                    } else {
                        entry.state = ProviderState::Rreq;
                        false
                    }
                }
                ProviderState::Rres => false, // already reserved, responder task already running
                _ => return,
            }
        };

        if !should_spawn {
            // reservation failed this attempt: tell the requester (only
            // reachable when we just failed to reserve above).
            if let Some(entry) = self.provider.get(&key) {
                if entry.state != ProviderState::Rres {
                    let mut reply = Packet::new(State::Rcan, pkt.req_id.clone(), pkt.attempt_no);
                    if to_orch {
                        reply.src_mac = pkt.src_mac.clone();
                        reply.src_ip = pkt.src_ip.clone();
                    }
                    let dest = self.reply_dest(to_orch, source);
                    let _ = self.transport.send(dest, reply).await;
                }
            }
            return;
        }

        let this = self.clone();
        let req_id = pkt.req_id.clone();
        let attempt_no = pkt.attempt_no;
        let src_fields = (pkt.src_mac.clone(), pkt.src_ip.clone());
        tokio::spawn(async move {
            this.respond_resources(key, req_id, attempt_no, source, src_fields).await;
        });
    }

    /// Sends `RRES` and waits for whatever completes the reservation
    /// handshake: in orchestrator topology that's an explicit `RACK`/`RCAN`
    /// from the orchestrator followed by a bounded wait for `DREQ`; in
    /// broadcast topology the consumer just proceeds straight to `DREQ`, so
    /// this only needs to wait out the reservation's hold timer.
    async fn respond_resources(
        self: Arc<Self>,
        key: ProviderKey,
        req_id: String,
        attempt_no: u32,
        source: IpAddr,
        src_fields: (Option<String>, Option<String>),
    ) {
        let to_orch = self.topology == Topology::Orchestrator;
        let dest = self.reply_dest(to_orch, source);
        let mut reply = Packet::new(State::Rres, req_id.clone(), attempt_no);
        if to_orch {
            reply.src_mac = src_fields.0.clone();
            reply.src_ip = src_fields.1.clone();
        }

        let mut retries = self.retry.max_retries;
        let mut acked = false;
        while retries > 0 {
            retries -= 1;
            let _ = self.transport.send(dest, reply.clone()).await;
            let notified = self.provider.event_for(key.clone());
            let woke = tokio::time::timeout(self.retry.timeout, notified.notified()).await.is_ok();
            if woke {
                if to_orch {
                    match self.rack_board.remove(&key).map(|(_, v)| v) {
                        Some(RackSignal::Acked) => {
                            acked = true;
                            break;
                        }
                        Some(RackSignal::Cancelled) => {
                            if let Some(mut entry) = self.provider.get_mut(&key) {
                                if entry.state == ProviderState::Rres {
                                    entry.state = ProviderState::Rcan;
                                    self.ledger.free(&entry.cos);
                                    entry.freed = true;
                                }
                            }
                            return;
                        }
                        None => continue,
                    }
                } else if let Some(entry) = self.provider.get(&key) {
                    if !matches!(entry.state, ProviderState::Rres) {
                        // DREQ (or cancellation) already advanced state.
                        return;
                    }
                }
            }
        }

        if to_orch && !acked {
            if let Some(mut entry) = self.provider.get_mut(&key) {
                if entry.state == ProviderState::Rres {
                    self.ledger.free(&entry.cos);
                    entry.freed = true;
                    entry.state = ProviderState::Rcan;
                }
            }
            return;
        }

        if to_orch && acked {
            // wait out the DREQ arrival window; if it never shows, free.
            let notified = self.provider.event_for(key.clone());
            let window = self.retry.timeout * self.retry.max_retries;
            let woke = tokio::time::timeout(window, notified.notified()).await.is_ok();
            let still_reserved = self
                .provider
                .get(&key)
                .map(|e| e.state == ProviderState::Rres)
                .unwrap_or(false);
            if !woke && still_reserved {
                if let Some(mut entry) = self.provider.get_mut(&key) {
                    self.ledger.free(&entry.cos);
                    entry.freed = true;
                    entry.state = ProviderState::Rcan;
                }
            }
        } else if !to_orch {
            // broadcast: reservation timed out with no DREQ ever arriving.
            if let Some(mut entry) = self.provider.get_mut(&key) {
                if entry.state == ProviderState::Rres {
                    self.ledger.free(&entry.cos);
                    entry.freed = true;
                    entry.state = ProviderState::Hreq;
                    drop(entry);
                    let cancel = Packet::new(State::Rcan, req_id, attempt_no);
                    let _ = self.transport.send(source, cancel).await;
                }
            }
        }
    }

    async fn on_provider_signal(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        let Some(key) = self.provider_key(&pkt, source) else { return };
        match pkt.state {
            State::Rack => {
                self.rack_board.insert(key.clone(), RackSignal::Acked);
            }
            State::Rcan => {
                self.rack_board.insert(key.clone(), RackSignal::Cancelled);
            }
            _ => {}
        }
        self.provider.event_for(key).notify_one();
    }

    // ---- Provider: DREQ ----

    async fn on_dreq(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        let Some(key) = self.provider_key(&pkt, source) else { return };
        let to_orch = self.topology == Topology::Orchestrator;

        enum Action {
            ReplyCached(Bytes),
            ReplyWait,
            ReplyCancel,
            Execute,
            Ignore,
        }

        let action = match self.provider.get_mut(&key) {
            None => Action::Ignore,
            Some(mut entry) => match entry.state {
                ProviderState::Dres => Action::ReplyCached(Bytes::from(entry.result.clone().unwrap_or_default())),
                ProviderState::Dreq => Action::ReplyWait,
                ProviderState::Rcan => {
                    if self.ledger.check(&entry.cos, None) && self.ledger.reserve(&entry.cos, None) {
                        entry.state = ProviderState::Dreq;
                        entry.freed = false;
                        Action::Execute
                    } else {
                        Action::ReplyCancel
                    }
                }
                ProviderState::Rres => {
                    entry.state = ProviderState::Dreq;
                    Action::Execute
                }
                _ => Action::Ignore,
            },
        };
        self.provider.event_for(key.clone()).notify_one();

        match action {
            Action::Ignore => {}
            Action::ReplyCached(data) => {
                let mut reply = Packet::new(State::Dres, pkt.req_id.clone(), pkt.attempt_no);
                reply.data = Some(data);
                let _ = self.transport.send(source, reply).await;
            }
            Action::ReplyWait => {
                let reply = Packet::new(State::Dwait, pkt.req_id.clone(), pkt.attempt_no);
                let _ = self.transport.send(source, reply).await;
            }
            Action::ReplyCancel => {
                let mut reply = Packet::new(State::Dcan, pkt.req_id.clone(), pkt.attempt_no);
                if to_orch {
                    reply.src_mac = pkt.src_mac.clone();
                    reply.src_ip = pkt.src_ip.clone();
                }
                let _ = self.transport.send(source, reply).await;
            }
            Action::Execute => {
                let this = self.clone();
                let req_id = pkt.req_id.clone();
                let attempt_no = pkt.attempt_no;
                let data = pkt.data.clone().unwrap_or_default();
                tokio::spawn(async move {
                    this.respond_data(key, req_id, attempt_no, source, data).await;
                });
            }
        }
    }

    async fn respond_data(
        self: Arc<Self>,
        key: ProviderKey,
        req_id: String,
        attempt_no: u32,
        source: IpAddr,
        data: Bytes,
    ) {
        let result = match self.executor.execute(data).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "executor failed, cancelling");
                if let Some(mut entry) = self.provider.get_mut(&key) {
                    if !entry.freed {
                        self.ledger.free(&entry.cos);
                        entry.freed = true;
                    }
                }
                let reply = Packet::new(State::Dcan, req_id, attempt_no);
                let _ = self.transport.send(source, reply).await;
                return;
            }
        };

        if let Some(mut entry) = self.provider.get_mut(&key) {
            entry.result = Some(result.to_vec());
            entry.state = ProviderState::Dres;
        }

        let mut reply = Packet::new(State::Dres, req_id, attempt_no);
        reply.data = Some(result);

        let mut retries = self.retry.max_retries;
        while retries > 0 {
            retries -= 1;
            let _ = self.transport.send(source, reply.clone()).await;
            let notified = self.provider.event_for(key.clone());
            let woke = tokio::time::timeout(self.retry.timeout, notified.notified()).await.is_ok();
            if woke {
                let freed = self.provider.get(&key).map(|e| e.freed).unwrap_or(true);
                if freed {
                    return;
                }
            }
        }

        if let Some(mut entry) = self.provider.get_mut(&key) {
            if !entry.freed {
                self.ledger.free(&entry.cos);
                entry.freed = true;
            }
        }
    }

    // ---- Consumer: DRES ----

    async fn on_dres(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        if !self.consumer.contains(&pkt.req_id) {
            return;
        }
        let data = pkt.data.clone().unwrap_or_default().to_vec();
        let outcome = self.consumer.try_accept_late_dres(&pkt.req_id, &source.to_string(), data);
        let to_orch = self.topology == Topology::Orchestrator;

        match outcome {
            LateDresOutcome::Accepted => {
                info!(req_id = %pkt.req_id, %source, "recv data exchange response");
                let mut reply = Packet::new(State::Dack, pkt.req_id.clone(), pkt.attempt_no);
                let dest = self.stamp_consumer_reply(&mut reply, to_orch, source);
                let _ = self.transport.send(dest, reply).await;
                self.consumer.event_for(&pkt.req_id).notify_one();
                if let Some(req) = self.consumer.get(&pkt.req_id) {
                    self.persist.persist_request(&req);
                }
            }
            LateDresOutcome::DuplicateSameHost => {
                let mut reply = Packet::new(State::Dack, pkt.req_id.clone(), pkt.attempt_no);
                let dest = self.stamp_consumer_reply(&mut reply, to_orch, source);
                let _ = self.transport.send(dest, reply).await;
            }
            LateDresOutcome::DuplicateOtherHost => {
                let mut reply = Packet::new(State::Dcan, pkt.req_id.clone(), pkt.attempt_no);
                let dest = self.stamp_consumer_reply(&mut reply, to_orch, source);
                let _ = self.transport.send(dest, reply).await;
            }
            LateDresOutcome::UnknownRequest => {}
        }
    }

    /// Stamps `src_mac`/`src_ip` (our own address, so the provider can
    /// rebuild its `(consumer_ip, req_id)` key once the orchestrator
    /// relays this) and `host_ip` (the host that sent the `DRES` this
    /// answers) on a `DACK`/`DCAN`, and returns where it should go —
    /// straight to the host in broadcast topology, to the orchestrator in
    /// orchestrator topology (`protocol_orch.py`'s `_respond_data`
    /// counterpart expects the ack routed back through it).
    fn stamp_consumer_reply(&self, reply: &mut Packet, to_orch: bool, host: IpAddr) -> IpAddr {
        if !to_orch {
            return host;
        }
        reply.src_mac = self.local_mac.clone();
        reply.src_ip = Some(self.local_ip.to_string());
        reply.host_ip = Some(host.to_string());
        self.orch_addr.unwrap_or(host)
    }

    // ---- Provider: DACK / DCAN ----

    async fn on_dack(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        if !self.accepted_from(source) {
            return;
        }
        let Some(key) = self.provider_key(&pkt, source) else { return };
        if let Some(mut entry) = self.provider.get_mut(&key) {
            if entry.state == ProviderState::Dres && !entry.freed {
                info!(req_id = %pkt.req_id, "recv data exchange acknowledgement, freeing resources");
                self.ledger.free(&entry.cos);
                entry.freed = true;
            }
        }
        self.provider.event_for(key).notify_one();
    }

    async fn on_dcan(self: &Arc<Self>, pkt: Packet, source: IpAddr) {
        if !self.accepted_from(source) {
            return;
        }
        let Some(key) = self.provider_key(&pkt, source) else { return };
        if let Some(mut entry) = self.provider.get_mut(&key) {
            if entry.state == ProviderState::Dres && !entry.freed {
                info!(req_id = %pkt.req_id, "recv data exchange cancellation, freeing resources");
                self.ledger.free(&entry.cos);
                entry.freed = true;
            }
        }
        self.provider.event_for(key).notify_one();
    }

    fn accepted_from(&self, source: IpAddr) -> bool {
        match self.topology {
            Topology::Broadcast => true,
            Topology::Orchestrator => self.orch_addr == Some(source),
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn provider_registry(&self) -> &ProviderRegistry {
        &self.provider
    }
}
