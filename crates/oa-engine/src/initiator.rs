//! Request Initiator: the consumer side of
//! the offload handshake — allocate an id, discover a host, reserve
//! (broadcast topology only), exchange data, and hand back the terminal
//! `Request`. Waits on [`oa_proto::ConsumerRegistry::event_for`], woken by
//! whatever feeds [`crate::responder::InboundDispatcher::handle_packet`]
//! inbound packets.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use oa_proto::{AttemptState, CoS, ConsumerRegistry, Packet, ReqState, Request, State, Topology};

use crate::persist::PersistSink;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

pub struct RequestInitiator {
    topology: Topology,
    local_mac: Option<String>,
    broadcast_addr: IpAddr,
    /// Carried only for a future L2 framer — this transport
    /// addresses by IP alone, so the decoy MAC never reaches the wire here.
    #[allow(dead_code)]
    decoy_mac: Option<String>,
    decoy_ip: Option<IpAddr>,
    consumer: Arc<ConsumerRegistry>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    persist: Arc<dyn PersistSink>,
}

impl RequestInitiator {
    /// `broadcast_addr` is the wire destination used in broadcast topology
    /// (e.g. the subnet broadcast address); `decoy_mac`/`decoy_ip` are the
    /// controller addresses used in orchestrator topology
    /// (`CONTROLLER_DECOY_MAC`/`CONTROLLER_DECOY_IP`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: Topology,
        local_mac: Option<String>,
        broadcast_addr: IpAddr,
        decoy_mac: Option<String>,
        decoy_ip: Option<IpAddr>,
        consumer: Arc<ConsumerRegistry>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        persist: Arc<dyn PersistSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topology,
            local_mac,
            broadcast_addr,
            decoy_mac,
            decoy_ip,
            consumer,
            transport,
            retry,
            persist,
        })
    }

    /// Runs the full handshake for one offload request and returns the
    /// terminal snapshot (`state` is `Dres` on success, `Fail` otherwise).
    /// Safe to call concurrently from the same node — each call allocates
    /// its own id, so distinct calls never collide in the registry.
    ///
    /// A clean `RCAN`/`DCAN` from the reservation or data phase restarts the
    /// host-discovery loop (step 3) on a fresh `Attempt` with a refilled
    /// budget, while a plain timeout exhaustion also restarts step 3 but
    /// consumes from the shared outer budget — bounding total attempts by
    /// `PROTO_RETRIES²`, not `PROTO_RETRIES`.
    pub async fn send_request(self: &Arc<Self>, cos: CoS, data: Vec<u8>) -> Request {
        let id = self.consumer.alloc_unique_id();
        self.consumer.insert(Request::new(id.clone(), cos.clone(), data.clone()));
        info!(req_id = %id, "send_request: allocated id");

        let mut attempts_left = self.retry.max_retries;
        let hard_cap = self.retry.max_retries.saturating_mul(self.retry.max_retries).max(1);

        for iteration in 0..hard_cap {
            if attempts_left == 0 {
                break;
            }
            attempts_left -= 1;

            if let Some(mut req) = self.consumer.get_mut(&id) {
                req.new_attempt();
            }

            let host = match self.discover_host(&id, &cos).await {
                Some(h) => h,
                None => {
                    warn!(req_id = %id, iteration, "host discovery exhausted, no offer");
                    break;
                }
            };

            let host = if self.topology == Topology::Broadcast {
                match self.reserve_host(&id, &cos, host).await {
                    ReserveOutcome::Reserved(h) => h,
                    ReserveOutcome::CleanlyCancelled => {
                        debug!(req_id = %id, "reservation cancelled cleanly, restarting host discovery");
                        attempts_left = self.retry.max_retries;
                        continue;
                    }
                    ReserveOutcome::Exhausted => {
                        warn!(req_id = %id, iteration, "reservation exhausted, no host held");
                        break;
                    }
                }
            } else {
                host
            };

            match self.exchange_data(&id, host, data.clone()).await {
                ExchangeOutcome::Delivered => {
                    self.consumer.remove_event(&id);
                    return self.snapshot(&id);
                }
                ExchangeOutcome::CleanlyCancelled => {
                    debug!(req_id = %id, "data exchange cancelled cleanly, restarting host discovery");
                    attempts_left = self.retry.max_retries;
                }
                ExchangeOutcome::TimedOut => {
                    debug!(req_id = %id, "data exchange timed out, marking late and restarting host discovery");
                    self.mark_late(&id);
                }
            }
        }

        warn!(req_id = %id, "all retry budgets exhausted with no DRES");
        self.fail(&id, false);
        self.consumer.remove_event(&id);
        self.snapshot(&id)
    }

    fn snapshot(&self, id: &str) -> Request {
        self.consumer.get(id).map(|r| r.clone()).expect("just inserted")
    }

    fn fail(&self, id: &str, late: bool) {
        if let Some(mut req) = self.consumer.get_mut(id) {
            if matches!(req.state, ReqState::Dres) {
                return; // a late DRES beat us to it
            }
            req.state = ReqState::Fail;
            req.late = late;
            if let Some(att) = req.current_attempt_mut() {
                att.state = AttemptState::Fail;
            }
        }
    }

    fn attempt_state(&self, id: &str) -> Option<AttemptState> {
        self.consumer.get(id).and_then(|r| r.attempts.last().map(|a| a.state))
    }

    /// The attempt number `send_request`'s `req.new_attempt()` most recently
    /// opened, so every packet sent for this attempt reports it honestly on
    /// the wire instead of always claiming attempt 1.
    fn current_attempt_no(&self, id: &str) -> u32 {
        self.consumer.get(id).and_then(|r| r.attempts.last().map(|a| a.attempt_no)).unwrap_or(1)
    }

    fn mark_late(&self, id: &str) {
        if let Some(mut req) = self.consumer.get_mut(id) {
            if !matches!(req.state, ReqState::Dres) {
                req.late = true;
            }
        }
    }

    // ---- Step: host discovery (HREQ) ----

    async fn discover_host(self: &Arc<Self>, id: &str, cos: &CoS) -> Option<IpAddr> {
        let mut hreq = Packet::new(State::Hreq, id.to_string(), self.current_attempt_no(id));
        hreq.cos_id = Some(cos.id);
        let dest = match self.topology {
            Topology::Broadcast => self.broadcast_addr,
            Topology::Orchestrator => {
                hreq.src_mac = self.local_mac.clone();
                self.decoy_ip?
            }
        };
        let mut retries_left = self.retry.max_retries;
        while retries_left > 0 {
            retries_left -= 1;
            let _ = self.transport.send(dest, hreq.clone()).await;
            let notified = self.consumer.event_for(id);
            let _ = tokio::time::timeout(self.retry.timeout, notified.notified()).await;

            match self.topology {
                Topology::Broadcast => {
                    if let Some(req) = self.consumer.get(id) {
                        if let Some(att) = req.attempts.last() {
                            if let Some(first) = att.responses.first() {
                                if let Ok(ip) = first.host.parse() {
                                    return Some(ip);
                                }
                            }
                        }
                    }
                }
                Topology::Orchestrator => {
                    if let Some(req) = self.consumer.get(id) {
                        if let Some(host) = &req.host {
                            if let Ok(ip) = host.parse() {
                                return Some(ip);
                            }
                        }
                    }
                }
            }
        }
        None
    }

    // ---- Step: reservation (RREQ, broadcast topology only) ----

    /// An offer cancelled with `RCAN` is a clean failure of this host, not
    /// of the whole attempt — the caller restarts host discovery on a
    /// fresh `Attempt`.
    async fn reserve_host(self: &Arc<Self>, id: &str, cos: &CoS, first_offer: IpAddr) -> ReserveOutcome {
        let mut candidates = vec![first_offer];
        if let Some(req) = self.consumer.get(id) {
            if let Some(att) = req.attempts.last() {
                for resp in &att.responses {
                    if let Ok(ip) = resp.host.parse::<IpAddr>() {
                        if ip != first_offer && !candidates.contains(&ip) {
                            candidates.push(ip);
                        }
                    }
                }
            }
        }

        let attempt_no = self.current_attempt_no(id);
        let mut saw_cancel = false;
        for host in candidates {
            let rreq = {
                let mut p = Packet::new(State::Rreq, id.to_string(), attempt_no);
                p.cos_id = Some(cos.id);
                p
            };
            let mut retries_left = self.retry.max_retries;
            while retries_left > 0 {
                retries_left -= 1;
                let _ = self.transport.send(host, rreq.clone()).await;
                let notified = self.consumer.event_for(id);
                let _ = tokio::time::timeout(self.retry.timeout, notified.notified()).await;
                match self.attempt_state(id) {
                    Some(AttemptState::Dreq) => {
                        let reserved_host = self
                            .consumer
                            .get(id)
                            .and_then(|r| r.host.clone())
                            .and_then(|h| h.parse().ok())
                            .unwrap_or(host);
                        return ReserveOutcome::Reserved(reserved_host);
                    }
                    Some(AttemptState::Rcan) => {
                        saw_cancel = true;
                        break; // this host cancelled, try the next offer
                    }
                    _ => continue, // no reply yet, retry same host
                }
            }
        }
        if saw_cancel {
            ReserveOutcome::CleanlyCancelled
        } else {
            ReserveOutcome::Exhausted
        }
    }

    // ---- Step: data exchange (DREQ) ----

    async fn exchange_data(self: &Arc<Self>, id: &str, host: IpAddr, data: Vec<u8>) -> ExchangeOutcome {
        let mut dreq = Packet::new(State::Dreq, id.to_string(), self.current_attempt_no(id));
        dreq.data = Some(bytes::Bytes::from(data));

        let mut retries_left = self.retry.max_retries;
        while retries_left > 0 {
            let _ = self.transport.send(host, dreq.clone()).await;
            let notified = self.consumer.event_for(id);
            let woke = tokio::time::timeout(self.retry.timeout, notified.notified()).await.is_ok();

            if let Some(req) = self.consumer.get(id) {
                if req.state == ReqState::Dres {
                    info!(req_id = %id, "data exchange complete");
                    self.persist.persist_request(&req);
                    return ExchangeOutcome::Delivered;
                }
            }
            if self.attempt_state(id) == Some(AttemptState::Dcan) {
                return ExchangeOutcome::CleanlyCancelled;
            }
            // DWAIT pings extend the wait without consuming the retry
            // budget — providers reply DWAIT while the executor is still
            // running.
            if !woke {
                retries_left -= 1;
            }
        }
        ExchangeOutcome::TimedOut
    }
}

enum ReserveOutcome {
    Reserved(IpAddr),
    CleanlyCancelled,
    Exhausted,
}

enum ExchangeOutcome {
    Delivered,
    CleanlyCancelled,
    TimedOut,
}
