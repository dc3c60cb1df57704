//! Request Registry.
//!
//! Two concurrent tables — consumer requests keyed by id, provider requests
//! keyed by `(consumer_ip, req_id)` — plus a parallel map of per-request
//! event primitives. Entries are never destroyed in memory — a completed
//! request is persisted once it reaches a terminal state, not evicted;
//! callers choose whether to drop the event handle once a request reaches
//! a terminal state.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use tokio::sync::Notify;

use oa_clock::{gen_req_id, now};

use crate::domain::{AttemptState, ProviderRequest, ReqState, Request};

pub type ReqId = String;
pub type ProviderKey = (IpAddr, ReqId);

/// Outcome of a compare-and-swap attempt to accept a late `DRES`, checked
/// and set against `dres_at == null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateDresOutcome {
    /// No DRES had been accepted yet; this one was just recorded.
    Accepted,
    /// A DRES from the same host was already accepted — reply DACK.
    DuplicateSameHost,
    /// A DRES from a different host was already accepted — reply DCAN.
    DuplicateOtherHost,
    /// The request id is not known to this registry.
    UnknownRequest,
}

/// Consumer-side table of in-flight and completed requests.
#[derive(Default)]
pub struct ConsumerRegistry {
    requests: DashMap<ReqId, Request>,
    events: DashMap<ReqId, Arc<Notify>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id not already present in this registry.
    pub fn alloc_unique_id(&self) -> ReqId {
        loop {
            let candidate = gen_req_id();
            if !self.requests.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn insert(&self, req: Request) {
        self.requests.insert(req.id.clone(), req);
    }

    pub fn get(&self, id: &str) -> Option<Ref<'_, ReqId, Request>> {
        self.requests.get(id)
    }

    pub fn get_mut(&self, id: &str) -> Option<RefMut<'_, ReqId, Request>> {
        self.requests.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.requests.contains_key(id)
    }

    /// Returns (creating if absent) the single-fire event primitive for
    /// `id`. Safe against repeated `notify_one`/`notified` calls — idempotent
    /// against multiple wakeups.
    pub fn event_for(&self, id: &str) -> Arc<Notify> {
        self.events.entry(id.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    pub fn remove_event(&self, id: &str) {
        self.events.remove(id);
    }

    /// Attempts to accept a late DRES under CAS semantics.
    pub fn try_accept_late_dres(&self, id: &str, host: &str, result: Vec<u8>) -> LateDresOutcome {
        let Some(mut req) = self.requests.get_mut(id) else {
            return LateDresOutcome::UnknownRequest;
        };
        if req.dres_at.is_some() {
            return if req.host.as_deref() == Some(host) {
                LateDresOutcome::DuplicateSameHost
            } else {
                LateDresOutcome::DuplicateOtherHost
            };
        }
        let at = now();
        req.dres_at = Some(at);
        req.state = ReqState::Dres;
        req.host = Some(host.to_string());
        req.result = Some(result);
        if let Some(att) = req.current_attempt_mut() {
            att.state = AttemptState::Dres;
            att.dres_at = Some(at);
        }
        LateDresOutcome::Accepted
    }

    /// Records an `HRES` observed from a stale attempt's host without
    /// treating it as an accepted offer — ignored as an offer, but recorded
    /// in that attempt's response list.
    pub fn record_stale_offer(&self, id: &str, attempt_no: u32, host: &str, cpu: f64, ram: f64, disk: f64) {
        if let Some(mut req) = self.requests.get_mut(id) {
            if let Some(att) = req.attempts.iter_mut().find(|a| a.attempt_no == attempt_no) {
                att.responses.push(crate::domain::Response {
                    host: host.to_string(),
                    cpu_offer: cpu,
                    ram_offer: ram,
                    disk_offer: disk,
                    timestamp: Some(now()),
                });
            }
        }
    }
}

/// Provider-side table of in-flight requests, keyed by `(consumer_ip, req_id)`.
#[derive(Default)]
pub struct ProviderRegistry {
    requests: DashMap<ProviderKey, ProviderRequest>,
    events: DashMap<ProviderKey, Arc<Notify>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_or_insert_with(
        &self,
        key: ProviderKey,
        default: impl FnOnce() -> ProviderRequest,
    ) -> RefMut<'_, ProviderKey, ProviderRequest> {
        self.requests.entry(key).or_insert_with(default)
    }

    pub fn get(&self, key: &ProviderKey) -> Option<Ref<'_, ProviderKey, ProviderRequest>> {
        self.requests.get(key)
    }

    pub fn get_mut(&self, key: &ProviderKey) -> Option<RefMut<'_, ProviderKey, ProviderRequest>> {
        self.requests.get_mut(key)
    }

    pub fn remove(&self, key: &ProviderKey) {
        self.requests.remove(key);
        self.events.remove(key);
    }

    pub fn event_for(&self, key: ProviderKey) -> Arc<Notify> {
        self.events.entry(key).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    pub fn remove_event(&self, key: &ProviderKey) {
        self.events.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CoS, CoSRequirement, Request};

    fn cos() -> CoS {
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
        }
    }

    #[test]
    fn alloc_unique_id_avoids_collisions() {
        let reg = ConsumerRegistry::new();
        let first = reg.alloc_unique_id();
        reg.insert(Request::new(first.clone(), cos(), vec![]));
        for _ in 0..1000 {
            let id = reg.alloc_unique_id();
            assert_ne!(id, first);
        }
    }

    #[test]
    fn late_dres_cas_semantics() {
        let reg = ConsumerRegistry::new();
        let id = "abcdefghij".to_string();
        let mut req = Request::new(id.clone(), cos(), vec![]);
        req.new_attempt();
        reg.insert(req);

        assert_eq!(
            reg.try_accept_late_dres(&id, "10.0.0.5", b"res".to_vec()),
            LateDresOutcome::Accepted
        );
        assert_eq!(
            reg.try_accept_late_dres(&id, "10.0.0.5", b"res2".to_vec()),
            LateDresOutcome::DuplicateSameHost
        );
        assert_eq!(
            reg.try_accept_late_dres(&id, "10.0.0.9", b"res3".to_vec()),
            LateDresOutcome::DuplicateOtherHost
        );
    }

    #[test]
    fn unknown_request_reports_unknown() {
        let reg = ConsumerRegistry::new();
        assert_eq!(
            reg.try_accept_late_dres("zzzzzzzzzz", "10.0.0.5", vec![]),
            LateDresOutcome::UnknownRequest
        );
    }

    #[test]
    fn event_for_is_stable_across_calls() {
        let reg = ConsumerRegistry::new();
        let e1 = reg.event_for("abcdefghij");
        let e2 = reg.event_for("abcdefghij");
        assert!(Arc::ptr_eq(&e1, &e2));
    }
}
