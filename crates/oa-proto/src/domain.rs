//! Data model: Node, Interface, CoS, Request, Attempt,
//! Response and ProviderRequest, plus the invariants each type carries.
//!
//! Plain serde-derived structs with a `validate()` method rather than
//! validating in constructors — construction stays infallible and
//! invariants get checked where they matter (at the admission boundary,
//! before persistence).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use oa_clock::Timestamp;
use oa_ledger::Requirement;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("cpu_free ({cpu_free}) exceeds cpu_count ({cpu_count})")]
    CpuFreeExceedsCount { cpu_free: u32, cpu_count: u32 },
    #[error("memory_free ({0}) exceeds memory_total ({1})")]
    MemoryFreeExceedsTotal(f64, f64),
    #[error("disk_free ({0}) exceeds disk_total ({1})")]
    DiskFreeExceedsTotal(f64, f64),
    #[error("bandwidth_up ({0}) exceeds capacity ({1})")]
    BandwidthUpExceedsCapacity(f64, f64),
    #[error("bandwidth_down ({0}) exceeds capacity ({1})")]
    BandwidthDownExceedsCapacity(f64, f64),
}

/// One of the six node kinds an agent can register as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Server,
    Vm,
    IotObject,
    Gateway,
    Switch,
    Router,
}

/// Volatile capacity snapshot of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeSpecs {
    pub cpu_count: u32,
    pub cpu_free: f64,
    pub memory_total: f64,
    pub memory_free: f64,
    pub disk_total: f64,
    pub disk_free: f64,
    #[serde(skip)]
    pub timestamp: Option<Timestamp>,
}

impl Default for NodeSpecs {
    fn default() -> Self {
        Self {
            cpu_count: 0,
            cpu_free: 0.0,
            memory_total: 0.0,
            memory_free: 0.0,
            disk_total: 0.0,
            disk_free: 0.0,
            timestamp: None,
        }
    }
}

impl NodeSpecs {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.cpu_free > self.cpu_count as f64 {
            return Err(DomainError::CpuFreeExceedsCount {
                cpu_free: self.cpu_free as u32,
                cpu_count: self.cpu_count,
            });
        }
        if self.memory_free > self.memory_total {
            return Err(DomainError::MemoryFreeExceedsTotal(self.memory_free, self.memory_total));
        }
        if self.disk_free > self.disk_total {
            return Err(DomainError::DiskFreeExceedsTotal(self.disk_free, self.disk_total));
        }
        Ok(())
    }
}

/// Volatile capacity snapshot of one network interface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpecs {
    pub capacity: f64,
    pub bandwidth_up: f64,
    pub bandwidth_down: f64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    #[serde(skip)]
    pub timestamp: Option<Timestamp>,
}

impl Default for InterfaceSpecs {
    fn default() -> Self {
        Self {
            capacity: 0.0,
            bandwidth_up: 0.0,
            bandwidth_down: 0.0,
            tx_packets: 0,
            rx_packets: 0,
            timestamp: None,
        }
    }
}

impl InterfaceSpecs {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.bandwidth_up > self.capacity {
            return Err(DomainError::BandwidthUpExceedsCapacity(self.bandwidth_up, self.capacity));
        }
        if self.bandwidth_down > self.capacity {
            return Err(DomainError::BandwidthDownExceedsCapacity(self.bandwidth_down, self.capacity));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub index: Option<u32>,
    pub mac: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub specs: InterfaceSpecs,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
            mac: None,
            ipv4: None,
            specs: InterfaceSpecs::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: String,
    pub node_type: NodeType,
    /// `1 - limit/100`: the fraction of capacity the ledger refuses to commit.
    pub threshold: f64,
    pub interfaces: HashMap<String, Interface>,
    pub specs: NodeSpecs,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, node_type: NodeType, threshold: f64) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            node_type,
            threshold,
            interfaces: HashMap::new(),
            specs: NodeSpecs::default(),
        }
    }
}

/// A Class of Service's QoS + resource requirement vector.
/// Only `{min_cpu, min_ram, min_disk}` gate admission in the core; the rest
/// are passed through to the orchestrator untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoSRequirement {
    pub max_response_time: Option<f64>,
    pub min_bandwidth: Option<f64>,
    pub max_delay: Option<f64>,
    pub max_jitter: Option<f64>,
    pub max_loss_rate: Option<f64>,
    pub min_cpu: f64,
    pub min_ram: f64,
    pub min_disk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoS {
    pub id: u32,
    pub name: String,
    pub requirement: CoSRequirement,
}

impl Requirement for CoS {
    fn min_cpu(&self) -> f64 {
        self.requirement.min_cpu
    }
    fn min_ram(&self) -> f64 {
        self.requirement.min_ram
    }
    fn min_disk(&self) -> f64 {
        self.requirement.min_disk
    }
}

/// Consumer-side Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqState {
    Hreq,
    Rreq,
    Dreq,
    Dres,
    Fail,
}

/// Per-attempt lifecycle state. A superset of `ReqState`
/// with the cancellation outcomes an attempt can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    Hreq,
    Rreq,
    Dreq,
    Dres,
    Rcan,
    Dcan,
    Fail,
}

/// One offer observed for an attempt: a host's {cpu, ram, disk} bid plus
/// when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub host: String,
    pub cpu_offer: f64,
    pub ram_offer: f64,
    pub disk_offer: f64,
    #[serde(skip)]
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_no: u32,
    pub host: Option<String>,
    pub state: AttemptState,
    #[serde(skip)]
    pub hreq_at: Option<Timestamp>,
    #[serde(skip)]
    pub hres_at: Option<Timestamp>,
    #[serde(skip)]
    pub rres_at: Option<Timestamp>,
    #[serde(skip)]
    pub dres_at: Option<Timestamp>,
    pub responses: Vec<Response>,
}

impl Attempt {
    pub fn new(attempt_no: u32) -> Self {
        Self {
            attempt_no,
            host: None,
            state: AttemptState::Hreq,
            hreq_at: None,
            hres_at: None,
            rres_at: None,
            dres_at: None,
            responses: Vec::new(),
        }
    }
}

/// Consumer view of an in-flight (or completed) offload request
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub cos: CoS,
    pub data: Vec<u8>,
    pub result: Option<Vec<u8>>,
    pub host: Option<String>,
    pub state: ReqState,
    #[serde(skip)]
    pub hreq_at: Option<Timestamp>,
    #[serde(skip)]
    pub dres_at: Option<Timestamp>,
    pub attempts: Vec<Attempt>,
    /// "Consumer has given up actively waiting but will accept a DRES if
    /// one arrives".
    pub late: bool,
}

impl Request {
    pub fn new(id: impl Into<String>, cos: CoS, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            cos,
            data,
            result: None,
            host: None,
            state: ReqState::Hreq,
            hreq_at: None,
            dres_at: None,
            attempts: Vec::new(),
            late: false,
        }
    }

    /// Opens a fresh attempt with `attempt_no` one greater than the last,
    /// keeping attempt numbers a consecutive 1-based sequence.
    pub fn new_attempt(&mut self) -> &mut Attempt {
        let attempt_no = self.attempts.len() as u32 + 1;
        self.attempts.push(Attempt::new(attempt_no));
        self.attempts.last_mut().expect("just pushed")
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }
}

/// Provider-side lifecycle state, keyed externally by `(consumer_ip, req_id)`
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderState {
    Hreq,
    Hres,
    Rreq,
    Rres,
    Dreq,
    Dres,
    Rcan,
    Dcan,
    HreqCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub cos: CoS,
    pub state: ProviderState,
    pub result: Option<Vec<u8>>,
    /// Set once the ledger reservation backing this request has been freed;
    /// `free` must be called at most once per reservation.
    pub freed: bool,
}

impl ProviderRequest {
    pub fn new(cos: CoS) -> Self {
        Self { cos, state: ProviderState::Hreq, result: None, freed: false }
    }
}
