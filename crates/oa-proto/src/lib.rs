//! Domain model, wire codec and request registry for the offload protocol.

pub mod codec;
pub mod domain;
pub mod registry;

pub use codec::{accept_inbound, answers, CodecError, Packet, State, Topology};
pub use domain::{
    Attempt, AttemptState, CoS, CoSRequirement, DomainError, Interface, InterfaceSpecs, Node,
    NodeSpecs, NodeType, ProviderRequest, ProviderState, ReqState, Request, Response,
};
pub use registry::{ConsumerRegistry, LateDresOutcome, ProviderRegistry, ProviderKey, ReqId};
