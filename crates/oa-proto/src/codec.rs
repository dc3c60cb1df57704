//! Wire codec.
//!
//! One packet type is carried inside IPv4 (and, in broadcast mode, framed
//! in L2 Ethernet). Field presence is conditional on `(state, topology)`;
//! encoding/decoding uses a fixed-header layout over a `bytes::{Buf,
//! BufMut}` cursor, one flat buffer per datagram: an explicit inbound loop
//! reads datagrams directly and writes replies with the same codec.

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use oa_clock::REQ_ID_LEN;

pub const MAC_LEN: usize = 17;
pub const IP_LEN: usize = 15;

/// Which addressing scheme the packet was built for — determines which of
/// the optional fields apply ("(broadcast mode)" /
/// "(orchestrator mode)" annotations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Broadcast,
    Orchestrator,
}

/// Protocol state, `state` field's enumeration.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Fail = 0,
    Hreq = 1,
    Hres = 2,
    Rreq = 3,
    Rres = 4,
    Rack = 5,
    Rcan = 6,
    Dreq = 7,
    Dres = 8,
    Dack = 9,
    Dcan = 10,
    Dwait = 11,
}

impl State {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => State::Fail,
            1 => State::Hreq,
            2 => State::Hres,
            3 => State::Rreq,
            4 => State::Rres,
            5 => State::Rack,
            6 => State::Rcan,
            7 => State::Dreq,
            8 => State::Dres,
            9 => State::Dack,
            10 => State::Dcan,
            11 => State::Dwait,
            other => return Err(CodecError::InvalidState(other)),
        })
    }

    /// States that legally answer a packet in `self`'s state.
    pub fn expects(self) -> &'static [State] {
        match self {
            State::Hreq => &[State::Hres],
            State::Rreq => &[State::Rres, State::Rcan],
            State::Rres => &[State::Dreq, State::Rack, State::Rcan],
            State::Dreq => &[State::Dres, State::Dwait, State::Dcan],
            State::Dres => &[State::Dack, State::Dcan],
            _ => &[],
        }
    }

    fn has_cos_id(self) -> bool {
        matches!(self, State::Hreq | State::Rreq)
    }

    fn has_data(self) -> bool {
        matches!(self, State::Dreq | State::Dres)
    }

    fn has_offers(self, topology: Topology) -> bool {
        self == State::Hres && topology == Topology::Broadcast
    }

    fn has_src(self, topology: Topology) -> bool {
        topology == Topology::Orchestrator
            && matches!(self, State::Rreq | State::Rres | State::Rack | State::Rcan | State::Dack | State::Dcan)
    }

    fn has_host(self, topology: Topology) -> bool {
        topology == Topology::Orchestrator && matches!(self, State::Hres | State::Dack | State::Dcan)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid protocol state byte: {0}")]
    InvalidState(u8),
    #[error("buffer too short: needed at least {needed} more bytes")]
    Truncated { needed: usize },
    #[error("req_id is not exactly {REQ_ID_LEN} bytes of ASCII")]
    InvalidReqId,
    #[error("fixed-width ASCII field is not valid UTF-8")]
    InvalidAscii(#[from] std::str::Utf8Error),
}

/// A decoded (or to-be-encoded) offload protocol packet. Optional fields
/// are `None` unless `(state, topology)` requires them — see [`State`]'s
/// private `has_*` predicates, which both `encode` and `decode` consult.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub state: State,
    pub req_id: String,
    pub attempt_no: u32,
    pub cos_id: Option<u32>,
    pub data: Option<Bytes>,
    pub cpu_offer: Option<f64>,
    pub ram_offer: Option<f64>,
    pub disk_offer: Option<f64>,
    pub src_mac: Option<String>,
    pub src_ip: Option<String>,
    pub host_mac: Option<String>,
    pub host_ip: Option<String>,
}

impl Packet {
    pub fn new(state: State, req_id: impl Into<String>, attempt_no: u32) -> Self {
        Self {
            state,
            req_id: req_id.into(),
            attempt_no,
            cos_id: None,
            data: None,
            cpu_offer: None,
            ram_offer: None,
            disk_offer: None,
            src_mac: None,
            src_ip: None,
            host_mac: None,
            host_ip: None,
        }
    }

    pub fn encode(&self, topology: Topology) -> Result<Bytes, CodecError> {
        if self.req_id.len() != REQ_ID_LEN || !self.req_id.is_ascii() {
            return Err(CodecError::InvalidReqId);
        }
        let mut buf = BytesMut::new();
        buf.put_u8(self.state as u8);
        buf.put_slice(self.req_id.as_bytes());
        buf.put_u32(self.attempt_no);

        if self.state.has_cos_id() {
            buf.put_u32(self.cos_id.unwrap_or(1));
        }
        if self.state.has_data() {
            buf.put_slice(self.data.as_deref().unwrap_or(&[]));
            // data is always the last field for any state that carries it.
            return Ok(buf.freeze());
        }
        if self.state.has_offers(topology) {
            buf.put_f64(self.cpu_offer.unwrap_or(0.0));
            buf.put_f64(self.ram_offer.unwrap_or(0.0));
            buf.put_f64(self.disk_offer.unwrap_or(0.0));
        }
        if self.state.has_src(topology) {
            put_fixed_ascii(&mut buf, self.src_mac.as_deref().unwrap_or(""), MAC_LEN);
            put_fixed_ascii(&mut buf, self.src_ip.as_deref().unwrap_or(""), IP_LEN);
        }
        if self.state.has_host(topology) {
            put_fixed_ascii(&mut buf, self.host_mac.as_deref().unwrap_or(""), MAC_LEN);
            put_fixed_ascii(&mut buf, self.host_ip.as_deref().unwrap_or(""), IP_LEN);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: Bytes, topology: Topology) -> Result<Self, CodecError> {
        if bytes.len() < 1 + REQ_ID_LEN + 4 {
            return Err(CodecError::Truncated { needed: 1 + REQ_ID_LEN + 4 - bytes.len() });
        }
        let state = State::from_u8(bytes.get_u8())?;
        let req_id_bytes = bytes.split_to(REQ_ID_LEN);
        let req_id = std::str::from_utf8(&req_id_bytes)?.to_string();
        let attempt_no = bytes.get_u32();

        let mut pkt = Packet::new(state, req_id, attempt_no);

        if state.has_cos_id() {
            require(&bytes, 4)?;
            pkt.cos_id = Some(bytes.get_u32());
        }
        if state.has_data() {
            pkt.data = Some(bytes);
            return Ok(pkt);
        }
        if state.has_offers(topology) {
            require(&bytes, 24)?;
            pkt.cpu_offer = Some(bytes.get_f64());
            pkt.ram_offer = Some(bytes.get_f64());
            pkt.disk_offer = Some(bytes.get_f64());
        }
        if state.has_src(topology) {
            pkt.src_mac = Some(get_fixed_ascii(&mut bytes, MAC_LEN)?);
            pkt.src_ip = Some(get_fixed_ascii(&mut bytes, IP_LEN)?);
        }
        if state.has_host(topology) {
            pkt.host_mac = Some(get_fixed_ascii(&mut bytes, MAC_LEN)?);
            pkt.host_ip = Some(get_fixed_ascii(&mut bytes, IP_LEN)?);
        }
        Ok(pkt)
    }
}

fn require(buf: &Bytes, n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        Err(CodecError::Truncated { needed: n - buf.len() })
    } else {
        Ok(())
    }
}

fn put_fixed_ascii(buf: &mut BytesMut, value: &str, width: usize) {
    let mut padded = value.as_bytes().to_vec();
    padded.resize(width, b' ');
    buf.put_slice(&padded[..width]);
}

fn get_fixed_ascii(buf: &mut Bytes, width: usize) -> Result<String, CodecError> {
    require(buf, width)?;
    let raw = buf.split_to(width);
    Ok(std::str::from_utf8(&raw)?.trim_end().to_string())
}

/// Does `reply` legally answer `original`, per req_id correlation and the
/// allowed-reply table?
pub fn answers(original: &Packet, reply: &Packet) -> bool {
    original.req_id == reply.req_id && original.state.expects().contains(&reply.state)
}

/// Inbound packet acceptance rule: non-empty req_id, and
/// not from ourselves or an unspecified address.
pub fn accept_inbound(packet: &Packet, source: IpAddr, local: IpAddr) -> bool {
    !packet.req_id.is_empty() && source != local && !source.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hreq_roundtrips_in_both_topologies() {
        for topology in [Topology::Broadcast, Topology::Orchestrator] {
            let mut p = Packet::new(State::Hreq, "abcdefghij", 1);
            p.cos_id = Some(3);
            let bytes = p.encode(topology).unwrap();
            let decoded = Packet::decode(bytes, topology).unwrap();
            assert_eq!(decoded, p);
        }
    }

    #[test]
    fn hres_broadcast_carries_offers() {
        let mut p = Packet::new(State::Hres, "abcdefghij", 1);
        p.cpu_offer = Some(2.5);
        p.ram_offer = Some(1024.0);
        p.disk_offer = Some(10.0);
        let bytes = p.encode(Topology::Broadcast).unwrap();
        let decoded = Packet::decode(bytes, Topology::Broadcast).unwrap();
        assert_eq!(decoded.cpu_offer, Some(2.5));
        assert_eq!(decoded.host_mac, None);
    }

    #[test]
    fn hres_orchestrator_carries_host_mac_ip() {
        let mut p = Packet::new(State::Hres, "abcdefghij", 1);
        p.host_mac = Some("aa:bb:cc:dd:ee:ff".into());
        p.host_ip = Some("10.0.0.5".into());
        let bytes = p.encode(Topology::Orchestrator).unwrap();
        let decoded = Packet::decode(bytes, Topology::Orchestrator).unwrap();
        assert_eq!(decoded.host_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(decoded.cpu_offer, None);
    }

    #[test]
    fn dreq_data_is_not_length_prefixed_but_consumes_remainder() {
        let mut p = Packet::new(State::Dreq, "abcdefghij", 2);
        p.data = Some(Bytes::from_static(b"hello world"));
        let bytes = p.encode(Topology::Orchestrator).unwrap();
        let decoded = Packet::decode(bytes, Topology::Orchestrator).unwrap();
        assert_eq!(decoded.data.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn encoding_then_decoding_is_bit_identical_except_padding() {
        let mut p = Packet::new(State::Dack, "zzzzzzzzzz", 4);
        p.src_mac = Some("11:22:33:44:55:66".into());
        p.src_ip = Some("192.168.0.1".into()); // shorter than IP_LEN, gets space-padded
        p.host_mac = Some("aa:bb:cc:dd:ee:ff".into());
        p.host_ip = Some("10.0.0.5".into());
        let bytes = p.encode(Topology::Orchestrator).unwrap();
        let decoded = Packet::decode(bytes, Topology::Orchestrator).unwrap();
        assert_eq!(decoded.src_ip.as_deref(), Some("192.168.0.1"));
        assert_eq!(decoded, p);
    }

    #[test]
    fn allowed_reply_table_matches_spec() {
        assert_eq!(State::Hreq.expects(), &[State::Hres]);
        assert_eq!(State::Rreq.expects(), &[State::Rres, State::Rcan]);
        assert_eq!(State::Rres.expects(), &[State::Dreq, State::Rack, State::Rcan]);
        assert_eq!(State::Dreq.expects(), &[State::Dres, State::Dwait, State::Dcan]);
        assert_eq!(State::Dres.expects(), &[State::Dack, State::Dcan]);
    }

    #[test]
    fn answers_checks_req_id_and_state_pair() {
        let hreq = Packet::new(State::Hreq, "abcdefghij", 1);
        let hres_same = Packet::new(State::Hres, "abcdefghij", 1);
        let hres_other = Packet::new(State::Hres, "jihgfedcba", 1);
        assert!(answers(&hreq, &hres_same));
        assert!(!answers(&hreq, &hres_other));
    }

    #[test]
    fn accept_inbound_rejects_self_and_unspecified() {
        let p = Packet::new(State::Hreq, "abcdefghij", 1);
        let local: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!accept_inbound(&p, local, local));
        assert!(!accept_inbound(&p, "0.0.0.0".parse().unwrap(), local));
        assert!(accept_inbound(&p, "10.0.0.2".parse().unwrap(), local));
    }

    #[test]
    fn accept_inbound_rejects_empty_req_id() {
        let p = Packet::new(State::Hreq, "", 1); // not REQ_ID_LEN but accept rule only checks emptiness
        let local: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!accept_inbound(&p, "10.0.0.2".parse().unwrap(), local));
    }
}
