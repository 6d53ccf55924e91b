//! ICE candidates and the STUN messages used to gather and check them.
//!
//! Implements the subset of RFC 5389 (STUN) and RFC 8445 (ICE) the UDP
//! transport needs:
//! 1. Parse and format `candidate:` lines
//! 2. Binding requests, with USERNAME/PRIORITY/ICE-CONTROLL(ED|ING),
//!    MESSAGE-INTEGRITY and FINGERPRINT for connectivity checks
//! 3. Binding success responses carrying XOR-MAPPED-ADDRESS
//! 4. Host candidate discovery and `stun:` URL handling

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::transport::TransportError;

type HmacSha1 = Hmac<Sha1>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_FINGERPRINT: u16 = 0x8028;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const STUN_HEADER_SIZE: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354554e;

/// Port assumed for `stun:` URLs without one.
pub const DEFAULT_STUN_PORT: u16 = 3478;

// ---------------------------------------------------------------------------
// CRC-32 (IEEE) for the FINGERPRINT attribute
// ---------------------------------------------------------------------------

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFFFFFFu32, |crc, &byte| {
        (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize]
    })
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    // HMAC takes keys of any length; the error arm is unreachable.
    if let Ok(mut mac) = HmacSha1::new_from_slice(key) {
        mac.update(data);
        out.copy_from_slice(&mac.finalize().into_bytes()[..20]);
    }
    out
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn as_str(self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    /// RFC 8445 §5.1.2.2 recommended type preference.
    fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

/// One `candidate:` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    /// Lowercased transport, `udp` or `tcp`.
    pub protocol: String,
    pub priority: u32,
    /// IP literal, or an mDNS hostname from privacy-preserving browsers.
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
    pub related: Option<(String, u16)>,
}

/// RFC 8445 §5.1.2.1 candidate priority.
pub fn compute_priority(kind: CandidateType, local_preference: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

impl Candidate {
    pub fn new(kind: CandidateType, addr: SocketAddr, related: Option<SocketAddr>) -> Self {
        let foundation = match kind {
            CandidateType::Host => "1",
            CandidateType::ServerReflexive => "2",
            CandidateType::PeerReflexive => "3",
            CandidateType::Relay => "4",
        };
        Self {
            foundation: foundation.into(),
            component: 1,
            protocol: "udp".into(),
            priority: compute_priority(kind, 65535, 1),
            address: addr.ip().to_string(),
            port: addr.port(),
            kind,
            related: related.map(|r| (r.ip().to_string(), r.port())),
        }
    }

    /// Parse `candidate:…`, with or without a leading `a=`.
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let line = line.trim();
        let bad = |why: &str| TransportError::InvalidCandidate(format!("{}: {}", why, line));

        let content = line
            .strip_prefix("a=")
            .unwrap_or(line)
            .strip_prefix("candidate:")
            .ok_or_else(|| bad("not a candidate line"))?;

        let parts: Vec<&str> = content.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(bad("too few fields"));
        }
        if parts[6] != "typ" {
            return Err(bad("expected 'typ'"));
        }

        let component = parts[1].parse().map_err(|_| bad("bad component"))?;
        let protocol = parts[2].to_ascii_lowercase();
        let priority = parts[3].parse().map_err(|_| bad("bad priority"))?;
        let port = parts[5].parse().map_err(|_| bad("bad port"))?;
        let kind = match parts[7] {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "prflx" => CandidateType::PeerReflexive,
            "relay" => CandidateType::Relay,
            _ => return Err(bad("unknown candidate type")),
        };

        let mut raddr = None;
        let mut rport = None;
        let mut rest = parts[8..].iter();
        while let Some(key) = rest.next() {
            match *key {
                "raddr" => raddr = rest.next().map(|s| s.to_string()),
                "rport" => rport = rest.next().and_then(|s| s.parse().ok()),
                // generation, ufrag, network-id, tcptype ...
                _ => {
                    rest.next();
                }
            }
        }

        Ok(Self {
            foundation: parts[0].to_string(),
            component,
            protocol,
            priority,
            address: parts[4].to_string(),
            port,
            kind,
            related: raddr.zip(rport),
        })
    }

    /// The candidate's address, if it is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.address.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Usable by a single-component UDP transport.
    pub fn is_udp_rtp(&self) -> bool {
        self.protocol == "udp" && self.component == 1
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind.as_str()
        )?;
        if let Some((addr, port)) = &self.related {
            write!(f, " raddr {} rport {}", addr, port)?;
        }
        Ok(())
    }
}

/// Host candidates for a socket bound to `local_addr`.
///
/// For a wildcard bind, the interface the OS would route public traffic
/// through is used (found by connecting a throwaway UDP socket; nothing is
/// sent).
pub fn host_candidates(local_addr: SocketAddr) -> Vec<Candidate> {
    if !local_addr.ip().is_unspecified() {
        return vec![Candidate::new(CandidateType::Host, local_addr, None)];
    }

    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|_| s))
        .and_then(|s| s.local_addr());
    match probe {
        Ok(addr) => vec![Candidate::new(
            CandidateType::Host,
            SocketAddr::new(addr.ip(), local_addr.port()),
            None,
        )],
        Err(e) => {
            tracing::debug!("No routable interface found: {}", e);
            vec![Candidate::new(
                CandidateType::Host,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port()),
                None,
            )]
        }
    }
}

/// `host:port` of a `stun:`/`stuns:` URL; `None` for TURN and other schemes.
pub fn stun_host(url: &str) -> Option<String> {
    let rest = url.strip_prefix("stun:")?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    let has_port = match rest.rfind(']') {
        Some(bracket) => rest[bracket..].contains(':'),
        None => rest.contains(':'),
    };
    Some(if has_port {
        rest.to_string()
    } else {
        format!("{}:{}", rest, DEFAULT_STUN_PORT)
    })
}

// ---------------------------------------------------------------------------
// STUN messages
// ---------------------------------------------------------------------------

pub type TransactionId = [u8; 12];

pub fn generate_transaction_id() -> TransactionId {
    let id = uuid::Uuid::new_v4();
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&id.as_bytes()[..12]);
    txn
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    Request,
    Success,
    Error,
}

/// ICE attributes of a connectivity check.
#[derive(Debug, Clone)]
pub struct CheckParams<'a> {
    /// `{remote_ufrag}:{local_ufrag}`
    pub username: &'a str,
    /// The peer's ICE password.
    pub key: &'a [u8],
    pub priority: u32,
    pub controlling: bool,
    pub tie_breaker: u64,
}

/// A decoded binding message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub class: StunClass,
    pub transaction_id: TransactionId,
    pub username: Option<String>,
    pub mapped_address: Option<SocketAddr>,
    pub priority: Option<u32>,
    pub use_candidate: bool,
    /// Set when the sender claimed the controlling role.
    pub controlling: Option<bool>,
    pub has_integrity: bool,
}

struct Builder {
    buf: Vec<u8>,
}

impl Builder {
    fn new(msg_type: u16, txn: &TransactionId) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(txn);
        Self { buf }
    }

    fn attr(&mut self, attr_type: u16, value: &[u8]) {
        self.buf.extend_from_slice(&attr_type.to_be_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        let pad = (4 - value.len() % 4) % 4;
        self.buf.extend(std::iter::repeat(0).take(pad));
    }

    /// Header length as it will be once an attribute of `extra` bytes
    /// (header included) is appended.
    fn set_length(&mut self, extra: usize) {
        let len = (self.buf.len() - STUN_HEADER_SIZE + extra) as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    /// Append MESSAGE-INTEGRITY and FINGERPRINT.
    fn finish_with_integrity(mut self, key: &[u8]) -> Vec<u8> {
        self.set_length(24);
        let mac = hmac_sha1(key, &self.buf);
        self.attr(ATTR_MESSAGE_INTEGRITY, &mac);

        self.set_length(8);
        let fingerprint = crc32(&self.buf) ^ FINGERPRINT_XOR;
        self.attr(ATTR_FINGERPRINT, &fingerprint.to_be_bytes());
        self.buf
    }

    fn finish(mut self) -> Vec<u8> {
        self.set_length(0);
        self.buf
    }
}

/// Plain binding request, as sent to a STUN server.
pub fn binding_request(txn: &TransactionId) -> Vec<u8> {
    Builder::new(BINDING_REQUEST, txn).finish()
}

/// Binding request for an ICE connectivity check.
pub fn check_request(txn: &TransactionId, params: &CheckParams<'_>) -> Vec<u8> {
    let mut b = Builder::new(BINDING_REQUEST, txn);
    b.attr(ATTR_USERNAME, params.username.as_bytes());
    b.attr(ATTR_PRIORITY, &params.priority.to_be_bytes());
    if params.controlling {
        b.attr(ATTR_ICE_CONTROLLING, &params.tie_breaker.to_be_bytes());
        // Aggressive nomination.
        b.attr(ATTR_USE_CANDIDATE, &[]);
    } else {
        b.attr(ATTR_ICE_CONTROLLED, &params.tie_breaker.to_be_bytes());
    }
    b.finish_with_integrity(params.key)
}

/// Binding success telling the requester how we saw it.
pub fn binding_success(txn: &TransactionId, mapped: SocketAddr, key: Option<&[u8]>) -> Vec<u8> {
    let mut b = Builder::new(BINDING_SUCCESS, txn);
    b.attr(ATTR_XOR_MAPPED_ADDRESS, &encode_xor_address(mapped, txn));
    match key {
        Some(key) => b.finish_with_integrity(key),
        None => b.finish(),
    }
}

/// Quick check for demultiplexing: STUN vs. anything else on the socket.
pub fn is_stun(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE
        && data[0] & 0xC0 == 0
        && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
}

impl StunMessage {
    /// Decode a binding message. Other STUN methods and garbage give `None`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if !is_stun(data) {
            return None;
        }
        let class = match u16::from_be_bytes([data[0], data[1]]) {
            BINDING_REQUEST => StunClass::Request,
            BINDING_SUCCESS => StunClass::Success,
            BINDING_ERROR => StunClass::Error,
            _ => return None,
        };
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut msg = StunMessage {
            class,
            transaction_id,
            username: None,
            mapped_address: None,
            priority: None,
            use_candidate: false,
            controlling: None,
            has_integrity: false,
        };

        for (attr_type, _, value) in attributes(data) {
            match attr_type {
                ATTR_USERNAME => msg.username = String::from_utf8(value.to_vec()).ok(),
                ATTR_XOR_MAPPED_ADDRESS => {
                    msg.mapped_address = decode_xor_address(value, &transaction_id)
                }
                ATTR_MAPPED_ADDRESS if msg.mapped_address.is_none() => {
                    msg.mapped_address = decode_plain_address(value)
                }
                ATTR_PRIORITY if value.len() == 4 => {
                    msg.priority = Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
                }
                ATTR_USE_CANDIDATE => msg.use_candidate = true,
                ATTR_ICE_CONTROLLING => msg.controlling = Some(true),
                ATTR_ICE_CONTROLLED => msg.controlling = Some(false),
                ATTR_MESSAGE_INTEGRITY => msg.has_integrity = true,
                _ => {}
            }
        }
        Some(msg)
    }
}

/// Iterate `(type, offset, value)` over the attributes of a STUN message.
fn attributes(data: &[u8]) -> impl Iterator<Item = (u16, usize, &[u8])> {
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (STUN_HEADER_SIZE + msg_len).min(data.len());
    let mut pos = STUN_HEADER_SIZE;
    std::iter::from_fn(move || {
        if pos + 4 > end {
            return None;
        }
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        if start + attr_len > end {
            return None;
        }
        let item = (attr_type, pos, &data[start..start + attr_len]);
        pos = start + ((attr_len + 3) & !3);
        Some(item)
    })
}

/// Check MESSAGE-INTEGRITY of `data` against `key`.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> bool {
    if !is_stun(data) {
        return false;
    }
    for (attr_type, offset, value) in attributes(data) {
        if attr_type == ATTR_MESSAGE_INTEGRITY && value.len() == 20 {
            let mut signed = data[..offset].to_vec();
            let len = (offset - STUN_HEADER_SIZE + 24) as u16;
            signed[2..4].copy_from_slice(&len.to_be_bytes());
            return hmac_sha1(key, &signed) == value;
        }
    }
    false
}

/// Check the FINGERPRINT attribute, if present. Messages without one pass.
pub fn verify_fingerprint(data: &[u8]) -> bool {
    for (attr_type, offset, value) in attributes(data) {
        if attr_type == ATTR_FINGERPRINT && value.len() == 4 {
            let expected = crc32(&data[..offset]) ^ FINGERPRINT_XOR;
            return u32::from_be_bytes([value[0], value[1], value[2], value[3]]) == expected;
        }
    }
    true
}

fn encode_xor_address(addr: SocketAddr, txn: &TransactionId) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut val = vec![0];
    match addr.ip() {
        IpAddr::V4(ip) => {
            val.push(0x01);
            val.extend_from_slice(&xport.to_be_bytes());
            val.extend(ip.octets().iter().zip(cookie.iter()).map(|(a, b)| a ^ b));
        }
        IpAddr::V6(ip) => {
            val.push(0x02);
            val.extend_from_slice(&xport.to_be_bytes());
            let key = cookie.iter().chain(txn.iter());
            val.extend(ip.octets().iter().zip(key).map(|(a, b)| a ^ b));
        }
    }
    val
}

fn decode_xor_address(value: &[u8], txn: &TransactionId) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 if value.len() >= 8 => {
            let mut octets = [0u8; 4];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ cookie[i];
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let key: Vec<u8> = cookie.iter().chain(txn.iter()).copied().collect();
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate() {
                *o = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn decode_plain_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}
