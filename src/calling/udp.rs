//! Peer transport over a single UDP socket.
//!
//! Negotiates a path with real ICE: host and server-reflexive candidates
//! are gathered when the local description is set, the peer's STUN checks
//! are answered, and our own checks run against the peer's candidates in
//! priority order (the offerer is controlling). Once a pair works, consent
//! is refreshed every few seconds; missed refreshes mark the path
//! `disconnected`, and a long silence marks it `failed`.
//!
//! Only the path is negotiated. Codec and SRTP payload handling are not
//! part of this transport, so the remote stream is described by the remote
//! description's m-lines.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::ice::{
    self, Candidate, CandidateType, CheckParams, StunClass, StunMessage, TransactionId,
};
use super::media::{MediaStream, MediaTrack, TrackKind, TrackSource};
use super::sdp::{self, ParsedSdp};
use super::transport::{
    IceCandidateInit, PeerTransport, RtcConfig, SdpType, SessionDescription, TransportError,
    TransportEvent, TransportFactory, TransportHandle,
};
use super::ConnectionState;

/// Agent housekeeping period.
const TICK: Duration = Duration::from_millis(100);
/// How long a STUN transaction may stay unanswered.
const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(500);
/// Connectivity check attempts per remote candidate.
const CHECK_MAX_ATTEMPTS: u32 = 8;
pub const CONSENT_INTERVAL: Duration = Duration::from_secs(5);
/// Unanswered consent checks before the path counts as disconnected.
pub const CONSENT_MAX_MISSED: u32 = 3;
/// Silence after which the path counts as failed.
pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds [`UdpTransport`]s bound to one local address.
#[derive(Debug, Clone, Copy)]
pub struct UdpTransportFactory {
    bind_ip: IpAddr,
}

impl Default for UdpTransportFactory {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl UdpTransportFactory {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn create(&self, config: &RtcConfig) -> Result<TransportHandle, TransportError> {
        let stun_servers = config
            .ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .filter_map(|u| ice::stun_host(u))
            .collect();
        let (transport, events) = UdpTransport::bind(self.bind_ip, stun_servers).await?;
        Ok(TransportHandle {
            transport: Arc::new(transport),
            events,
        })
    }
}

#[derive(Debug, Clone)]
struct IceCredentials {
    ufrag: String,
    pwd: String,
}

enum Command {
    /// Local description set: start gathering in the given role.
    Gather { controlling: bool },
    RemoteCredentials(IceCredentials),
    AddCandidate { addr: SocketAddr, priority: u32 },
    Close,
}

struct Shared {
    state: ConnectionState,
    tracks: Vec<MediaTrack>,
    outbound_video: Option<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<(SdpType, ParsedSdp)>,
}

fn lock(shared: &Mutex<Shared>) -> std::sync::MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Apply a state change if legal and report it.
fn transition(
    shared: &Mutex<Shared>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    next: ConnectionState,
) -> bool {
    {
        let mut st = lock(shared);
        if !st.state.can_transition_to(next) {
            return false;
        }
        st.state = next;
    }
    tracing::debug!("UDP transport -> {}", next);
    let _ = events.send(TransportEvent::StateChanged(next));
    true
}

/// A UDP peer transport. The socket is owned by a background agent task.
pub struct UdpTransport {
    creds: IceCredentials,
    session_id: u64,
    local_addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedSender<Command>,
    agent: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind a socket on `ip` (ephemeral port) and start the agent.
    pub async fn bind(
        ip: IpAddr,
        stun_servers: Vec<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        let creds = IceCredentials {
            ufrag: sdp::generate_ice_ufrag()?,
            pwd: sdp::generate_ice_pwd()?,
        };
        tracing::info!("UDP transport bound to {} (ufrag {})", local_addr, creds.ufrag);

        let (events, events_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::New,
            tracks: Vec::new(),
            outbound_video: None,
            local: None,
            remote: None,
        }));

        let agent = Agent::new(
            socket,
            creds.clone(),
            stun_servers,
            shared.clone(),
            events.clone(),
            commands_rx,
        );
        let agent = tokio::spawn(agent.run());

        let session_id = {
            let b = uuid::Uuid::new_v4().into_bytes();
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) >> 2
        };
        Ok((
            Self {
                creds,
                session_id,
                local_addr,
                shared,
                events,
                commands,
                agent,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ufrag(&self) -> &str {
        &self.creds.ufrag
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if lock(&self.shared).state == ConnectionState::Closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn describe(&self, sdp_type: SdpType, media: &[sdp::MediaLine]) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: sdp::build(self.session_id, &self.creds.ufrag, &self.creds.pwd, media),
        }
    }

    fn command(&self, cmd: Command) -> Result<(), TransportError> {
        self.commands.send(cmd).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl PeerTransport for UdpTransport {
    fn add_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut st = lock(&self.shared);
        if track.kind() == TrackKind::Video && st.outbound_video.is_none() {
            st.outbound_video = Some(track.clone());
        }
        st.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let kinds: Vec<TrackKind> = lock(&self.shared).tracks.iter().map(|t| t.kind()).collect();
        Ok(self.describe(SdpType::Offer, &sdp::offer_media(&kinds)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let media = {
            let st = lock(&self.shared);
            let Some((SdpType::Offer, offer)) = &st.remote else {
                return Err(TransportError::InvalidState(
                    "cannot answer without a remote offer".into(),
                ));
            };
            let kinds: Vec<TrackKind> = st.tracks.iter().map(|t| t.kind()).collect();
            sdp::answer_media(offer, &kinds)
        };
        Ok(self.describe(SdpType::Answer, &media))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let parsed = sdp::parse(&desc.sdp)?;
        if parsed.ice_ufrag != self.creds.ufrag {
            return Err(TransportError::InvalidDescription(
                "local description has foreign ICE credentials".into(),
            ));
        }
        let controlling = desc.sdp_type == SdpType::Offer;
        {
            let mut st = lock(&self.shared);
            if st.local.is_some() {
                return Err(TransportError::InvalidState("local description already set".into()));
            }
            st.local = Some(desc);
        }
        self.command(Command::Gather { controlling })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let parsed = sdp::parse(&desc.sdp)?;
        let remote_creds = IceCredentials {
            ufrag: parsed.ice_ufrag.clone(),
            pwd: parsed.ice_pwd.clone(),
        };
        let sdp_candidates: Vec<(SocketAddr, u32)> = parsed
            .candidates
            .iter()
            .filter(|c| c.is_udp_rtp())
            .filter_map(|c| c.socket_addr().map(|a| (a, c.priority)))
            .collect();
        let remote_tracks: Vec<MediaTrack> = parsed
            .sent_kinds()
            .into_iter()
            .map(|kind| MediaTrack::new(kind, TrackSource::Remote, format!("remote {}", kind)))
            .collect();
        {
            let mut st = lock(&self.shared);
            if st.remote.is_some() {
                return Err(TransportError::InvalidState("remote description already set".into()));
            }
            if desc.sdp_type == SdpType::Answer && st.local.is_none() {
                return Err(TransportError::InvalidState("answer received without an offer".into()));
            }
            st.remote = Some((desc.sdp_type, parsed));
        }

        self.command(Command::RemoteCredentials(remote_creds))?;
        for (addr, priority) in sdp_candidates {
            self.command(Command::AddCandidate { addr, priority })?;
        }
        if !remote_tracks.is_empty() {
            let _ = self
                .events
                .send(TransportEvent::RemoteStream(MediaStream::new(remote_tracks)));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), TransportError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        let parsed = Candidate::parse(&candidate.candidate)?;
        {
            let st = lock(&self.shared);
            let Some((_, remote)) = &st.remote else {
                return Err(TransportError::InvalidState(
                    "candidate added before the remote description".into(),
                ));
            };
            if let Some(ufrag) = &candidate.username_fragment {
                if *ufrag != remote.ice_ufrag {
                    tracing::debug!("Ignoring candidate for stale ufrag {}", ufrag);
                    return Ok(());
                }
            }
        }
        if !parsed.is_udp_rtp() {
            tracing::debug!("Ignoring non-UDP candidate {}", parsed);
            return Ok(());
        }
        let Some(addr) = parsed.socket_addr() else {
            tracing::debug!("Ignoring unresolvable candidate address {}", parsed.address);
            return Ok(());
        };
        self.command(Command::AddCandidate {
            addr,
            priority: parsed.priority,
        })
    }

    fn replace_video_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        if track.kind() != TrackKind::Video {
            return Err(TransportError::InvalidState("not a video track".into()));
        }
        lock(&self.shared).outbound_video = Some(track);
        Ok(())
    }

    fn outbound_video_track(&self) -> Option<MediaTrack> {
        lock(&self.shared).outbound_video.clone()
    }

    fn close(&self) {
        if !transition(&self.shared, &self.events, ConnectionState::Closed) {
            return;
        }
        let _ = self.commands.send(Command::Close);
        self.agent.abort();
        tracing::info!("UDP transport {} closed", self.local_addr);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Consent freshness (RFC 7675)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Consent {
    Fresh,
    /// Too many refreshes went unanswered.
    Lost,
    /// No refresh answered for [`CONSENT_TIMEOUT`].
    Expired,
}

#[derive(Debug)]
struct ConsentTracker {
    last_ok: Instant,
    missed: u32,
    outstanding: Option<TransactionId>,
}

impl ConsentTracker {
    fn new(now: Instant) -> Self {
        Self {
            last_ok: now,
            missed: 0,
            outstanding: None,
        }
    }

    /// Account for the previous refresh and judge the path. Called once per
    /// interval, before the next refresh is sent.
    fn on_interval(&mut self, now: Instant) -> Consent {
        if self.outstanding.take().is_some() {
            self.missed += 1;
        }
        if now.duration_since(self.last_ok) >= CONSENT_TIMEOUT {
            Consent::Expired
        } else if self.missed >= CONSENT_MAX_MISSED {
            Consent::Lost
        } else {
            Consent::Fresh
        }
    }

    fn sent(&mut self, txn: TransactionId) {
        self.outstanding = Some(txn);
    }

    fn confirmed(&mut self, now: Instant) {
        self.last_ok = now;
        self.missed = 0;
        self.outstanding = None;
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Purpose {
    Gather,
    Check(SocketAddr),
    Consent,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    purpose: Purpose,
    sent: Instant,
}

struct RemoteCandidate {
    addr: SocketAddr,
    priority: u32,
    attempts: u32,
}

struct Agent {
    socket: UdpSocket,
    local: IceCredentials,
    remote: Option<IceCredentials>,
    controlling: bool,
    tie_breaker: u64,
    stun_servers: Vec<String>,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: HashMap<TransactionId, Pending>,
    host: Vec<SocketAddr>,
    candidates: Vec<RemoteCandidate>,
    selected: Option<SocketAddr>,
    consent: ConsentTracker,
    next_consent: Instant,
    gave_up: bool,
}

impl Agent {
    fn new(
        socket: UdpSocket,
        local: IceCredentials,
        stun_servers: Vec<String>,
        shared: Arc<Mutex<Shared>>,
        events: mpsc::UnboundedSender<TransportEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let tie_breaker = {
            let id = uuid::Uuid::new_v4();
            let b = id.as_bytes();
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        };
        let now = Instant::now();
        Self {
            socket,
            local,
            remote: None,
            controlling: false,
            tie_breaker,
            stun_servers,
            shared,
            events,
            commands,
            pending: HashMap::new(),
            host: Vec::new(),
            candidates: Vec::new(),
            selected: None,
            consent: ConsentTracker::new(now),
            next_consent: now,
            gave_up: false,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 1500];

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, from)) => self.handle_packet(&buf[..len], from).await,
                    // ICMP port-unreachable surfaces here on some platforms.
                    Err(e) => tracing::debug!("UDP recv error: {}", e),
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }
        tracing::debug!("ICE agent for {} stopped", self.local.ufrag);
    }

    fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        transition(&self.shared, &self.events, next)
    }

    async fn send(&self, data: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, to).await {
            tracing::debug!("UDP send to {} failed: {}", to, e);
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Gather { controlling } => {
                self.controlling = controlling;
                self.gather().await;
            }
            Command::RemoteCredentials(creds) => {
                tracing::debug!("Remote ICE ufrag {}", creds.ufrag);
                self.remote = Some(creds);
            }
            Command::AddCandidate { addr, priority } => self.add_candidate(addr, priority),
            Command::Close => {}
        }
    }

    fn add_candidate(&mut self, addr: SocketAddr, priority: u32) {
        if self.candidates.iter().any(|c| c.addr == addr) {
            return;
        }
        tracing::debug!("Remote candidate {} (priority {})", addr, priority);
        self.candidates.push(RemoteCandidate {
            addr,
            priority,
            attempts: 0,
        });
        self.candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn emit_local(&self, candidate: &Candidate) {
        tracing::debug!("Local candidate {}", candidate);
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidateInit::new(
            candidate.to_string(),
            Some(self.local.ufrag.clone()),
        )));
    }

    async fn gather(&mut self) {
        let local_addr = match self.socket.local_addr() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("Cannot read local socket address: {}", e);
                return;
            }
        };
        for c in ice::host_candidates(local_addr) {
            if let Some(addr) = c.socket_addr() {
                self.host.push(addr);
            }
            self.emit_local(&c);
        }

        for server in self.stun_servers.clone() {
            let addr = match tokio::net::lookup_host(server.as_str()).await {
                Ok(mut addrs) => addrs.find(|a| a.is_ipv4() == local_addr.is_ipv4()),
                Err(e) => {
                    tracing::debug!("Cannot resolve STUN server {}: {}", server, e);
                    None
                }
            };
            let Some(addr) = addr else { continue };
            let txn = ice::generate_transaction_id();
            self.pending.insert(
                txn,
                Pending {
                    purpose: Purpose::Gather,
                    sent: Instant::now(),
                },
            );
            self.send(&ice::binding_request(&txn), addr).await;
        }
    }

    async fn send_check(&mut self, to: SocketAddr, purpose: Purpose) -> Option<TransactionId> {
        let remote = self.remote.as_ref()?;
        let username = format!("{}:{}", remote.ufrag, self.local.ufrag);
        let txn = ice::generate_transaction_id();
        let request = ice::check_request(
            &txn,
            &CheckParams {
                username: &username,
                key: remote.pwd.as_bytes(),
                priority: ice::compute_priority(CandidateType::PeerReflexive, 65535, 1),
                controlling: self.controlling,
                tie_breaker: self.tie_breaker,
            },
        );
        self.pending.insert(
            txn,
            Pending {
                purpose,
                sent: Instant::now(),
            },
        );
        self.send(&request, to).await;
        Some(txn)
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.pending
            .retain(|_, p| now.duration_since(p.sent) < TRANSACTION_TIMEOUT);

        if self.gave_up || self.state().is_terminal() {
            return;
        }
        let selected = self.selected;
        match selected {
            None => self.run_checks().await,
            Some(addr) if now >= self.next_consent => self.refresh_consent(addr, now).await,
            Some(_) => {}
        }
    }

    async fn run_checks(&mut self) {
        if self.remote.is_none() || self.candidates.is_empty() {
            return;
        }
        if lock(&self.shared).local.is_none() {
            return;
        }
        if self.state() == ConnectionState::New {
            self.set_state(ConnectionState::Connecting);
        }

        let in_flight: Vec<SocketAddr> = self
            .pending
            .values()
            .filter_map(|p| match p.purpose {
                Purpose::Check(addr) => Some(addr),
                _ => None,
            })
            .collect();

        let due: Vec<SocketAddr> = self
            .candidates
            .iter_mut()
            .filter(|c| c.attempts < CHECK_MAX_ATTEMPTS && !in_flight.contains(&c.addr))
            .map(|c| {
                c.attempts += 1;
                c.addr
            })
            .collect();
        for addr in &due {
            self.send_check(*addr, Purpose::Check(*addr)).await;
        }

        let exhausted = self
            .candidates
            .iter()
            .all(|c| c.attempts >= CHECK_MAX_ATTEMPTS);
        if exhausted && in_flight.is_empty() && due.is_empty() {
            tracing::warn!(
                "ICE checks to {} candidates failed",
                self.candidates.len()
            );
            self.gave_up = true;
            self.set_state(ConnectionState::Failed);
        }
    }

    async fn refresh_consent(&mut self, addr: SocketAddr, now: Instant) {
        match self.consent.on_interval(now) {
            Consent::Fresh => {}
            Consent::Lost => {
                if self.set_state(ConnectionState::Disconnected) {
                    tracing::warn!("Consent from {} lost", addr);
                }
            }
            Consent::Expired => {
                tracing::warn!("No consent from {} for {:?}", addr, CONSENT_TIMEOUT);
                self.gave_up = true;
                self.set_state(ConnectionState::Failed);
                return;
            }
        }
        if let Some(txn) = self.send_check(addr, Purpose::Consent).await {
            self.consent.sent(txn);
        }
        self.next_consent = now + CONSENT_INTERVAL;
    }

    async fn handle_packet(&mut self, data: &[u8], from: SocketAddr) {
        let Some(msg) = StunMessage::decode(data) else {
            tracing::trace!("Ignoring {} non-STUN bytes from {}", data.len(), from);
            return;
        };
        if !ice::verify_fingerprint(data) {
            tracing::debug!("Dropping STUN message from {} with bad FINGERPRINT", from);
            return;
        }
        match msg.class {
            StunClass::Request => self.answer_check(&msg, data, from).await,
            StunClass::Success => self.on_success(&msg, data, from),
            StunClass::Error => {
                self.pending.remove(&msg.transaction_id);
                tracing::debug!("STUN error response from {}", from);
            }
        }
    }

    async fn answer_check(&mut self, msg: &StunMessage, data: &[u8], from: SocketAddr) {
        let prefix = format!("{}:", self.local.ufrag);
        let addressed_to_us = msg
            .username
            .as_deref()
            .map_or(false, |u| u.starts_with(&prefix));
        if !addressed_to_us || !ice::verify_integrity(data, self.local.pwd.as_bytes()) {
            tracing::debug!("Ignoring unauthenticated STUN request from {}", from);
            return;
        }

        let response =
            ice::binding_success(&msg.transaction_id, from, Some(self.local.pwd.as_bytes()));
        self.send(&response, from).await;

        // Peer-reflexive: the peer reached us from an address it never signaled.
        if self.remote.is_some() && !self.candidates.iter().any(|c| c.addr == from) {
            let priority = msg
                .priority
                .unwrap_or_else(|| ice::compute_priority(CandidateType::PeerReflexive, 65535, 1));
            self.add_candidate(from, priority);
        }
    }

    fn on_success(&mut self, msg: &StunMessage, data: &[u8], from: SocketAddr) {
        let Some(pending) = self.pending.remove(&msg.transaction_id) else {
            return;
        };
        match pending.purpose {
            Purpose::Gather => {
                let Some(mapped) = msg.mapped_address else { return };
                if self.host.contains(&mapped) {
                    return;
                }
                let base = self.socket.local_addr().ok();
                let srflx = Candidate::new(CandidateType::ServerReflexive, mapped, base);
                self.emit_local(&srflx);
            }
            Purpose::Check(addr) => {
                if !self.authentic_response(data) || self.selected.is_some() {
                    return;
                }
                tracing::info!(
                    "ICE pair selected: {} (we are seen as {:?})",
                    addr,
                    msg.mapped_address
                );
                let now = Instant::now();
                self.selected = Some(addr);
                self.consent = ConsentTracker::new(now);
                self.next_consent = now + CONSENT_INTERVAL;
                if self.state() == ConnectionState::New {
                    self.set_state(ConnectionState::Connecting);
                }
                self.set_state(ConnectionState::Connected);
            }
            Purpose::Consent => {
                if !self.authentic_response(data) {
                    return;
                }
                tracing::trace!("Consent refreshed by {}", from);
                self.consent.confirmed(Instant::now());
                if self.state() == ConnectionState::Disconnected {
                    tracing::info!("Path to {} recovered", from);
                    self.set_state(ConnectionState::Connected);
                }
            }
        }
    }

    fn authentic_response(&self, data: &[u8]) -> bool {
        self.remote
            .as_ref()
            .map_or(false, |r| ice::verify_integrity(data, r.pwd.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn next_candidate(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> IceCandidateInit {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(TransportEvent::LocalCandidate(c))) => return c,
                Ok(Some(_)) => continue,
                other => panic!("no local candidate: {:?}", other.map(|e| e.is_some())),
            }
        }
    }

    async fn wait_for_state(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        want: ConnectionState,
    ) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Ok(Some(ev)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let TransportEvent::StateChanged(s) = ev {
                seen.push(s);
                if s == want {
                    return seen;
                }
            }
        }
        panic!("never reached {}: saw {:?}", want, seen);
    }

    #[test]
    fn test_consent_tracker() {
        let start = Instant::now();
        let mut consent = ConsentTracker::new(start);

        consent.sent([1; 12]);
        assert_eq!(consent.on_interval(start + CONSENT_INTERVAL), Consent::Fresh);
        consent.sent([2; 12]);
        assert_eq!(consent.on_interval(start + CONSENT_INTERVAL * 2), Consent::Fresh);
        consent.sent([3; 12]);
        assert_eq!(consent.on_interval(start + CONSENT_INTERVAL * 3), Consent::Lost);

        consent.confirmed(start + CONSENT_INTERVAL * 3);
        assert_eq!(consent.on_interval(start + CONSENT_INTERVAL * 4), Consent::Fresh);

        let later = start + CONSENT_INTERVAL * 3 + CONSENT_TIMEOUT;
        assert_eq!(consent.on_interval(later), Consent::Expired);
    }

    #[tokio::test]
    async fn test_two_transports_connect_over_udp() {
        let (a, mut a_rx) = UdpTransport::bind(loopback_ip(), vec![]).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind(loopback_ip(), vec![]).await.unwrap();
        a.add_track(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"))
            .unwrap();
        b.add_track(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"))
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_cand = next_candidate(&mut a_rx).await;
        let b_cand = next_candidate(&mut b_rx).await;
        assert!(a_cand.candidate.contains("127.0.0.1"));
        b.add_ice_candidate(a_cand).await.unwrap();
        a.add_ice_candidate(b_cand).await.unwrap();

        let a_states = wait_for_state(&mut a_rx, ConnectionState::Connected).await;
        assert_eq!(a_states.first(), Some(&ConnectionState::Connecting));
        wait_for_state(&mut b_rx, ConnectionState::Connected).await;

        a.close();
        a.close();
        assert_eq!(a.create_offer().await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn test_unauthenticated_request_gets_no_answer() {
        let (t, _rx) = UdpTransport::bind(loopback_ip(), vec![]).await.unwrap();
        let probe = UdpSocket::bind((loopback_ip(), 0)).await.unwrap();

        let txn = ice::generate_transaction_id();
        let username = format!("{}:intruder", t.ufrag());
        let request = ice::check_request(
            &txn,
            &CheckParams {
                username: &username,
                key: b"not-the-password",
                priority: 1,
                controlling: true,
                tie_breaker: 1,
            },
        );
        probe.send_to(&request, t.local_addr()).await.unwrap();

        let mut buf = [0u8; 512];
        let reply =
            tokio::time::timeout(Duration::from_millis(300), probe.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "unexpected STUN response");
    }

    #[tokio::test]
    async fn test_candidate_needs_remote_description() {
        let (t, _rx) = UdpTransport::bind(loopback_ip(), vec![]).await.unwrap();
        let err = t
            .add_ice_candidate(IceCandidateInit::new(
                "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host",
                None,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }
}
