//! In-process transport.
//!
//! Every transport created from one [`LoopbackNetwork`] can reach every
//! other. Descriptions are real SDP; the ICE ufrag names the endpoint, so
//! a peer knows who it is talking to from the remote description alone.
//! A transport goes `connecting` once it has both descriptions and at
//! least one remote candidate, and then `connected` if the remote endpoint
//! is still open and the network is up, `failed` otherwise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ice::{Candidate, CandidateType};
use super::media::{MediaStream, MediaTrack, TrackKind, TrackSource};
use super::sdp::{self, ParsedSdp};
use super::transport::{
    IceCandidateInit, PeerTransport, RtcConfig, SdpType, SessionDescription, TransportError,
    TransportEvent, TransportFactory, TransportHandle,
};
use super::ConnectionState;

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, Weak<Endpoint>>,
    reachable: bool,
    next_port: u16,
    refuse_create: bool,
}

/// A simulated network shared by loopback transports.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner {
                reachable: true,
                next_port: 40000,
                ..Default::default()
            })),
        }
    }

    /// Drop the path between all endpoints. Connected transports go
    /// `disconnected`.
    pub fn sever(&self) {
        self.lock().reachable = false;
        for ep in self.endpoints() {
            ep.path_changed(false);
        }
    }

    /// Bring the path back. Disconnected transports reconnect.
    pub fn restore(&self) {
        self.lock().reachable = true;
        for ep in self.endpoints() {
            ep.path_changed(true);
        }
    }

    /// Make subsequent `create` calls fail, as a browser does when the
    /// configuration is rejected.
    pub fn refuse_new_transports(&self, refuse: bool) {
        self.lock().refuse_create = refuse;
    }

    fn reachable(&self) -> bool {
        self.lock().reachable
    }

    fn lookup(&self, ufrag: &str) -> Option<Arc<Endpoint>> {
        self.lock().endpoints.get(ufrag).and_then(Weak::upgrade)
    }

    fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut inner = self.lock();
        inner.endpoints.retain(|_, ep| ep.strong_count() > 0);
        inner.endpoints.values().filter_map(Weak::upgrade).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(&self, _config: &RtcConfig) -> Result<TransportHandle, TransportError> {
        let ufrag = sdp::generate_ice_ufrag()?;
        let pwd = sdp::generate_ice_pwd()?;
        let (events, rx) = mpsc::unbounded_channel();

        let port = {
            let mut inner = self.lock();
            if inner.refuse_create {
                return Err(TransportError::InvalidState(
                    "peer connection construction refused".into(),
                ));
            }
            inner.next_port = inner.next_port.wrapping_add(1);
            inner.next_port
        };

        let endpoint = Arc::new(Endpoint {
            ufrag: ufrag.clone(),
            pwd,
            port,
            network: self.clone(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        self.lock()
            .endpoints
            .insert(ufrag.clone(), Arc::downgrade(&endpoint));
        tracing::debug!("Loopback endpoint {} created", ufrag);

        Ok(TransportHandle {
            transport: Arc::new(LoopbackTransport { endpoint }),
            events: rx,
        })
    }
}

struct EndpointState {
    connection: ConnectionState,
    tracks: Vec<MediaTrack>,
    outbound_video: Option<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<(SdpType, ParsedSdp)>,
    remote_candidates: usize,
    ever_connected: bool,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            tracks: Vec::new(),
            outbound_video: None,
            local: None,
            remote: None,
            remote_candidates: 0,
            ever_connected: false,
        }
    }
}

struct Endpoint {
    ufrag: String,
    pwd: String,
    port: u16,
    network: LoopbackNetwork,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn lock(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock().connection == ConnectionState::Closed
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut st = self.lock();
            if !st.connection.can_transition_to(next) {
                return;
            }
            st.connection = next;
            if next == ConnectionState::Connected {
                st.ever_connected = true;
            }
        }
        tracing::debug!("Loopback {} -> {}", self.ufrag, next);
        let _ = self.events.send(TransportEvent::StateChanged(next));
    }

    fn remote_ufrag(&self) -> Option<String> {
        self.lock().remote.as_ref().map(|(_, r)| r.ice_ufrag.clone())
    }

    /// Run the connectivity "check" once every input is present.
    fn try_connect(&self) {
        let ready = {
            let st = self.lock();
            st.connection == ConnectionState::New
                && st.local.is_some()
                && st.remote.is_some()
                && st.remote_candidates > 0
        };
        if !ready {
            return;
        }
        self.set_state(ConnectionState::Connecting);

        let peer_alive = self
            .remote_ufrag()
            .and_then(|u| self.network.lookup(&u))
            .map(|peer| !peer.is_closed())
            .unwrap_or(false);
        if peer_alive && self.network.reachable() {
            self.set_state(ConnectionState::Connected);
        } else {
            self.set_state(ConnectionState::Failed);
        }
    }

    fn path_changed(&self, up: bool) {
        let current = self.lock().connection;
        match (current, up) {
            (ConnectionState::Connected, false) => self.set_state(ConnectionState::Disconnected),
            (ConnectionState::Disconnected, true) => {
                let peer_alive = self
                    .remote_ufrag()
                    .and_then(|u| self.network.lookup(&u))
                    .map(|peer| !peer.is_closed())
                    .unwrap_or(false);
                if peer_alive {
                    self.set_state(ConnectionState::Connected);
                }
            }
            _ => {}
        }
    }

    /// The remote endpoint went away.
    fn peer_closed(&self) {
        if self.lock().connection == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn local_kinds(&self) -> Vec<TrackKind> {
        self.lock().tracks.iter().map(|t| t.kind()).collect()
    }
}

/// One end of a loopback connection.
pub struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.endpoint.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn describe(&self, sdp_type: SdpType, media: &[sdp::MediaLine]) -> SessionDescription {
        let ep = &self.endpoint;
        SessionDescription {
            sdp_type,
            sdp: sdp::build(ep.port as u64, &ep.ufrag, &ep.pwd, media),
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn add_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut st = self.endpoint.lock();
        if track.kind() == TrackKind::Video && st.outbound_video.is_none() {
            st.outbound_video = Some(track.clone());
        }
        st.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let media = sdp::offer_media(&self.endpoint.local_kinds());
        Ok(self.describe(SdpType::Offer, &media))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let media = {
            let st = self.endpoint.lock();
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
        if parsed.ice_ufrag != self.endpoint.ufrag {
            return Err(TransportError::InvalidDescription(
                "local description has foreign ICE credentials".into(),
            ));
        }
        {
            let mut st = self.endpoint.lock();
            if st.local.is_some() {
                return Err(TransportError::InvalidState("local description already set".into()));
            }
            st.local = Some(desc);
        }

        let ep = &self.endpoint;
        let host = Candidate::new(
            CandidateType::Host,
            ([127, 0, 0, 1], ep.port).into(),
            None,
        );
        let _ = ep.events.send(TransportEvent::LocalCandidate(IceCandidateInit::new(
            host.to_string(),
            Some(ep.ufrag.clone()),
        )));
        ep.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let parsed = sdp::parse(&desc.sdp)?;
        let remote_tracks: Vec<MediaTrack> = parsed
            .sent_kinds()
            .into_iter()
            .map(|kind| MediaTrack::new(kind, TrackSource::Remote, format!("remote {}", kind)))
            .collect();
        {
            let mut st = self.endpoint.lock();
            if st.remote.is_some() {
                return Err(TransportError::InvalidState("remote description already set".into()));
            }
            if desc.sdp_type == SdpType::Answer && st.local.is_none() {
                return Err(TransportError::InvalidState("answer received without an offer".into()));
            }
            st.remote_candidates += parsed.candidates.len();
            st.remote = Some((desc.sdp_type, parsed));
        }
        if !remote_tracks.is_empty() {
            let _ = self
                .endpoint
                .events
                .send(TransportEvent::RemoteStream(MediaStream::new(remote_tracks)));
        }
        self.endpoint.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), TransportError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            // End-of-candidates marker.
            return Ok(());
        }
        Candidate::parse(&candidate.candidate)?;
        {
            let mut st = self.endpoint.lock();
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
            st.remote_candidates += 1;
        }
        self.endpoint.try_connect();
        Ok(())
    }

    fn replace_video_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        if track.kind() != TrackKind::Video {
            return Err(TransportError::InvalidState("not a video track".into()));
        }
        self.endpoint.lock().outbound_video = Some(track);
        Ok(())
    }

    fn outbound_video_track(&self) -> Option<MediaTrack> {
        self.endpoint.lock().outbound_video.clone()
    }

    fn close(&self) {
        let ep = &self.endpoint;
        if ep.is_closed() {
            return;
        }
        let remote = ep.remote_ufrag();
        ep.set_state(ConnectionState::Closed);
        ep.network.lock().endpoints.remove(&ep.ufrag);
        if let Some(peer) = remote.and_then(|u| ep.network.lookup(&u)) {
            peer.peer_closed();
        }
        tracing::debug!("Loopback endpoint {} closed", ep.ufrag);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(
        net: &LoopbackNetwork,
    ) -> (TransportHandle, TransportHandle) {
        let config = RtcConfig::default();
        (net.create(&config).await.unwrap(), net.create(&config).await.unwrap())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn states(events: &[TransportEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn candidates(events: &[TransportEvent]) -> Vec<IceCandidateInit> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Full offer/answer plus one candidate each way.
    async fn negotiate(a: &mut TransportHandle, b: &mut TransportHandle) {
        let offer = a.transport.create_offer().await.unwrap();
        a.transport.set_local_description(offer.clone()).await.unwrap();
        b.transport.set_remote_description(offer).await.unwrap();
        let answer = b.transport.create_answer().await.unwrap();
        b.transport.set_local_description(answer.clone()).await.unwrap();
        a.transport.set_remote_description(answer).await.unwrap();

        for c in candidates(&drain(&mut a.events)) {
            b.transport.add_ice_candidate(c).await.unwrap();
        }
        for c in candidates(&drain(&mut b.events)) {
            a.transport.add_ice_candidate(c).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pair_connects() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&net).await;
        a.transport
            .add_track(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"))
            .unwrap();
        negotiate(&mut a, &mut b).await;

        assert_eq!(
            states(&drain(&mut a.events)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        // b already saw its states while candidates were drained.
        assert_eq!(b.transport.outbound_video_track(), None);
    }

    #[tokio::test]
    async fn test_answer_reveals_remote_stream() {
        let net = LoopbackNetwork::new();
        let (a, mut b) = pair(&net).await;
        a.transport
            .add_track(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic"))
            .unwrap();
        a.transport
            .add_track(MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam"))
            .unwrap();
        let offer = a.transport.create_offer().await.unwrap();
        b.transport.set_remote_description(offer).await.unwrap();

        let events = drain(&mut b.events);
        let stream = events
            .iter()
            .find_map(|e| match e {
                TransportEvent::RemoteStream(s) => Some(s.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(stream.audio_tracks().count(), 1);
        assert_eq!(stream.video_tracks().count(), 1);
        assert!(stream.tracks.iter().all(|t| t.source() == TrackSource::Remote));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let net = LoopbackNetwork::new();
        let (a, _b) = pair(&net).await;
        let err = a
            .transport
            .add_ice_candidate(IceCandidateInit::new(
                "candidate:1 1 udp 2130706431 127.0.0.1 40001 typ host",
                None,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_sever_and_restore() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&net).await;
        negotiate(&mut a, &mut b).await;
        drain(&mut a.events);
        drain(&mut b.events);

        net.sever();
        assert_eq!(states(&drain(&mut a.events)), vec![ConnectionState::Disconnected]);
        net.restore();
        assert_eq!(states(&drain(&mut a.events)), vec![ConnectionState::Connected]);
        assert_eq!(states(&drain(&mut b.events)), vec![
            ConnectionState::Disconnected,
            ConnectionState::Connected
        ]);
    }

    #[tokio::test]
    async fn test_unreachable_network_fails() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&net).await;
        net.sever();
        negotiate(&mut a, &mut b).await;
        assert_eq!(
            states(&drain(&mut a.events)),
            vec![ConnectionState::Connecting, ConnectionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_close_notifies_peer_and_is_idempotent() {
        let net = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&net).await;
        negotiate(&mut a, &mut b).await;
        drain(&mut b.events);

        a.transport.close();
        a.transport.close();
        assert_eq!(states(&drain(&mut b.events)), vec![ConnectionState::Disconnected]);
        assert_eq!(
            a.transport.create_offer().await.unwrap_err(),
            TransportError::Closed
        );
    }

    #[tokio::test]
    async fn test_refused_construction() {
        let net = LoopbackNetwork::new();
        net.refuse_new_transports(true);
        assert!(net.create(&RtcConfig::default()).await.is_err());
    }
}
