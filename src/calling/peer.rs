//! Peer connection manager.
//!
//! Wraps one [`PeerTransport`]: attaches local tracks, runs the offer/answer
//! exchange at most once per side, buffers ICE candidates that arrive
//! before the remote description, and keeps the connection state machine
//! honest no matter what the transport reports.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use super::media::{MediaStream, MediaTrack, TrackKind};
use super::transport::{
    IceCandidateInit, PeerTransport, RtcConfig, SdpType, SessionDescription, TransportEvent,
    TransportFactory,
};
use super::{CallError, ConnectionState};

type RemoteTrackCallback = Box<dyn Fn(&MediaStream) + Send + Sync>;

/// What the controller needs to act on after a transport event.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Trickle this candidate to the peer.
    LocalCandidate(IceCandidateInit),
    RemoteStream(MediaStream),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

#[derive(Default)]
struct Negotiation {
    local: Option<SdpType>,
    remote_set: bool,
    pending_candidates: VecDeque<IceCandidateInit>,
    camera_track: Option<MediaTrack>,
    remote_stream: Option<MediaStream>,
    closed: bool,
}

pub struct PeerConnection {
    transport: Arc<dyn PeerTransport>,
    inner: Mutex<Negotiation>,
    state: watch::Sender<ConnectionState>,
    remote_track_callbacks: Mutex<Vec<RemoteTrackCallback>>,
}

impl PeerConnection {
    /// Build the transport and return the connection with its event feed.
    pub async fn new(
        factory: &dyn TransportFactory,
        config: &RtcConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), CallError> {
        let handle = factory
            .create(config)
            .await
            .map_err(|e| CallError::Negotiation(format!("cannot create transport: {}", e)))?;
        tracing::debug!(
            "Peer connection created with {} ICE servers",
            config.ice_servers.len()
        );
        let (state, _) = watch::channel(ConnectionState::New);
        Ok((
            Self {
                transport: handle.transport,
                inner: Mutex::new(Negotiation::default()),
                state,
                remote_track_callbacks: Mutex::new(Vec::new()),
            },
            handle.events,
        ))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Negotiation> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.lock().closed {
            Err(CallError::Negotiation("peer connection is closed".into()))
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Offer every track of `stream`. The first video track becomes the
    /// camera track and the outbound video.
    pub fn attach_local_stream(&self, stream: &MediaStream) -> Result<(), CallError> {
        self.ensure_open()?;
        for track in &stream.tracks {
            self.transport.add_track(track.clone())?;
            if track.kind() == TrackKind::Video {
                let mut inner = self.lock();
                if inner.camera_track.is_none() {
                    inner.camera_track = Some(track.clone());
                }
            }
        }
        tracing::debug!("Attached {} local tracks", stream.tracks.len());
        Ok(())
    }

    pub fn camera_track(&self) -> Option<MediaTrack> {
        self.lock().camera_track.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.lock().remote_stream.clone()
    }

    /// Register a callback for the remote stream. Fires immediately if the
    /// stream has already arrived.
    pub fn on_remote_track<F>(&self, callback: F)
    where
        F: Fn(&MediaStream) + Send + Sync + 'static,
    {
        if let Some(stream) = self.remote_stream() {
            callback(&stream);
        }
        self.remote_track_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    fn claim_local(&self, sdp_type: SdpType) -> Result<(), CallError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(CallError::Negotiation("peer connection is closed".into()));
        }
        if let Some(existing) = inner.local {
            return Err(CallError::Negotiation(format!(
                "cannot create {}: {} already created",
                sdp_type, existing
            )));
        }
        if sdp_type == SdpType::Answer && !inner.remote_set {
            return Err(CallError::Negotiation(
                "cannot answer before the remote offer is set".into(),
            ));
        }
        inner.local = Some(sdp_type);
        Ok(())
    }

    async fn create_local(&self, sdp_type: SdpType) -> Result<SessionDescription, CallError> {
        self.claim_local(sdp_type)?;
        let desc = match sdp_type {
            SdpType::Offer => self.transport.create_offer().await?,
            SdpType::Answer => self.transport.create_answer().await?,
        };
        self.transport.set_local_description(desc.clone()).await?;
        tracing::debug!("Local {} set", sdp_type);
        Ok(desc)
    }

    /// Create the offer and set it as the local description. Once only.
    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.create_local(SdpType::Offer).await
    }

    /// Create the answer and set it as the local description. Once only,
    /// after the remote offer.
    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.create_local(SdpType::Answer).await
    }

    /// Apply the peer's description, then flush buffered candidates in
    /// arrival order.
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(CallError::Negotiation("peer connection is closed".into()));
            }
            if inner.remote_set {
                return Err(CallError::Negotiation(
                    "remote description already set".into(),
                ));
            }
            if desc.sdp_type == SdpType::Answer && inner.local != Some(SdpType::Offer) {
                return Err(CallError::Negotiation(
                    "received an answer without a local offer".into(),
                ));
            }
            inner.remote_set = true;
        }

        if let Err(e) = self.transport.set_remote_description(desc.clone()).await {
            self.lock().remote_set = false;
            return Err(e.into());
        }
        tracing::debug!("Remote {} set", desc.sdp_type);

        let pending: Vec<IceCandidateInit> = self.lock().pending_candidates.drain(..).collect();
        if !pending.is_empty() {
            tracing::debug!("Flushing {} buffered candidates", pending.len());
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!("Buffered candidate rejected: {}", e);
            }
        }
        Ok(())
    }

    /// Hand a remote candidate to the transport, or queue it until the
    /// remote description is set.
    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), CallError> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(CallError::Negotiation("peer connection is closed".into()));
            }
            if !inner.remote_set {
                inner.pending_candidates.push_back(candidate);
                tracing::debug!(
                    "Buffered candidate ({} pending)",
                    inner.pending_candidates.len()
                );
                return Ok(());
            }
        }
        self.transport.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub fn pending_candidates(&self) -> usize {
        self.lock().pending_candidates.len()
    }

    pub fn replace_outbound_video_track(&self, track: MediaTrack) -> Result<(), CallError> {
        self.ensure_open()?;
        self.transport.replace_video_track(track)?;
        Ok(())
    }

    pub fn outbound_video_track(&self) -> Option<MediaTrack> {
        self.transport.outbound_video_track()
    }

    /// Move to `next` if legal. Returns the previous state on success.
    fn transition(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });
        if let Some(prev) = from {
            tracing::info!("Peer connection {} -> {}", prev, next);
        }
        from
    }

    /// Fold one transport event into the connection. `None` when the event
    /// changes nothing the controller cares about.
    pub fn handle_transport_event(&self, event: TransportEvent) -> Option<PeerEvent> {
        match event {
            TransportEvent::LocalCandidate(c) => {
                if self.lock().closed {
                    return None;
                }
                Some(PeerEvent::LocalCandidate(c))
            }
            TransportEvent::RemoteStream(stream) => {
                {
                    let mut inner = self.lock();
                    if inner.closed {
                        return None;
                    }
                    inner.remote_stream = Some(stream.clone());
                }
                let callbacks = self
                    .remote_track_callbacks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                for cb in callbacks.iter() {
                    cb(&stream);
                }
                Some(PeerEvent::RemoteStream(stream))
            }
            TransportEvent::StateChanged(to) => {
                if to == ConnectionState::Closed {
                    // Only close() may close; a transport-side close is a failure.
                    let from = self.transition(ConnectionState::Failed)?;
                    return Some(PeerEvent::StateChanged {
                        from,
                        to: ConnectionState::Failed,
                    });
                }
                let from = self.transition(to)?;
                Some(PeerEvent::StateChanged { from, to })
            }
        }
    }

    /// Close the transport and stop remote tracks. Idempotent.
    pub fn close(&self) {
        let remote = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.pending_candidates.clear();
            inner.remote_stream.take()
        };
        self.transport.close();
        if let Some(stream) = remote {
            stream.stop_all();
        }
        self.transition(ConnectionState::Closed);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}
