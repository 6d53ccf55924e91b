//! Call session controller.
//!
//! One [`CallSession`] drives one call, voice or video, from either side:
//! it acquires local media, builds the peer connection, relays offers,
//! answers and candidates through [`SignalRelay`], and exposes the call as
//! an observable [`CallView`] for the UI. [`CallSession::end`] is the only
//! teardown path.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::media::{MediaConstraints, MediaStream, MediaTrack};
use super::peer::{PeerConnection, PeerEvent};
use super::records::{CallRecords, CallStatus};
use super::relay::{SignalMessage, SignalRelay, SignalType};
use super::transport::{IceCandidateInit, SdpType, SessionDescription, TransportEvent};
use super::{CallContext, CallError, CallId, ConnectionState, MediaKind, Role};

/// Everything the call screen shows.
#[derive(Debug, Clone, PartialEq)]
pub struct CallView {
    pub call_id: CallId,
    /// Who we are talking to, for display.
    pub peer_label: String,
    pub role: Role,
    pub media: MediaKind,
    pub state: ConnectionState,
    pub muted: bool,
    pub camera_enabled: bool,
    pub speaker_enabled: bool,
    pub screen_sharing: bool,
    pub remote_audio: bool,
    pub remote_video: bool,
    pub duration_secs: u64,
    /// Message for the user, e.g. a lost connection or a failed start.
    pub notice: Option<String>,
    pub ended: bool,
}

impl CallView {
    fn new(call_id: CallId, peer_label: String, role: Role, media: MediaKind) -> Self {
        Self {
            call_id,
            peer_label,
            role,
            media,
            state: ConnectionState::New,
            muted: false,
            camera_enabled: media.has_video(),
            speaker_enabled: true,
            screen_sharing: false,
            remote_audio: false,
            remote_video: false,
            duration_secs: 0,
            notice: None,
            ended: false,
        }
    }

    /// `mm:ss`, or `h:mm:ss` past the hour.
    pub fn duration_label(&self) -> String {
        let s = self.duration_secs;
        if s >= 3600 {
            format!("{}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
        } else {
            format!("{:02}:{:02}", s / 60, s % 60)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Started,
    Ended,
}

struct SessionState {
    phase: Phase,
    local: Option<MediaStream>,
    screen: Option<MediaTrack>,
    peer: Option<Arc<PeerConnection>>,
    offer_sent: bool,
    offer_received: bool,
    answer_received: bool,
    started_at: Option<DateTime<Utc>>,
    history: Vec<ConnectionState>,
    tasks: Vec<JoinHandle<()>>,
}

struct SessionInner {
    ctx: CallContext,
    call_id: CallId,
    role: Role,
    media: MediaKind,
    relay: SignalRelay,
    cancel: CancellationToken,
    view: watch::Sender<CallView>,
    state: Mutex<SessionState>,
}

/// Handle to one call. Clones share the call.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(
        ctx: CallContext,
        call_id: CallId,
        role: Role,
        media: MediaKind,
        peer_label: impl Into<String>,
    ) -> Self {
        let relay = SignalRelay::new(
            ctx.store.clone(),
            ctx.self_id.clone(),
            ctx.settings.signal_retry,
        );
        let (view, _) = watch::channel(CallView::new(
            call_id.clone(),
            peer_label.into(),
            role,
            media,
        ));
        Self {
            inner: Arc::new(SessionInner {
                ctx,
                call_id,
                role,
                media,
                relay,
                cancel: CancellationToken::new(),
                view,
                state: Mutex::new(SessionState {
                    phase: Phase::Idle,
                    local: None,
                    screen: None,
                    peer: None,
                    offer_sent: false,
                    offer_received: false,
                    answer_received: false,
                    started_at: None,
                    history: vec![ConnectionState::New],
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.view.borrow().state
    }

    pub fn view(&self) -> CallView {
        self.inner.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.inner.view.subscribe()
    }

    /// When the connection was first established.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    /// Every connection state the call has been in, in order.
    pub fn connection_history(&self) -> Vec<ConnectionState> {
        self.inner.lock().history.clone()
    }

    /// The track currently sent as video.
    pub fn outbound_video(&self) -> Option<MediaTrack> {
        let peer = self.inner.lock().peer.clone();
        peer.and_then(|p| p.outbound_video_track())
    }

    /// Acquire media, connect the signal relay and, as initiator, send the
    /// offer. Returns `Ok(())` without side effects if the call is ended
    /// while starting.
    pub async fn start(&self) -> Result<(), CallError> {
        {
            let mut st = self.inner.lock();
            match st.phase {
                Phase::Idle => st.phase = Phase::Starting,
                Phase::Ended => return Ok(()),
                Phase::Starting | Phase::Started => {
                    return Err(CallError::Negotiation("call already started".into()))
                }
            }
        }
        tracing::info!(
            "Starting {} call {} as {}",
            self.inner.media.as_call_type(),
            self.inner.call_id,
            self.inner.role
        );

        match self.inner.clone().run_start().await {
            Ok(()) => Ok(()),
            Err(_) if self.inner.cancel.is_cancelled() => {
                tracing::debug!("Call {} ended while starting", self.inner.call_id);
                Ok(())
            }
            Err(e @ CallError::MediaAccess(_)) => {
                tracing::warn!("Media unavailable for call {}: {}", self.inner.call_id, e);
                {
                    let mut st = self.inner.lock();
                    if st.phase == Phase::Starting {
                        st.phase = Phase::Idle;
                    }
                }
                self.inner.set_notice(Some(e.user_message()));
                Err(e)
            }
            Err(e) => {
                tracing::warn!("Call {} failed to start: {}", self.inner.call_id, e);
                self.end().await;
                self.inner.set_notice(Some(e.user_message()));
                Err(e)
            }
        }
    }

    /// Apply one signal from the other participant.
    pub async fn handle_incoming_signal(&self, message: SignalMessage) {
        self.inner.handle_signal(message).await;
    }

    /// Returns whether the microphone is now muted.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.inner.view.borrow().muted;
        if let Some(local) = &self.inner.lock().local {
            for track in local.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        self.inner.view.send_modify(|v| v.muted = muted);
        tracing::debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        muted
    }

    /// Returns whether the camera is now enabled. Always off in voice calls.
    pub fn toggle_camera(&self) -> bool {
        if !self.inner.media.has_video() {
            return false;
        }
        let enabled = !self.inner.view.borrow().camera_enabled;
        if let Some(local) = &self.inner.lock().local {
            for track in local.video_tracks() {
                track.set_enabled(enabled);
            }
        }
        self.inner.view.send_modify(|v| v.camera_enabled = enabled);
        tracing::debug!("Camera {}", if enabled { "on" } else { "off" });
        enabled
    }

    /// Returns whether remote audio is now played.
    pub fn toggle_speaker(&self) -> bool {
        let enabled = !self.inner.view.borrow().speaker_enabled;
        let peer = self.inner.lock().peer.clone();
        if let Some(remote) = peer.and_then(|p| p.remote_stream()) {
            for track in remote.audio_tracks() {
                track.set_enabled(enabled);
            }
        }
        self.inner.view.send_modify(|v| v.speaker_enabled = enabled);
        tracing::debug!("Speaker {}", if enabled { "on" } else { "off" });
        enabled
    }

    /// Start or stop sending the screen instead of the camera. Returns
    /// whether the screen is now shared.
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        if !self.inner.media.has_video() {
            return Err(CallError::Unavailable(
                "Screen sharing is only available in video calls.".into(),
            ));
        }
        let (peer, sharing) = {
            let st = self.inner.lock();
            (st.peer.clone(), st.screen.clone())
        };
        if let Some(screen) = sharing {
            self.inner.stop_screen_share(&screen);
            return Ok(false);
        }
        let Some(peer) = peer else {
            return Err(CallError::Unavailable("The call has not started.".into()));
        };

        let screen = match self.inner.ctx.devices.get_display_media().await {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Screen capture unavailable: {}", e);
                self.inner.set_notice(Some(e.user_message()));
                return Err(e.into());
            }
        };

        {
            let mut st = self.inner.lock();
            if st.phase == Phase::Ended || st.screen.is_some() {
                drop(st);
                screen.stop();
                return Ok(false);
            }
            st.screen = Some(screen.clone());
        }
        if let Err(e) = peer.replace_outbound_video_track(screen.clone()) {
            self.inner.lock().screen = None;
            screen.stop();
            return Err(e);
        }
        self.inner.view.send_modify(|v| v.screen_sharing = true);
        tracing::info!("Screen sharing started ({})", screen.label());

        // The capture can end on its own, e.g. when the shared window closes.
        let weak = Arc::downgrade(&self.inner);
        let watched = screen.clone();
        let watcher = tokio::spawn(async move {
            watched.ended().await;
            if let Some(inner) = weak.upgrade() {
                inner.stop_screen_share(&watched);
            }
        });
        self.inner.push_task(watcher);
        Ok(true)
    }

    /// End the call once its `calls` record reaches a final status, which
    /// is how a hangup on the other side arrives.
    pub async fn follow_record(&self, records: &CallRecords) -> Result<(), CallError> {
        let mut watch = records.watch_status(&self.inner.call_id).await?;
        let records = records.clone();
        let call_id = self.inner.call_id.clone();
        let cancel = self.inner.cancel.clone();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let closed = async {
                // The record may have closed before the subscription opened.
                match records.fetch(&call_id).await {
                    Ok(Some(r)) if r.status.is_final() => return Some(r.status),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("{}", e),
                }
                while let Some(record) = watch.next().await {
                    if record.status.is_final() {
                        return Some(record.status);
                    }
                }
                None
            };
            let status = tokio::select! {
                _ = cancel.cancelled() => None,
                status = closed => status,
            };
            watch.close().await;

            let (Some(status), Some(inner)) = (status, weak.upgrade()) else {
                return;
            };
            tracing::info!("Call {} record is now {}", call_id, status);
            let notice = match status {
                CallStatus::Declined => "The call was declined.".to_string(),
                CallStatus::Missed => "The call was not answered.".to_string(),
                _ => format!("{} hung up.", inner.view.borrow().peer_label),
            };
            CallSession { inner }.finish(Some(notice)).await;
        });
        Ok(())
    }

    /// Hang up. Safe to call at any time, any number of times.
    pub async fn end(&self) {
        self.finish(None).await;
    }

    /// Tear the call down, publishing `notice` with the ended view.
    async fn finish(&self, notice: Option<String>) {
        let (local, screen, peer, tasks) = {
            let mut st = self.inner.lock();
            if st.phase == Phase::Ended {
                return;
            }
            st.phase = Phase::Ended;
            (
                st.local.take(),
                st.screen.take(),
                st.peer.take(),
                std::mem::take(&mut st.tasks),
            )
        };
        self.inner.cancel.cancel();

        if let Some(local) = &local {
            for track in local.video_tracks().chain(local.audio_tracks()) {
                track.stop();
            }
        }
        if let Some(screen) = &screen {
            screen.stop();
        }
        if let Some(peer) = &peer {
            peer.close();
        }
        self.inner.relay.unsubscribe().await;
        for task in tasks {
            task.abort();
        }

        self.inner.view.send_modify(|v| {
            v.state = ConnectionState::Closed;
            v.duration_secs = 0;
            v.screen_sharing = false;
            v.ended = true;
            if notice.is_some() {
                v.notice = notice;
            }
        });
        self.inner.lock().history.push(ConnectionState::Closed);
        tracing::info!("Call {} ended", self.inner.call_id);
    }
}

impl SessionInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_ended(&self) -> bool {
        self.lock().phase == Phase::Ended
    }

    fn set_notice(&self, notice: Option<String>) {
        self.view.send_if_modified(|v| {
            if v.notice == notice {
                return false;
            }
            v.notice = notice;
            true
        });
    }

    /// Keep a background task for teardown, or abort it if the call is
    /// already over.
    fn push_task(&self, task: JoinHandle<()>) {
        let mut st = self.lock();
        if st.phase == Phase::Ended {
            task.abort();
        } else {
            st.tasks.retain(|t| !t.is_finished());
            st.tasks.push(task);
        }
    }

    async fn run_start(self: Arc<Self>) -> Result<(), CallError> {
        let constraints = MediaConstraints {
            audio: true,
            video: self.media.has_video(),
        };
        let stream = self.ctx.devices.get_user_media(constraints).await?;
        {
            let view = self.view.borrow().clone();
            for track in stream.audio_tracks() {
                track.set_enabled(!view.muted);
            }
            for track in stream.video_tracks() {
                track.set_enabled(view.camera_enabled);
            }
            let mut st = self.lock();
            if st.phase == Phase::Ended {
                drop(st);
                stream.stop_all();
                return Ok(());
            }
            st.local = Some(stream.clone());
        }
        tracing::debug!("Acquired {} local tracks", stream.tracks.len());

        let (peer, events) =
            PeerConnection::new(self.ctx.transports.as_ref(), &self.ctx.settings.rtc).await?;
        let peer = Arc::new(peer);
        {
            let mut st = self.lock();
            if st.phase == Phase::Ended {
                drop(st);
                peer.close();
                return Ok(());
            }
            st.peer = Some(peer.clone());
        }
        peer.attach_local_stream(&stream)?;

        let weak = Arc::downgrade(&self);
        peer.on_remote_track(move |remote| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_remote_stream(remote);
            }
        });
        self.push_task(tokio::spawn(pump_transport_events(
            Arc::downgrade(&self),
            peer.clone(),
            events,
        )));

        let signals = self.relay.subscribe(&self.call_id).await?;
        if self.is_ended() {
            self.relay.unsubscribe().await;
            return Ok(());
        }
        self.push_task(tokio::spawn(pump_signals(Arc::downgrade(&self), signals)));

        if self.role == Role::Initiator {
            let offer = peer.create_offer().await?;
            if self.is_ended() {
                return Ok(());
            }
            // The answer can arrive before send() returns.
            self.lock().offer_sent = true;
            self.send_description(SignalType::Offer, &offer).await?;
        }

        let mut st = self.lock();
        if st.phase == Phase::Starting {
            st.phase = Phase::Started;
        }
        Ok(())
    }

    async fn send_description(
        &self,
        kind: SignalType,
        desc: &SessionDescription,
    ) -> Result<(), CallError> {
        let payload = serde_json::to_value(desc).map_err(|e| CallError::SignalDelivery {
            kind,
            reason: e.to_string(),
        })?;
        self.relay.send(&self.call_id, kind, payload).await?;
        tracing::info!("Sent {} for call {}", kind, self.call_id);
        Ok(())
    }

    fn apply_remote_stream(&self, remote: &MediaStream) {
        let speaker = self.view.borrow().speaker_enabled;
        for track in remote.audio_tracks() {
            track.set_enabled(speaker);
        }
        let audio = remote.audio_tracks().next().is_some();
        let video = remote.video_tracks().next().is_some();
        tracing::info!("Remote media: audio={} video={}", audio, video);
        self.view.send_modify(|v| {
            v.remote_audio = audio;
            v.remote_video = video;
        });
    }

    async fn handle_signal(&self, message: SignalMessage) {
        if message.sender_id == self.ctx.self_id {
            tracing::debug!("Ignoring own {} signal", message.signal_type);
            return;
        }
        if message.call_id != self.call_id {
            tracing::debug!("Ignoring signal for call {}", message.call_id);
            return;
        }
        let peer = {
            let st = self.lock();
            if st.phase == Phase::Ended {
                return;
            }
            st.peer.clone()
        };
        let Some(peer) = peer else {
            tracing::debug!("Ignoring {} before the call started", message.signal_type);
            return;
        };

        match message.signal_type {
            SignalType::Offer => self.handle_offer(&peer, &message).await,
            SignalType::Answer => self.handle_answer(&peer, &message).await,
            SignalType::IceCandidate => {
                let candidate: IceCandidateInit = match message.payload_as() {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed candidate: {}", e);
                        return;
                    }
                };
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    tracing::warn!("Remote candidate rejected: {}", e);
                }
            }
        }
    }

    fn parse_description(message: &SignalMessage, expected: SdpType) -> Option<SessionDescription> {
        match message.payload_as::<SessionDescription>() {
            Ok(desc) if desc.sdp_type == expected => Some(desc),
            Ok(desc) => {
                tracing::warn!(
                    "Ignoring {} signal carrying a {} description",
                    message.signal_type,
                    desc.sdp_type
                );
                None
            }
            Err(e) => {
                tracing::warn!("Ignoring malformed {}: {}", message.signal_type, e);
                None
            }
        }
    }

    async fn handle_offer(&self, peer: &PeerConnection, message: &SignalMessage) {
        if self.role != Role::Receiver {
            tracing::warn!("Ignoring offer: we are the initiator");
            return;
        }
        let Some(offer) = Self::parse_description(message, SdpType::Offer) else {
            return;
        };
        {
            let mut st = self.lock();
            if st.offer_received {
                tracing::debug!("Ignoring repeated offer");
                return;
            }
            st.offer_received = true;
        }
        tracing::info!("Received offer for call {}", self.call_id);

        if let Err(e) = peer.set_remote_description(offer).await {
            tracing::warn!("Cannot apply offer: {}", e);
            self.set_notice(Some(e.user_message()));
            return;
        }
        let answer = match peer.create_answer().await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("Cannot create answer: {}", e);
                self.set_notice(Some(e.user_message()));
                return;
            }
        };
        if self.is_ended() {
            return;
        }
        if let Err(e) = self.send_description(SignalType::Answer, &answer).await {
            tracing::warn!("{}", e);
            self.set_notice(Some(e.user_message()));
        }
    }

    async fn handle_answer(&self, peer: &PeerConnection, message: &SignalMessage) {
        if self.role != Role::Initiator {
            tracing::warn!("Ignoring answer: we are the receiver");
            return;
        }
        let Some(answer) = Self::parse_description(message, SdpType::Answer) else {
            return;
        };
        {
            let mut st = self.lock();
            if !st.offer_sent {
                tracing::warn!("Ignoring answer that arrived before our offer was sent");
                return;
            }
            if st.answer_received {
                tracing::debug!("Ignoring repeated answer");
                return;
            }
            st.answer_received = true;
        }
        tracing::info!("Received answer for call {}", self.call_id);
        if let Err(e) = peer.set_remote_description(answer).await {
            tracing::warn!("Cannot apply answer: {}", e);
            self.set_notice(Some(e.user_message()));
        }
    }

    async fn on_peer_event(self: &Arc<Self>, event: PeerEvent) {
        if self.is_ended() {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let payload = match serde_json::to_value(&candidate) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("Cannot encode local candidate: {}", e);
                        return;
                    }
                };
                if let Err(e) = self
                    .relay
                    .send(&self.call_id, SignalType::IceCandidate, payload)
                    .await
                {
                    tracing::warn!("Dropping local candidate: {}", e);
                }
            }
            // Handled by the remote track callback.
            PeerEvent::RemoteStream(_) => {}
            PeerEvent::StateChanged { from, to } => self.on_state_changed(from, to),
        }
    }

    fn on_state_changed(self: &Arc<Self>, from: ConnectionState, to: ConnectionState) {
        let first_connect = {
            let mut st = self.lock();
            if st.phase == Phase::Ended {
                return;
            }
            st.history.push(to);
            let first = to == ConnectionState::Connected && st.started_at.is_none();
            if first {
                st.started_at = Some(Utc::now());
            }
            first
        };
        // end() may have published Closed since the check in on_peer_event.
        let published = self.view.send_if_modified(|v| {
            if v.ended {
                return false;
            }
            v.state = to;
            true
        });
        if !published {
            return;
        }

        match to {
            ConnectionState::Connected => {
                tracing::info!("Call {} connected", self.call_id);
                self.set_notice(None);
                if first_connect {
                    self.push_task(tokio::spawn(tick_duration(
                        Arc::downgrade(self),
                        self.cancel.clone(),
                    )));
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed
                if self.lock().started_at.is_some() =>
            {
                let lost = CallError::ConnectionLost(to);
                tracing::warn!("Call {}: {} (was {})", self.call_id, lost, from);
                self.set_notice(Some(lost.user_message()));
            }
            ConnectionState::Failed => {
                tracing::warn!("Call {} could not connect", self.call_id);
                self.set_notice(Some(
                    CallError::Negotiation("connection failed".into()).user_message(),
                ));
            }
            _ => {}
        }
    }

    /// Swap the camera back in if `screen` is still the shared track.
    fn stop_screen_share(&self, screen: &MediaTrack) {
        let peer = {
            let mut st = self.lock();
            if st.screen.as_ref() != Some(screen) {
                return;
            }
            st.screen = None;
            st.peer.clone()
        };
        if let Some(peer) = peer {
            if let Some(camera) = peer.camera_track() {
                if let Err(e) = peer.replace_outbound_video_track(camera) {
                    tracing::warn!("Cannot restore camera: {}", e);
                }
            }
        }
        screen.stop();
        self.view.send_modify(|v| v.screen_sharing = false);
        tracing::info!("Screen sharing stopped");
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let st = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in st.tasks.drain(..) {
            task.abort();
        }
        if let Some(local) = st.local.take() {
            local.stop_all();
        }
        if let Some(screen) = st.screen.take() {
            screen.stop();
        }
        if let Some(peer) = st.peer.take() {
            peer.close();
        }
    }
}

async fn pump_signals(
    session: Weak<SessionInner>,
    mut signals: mpsc::UnboundedReceiver<SignalMessage>,
) {
    while let Some(message) = signals.recv().await {
        let Some(inner) = session.upgrade() else { break };
        inner.handle_signal(message).await;
    }
}

async fn pump_transport_events(
    session: Weak<SessionInner>,
    peer: Arc<PeerConnection>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(peer_event) = peer.handle_transport_event(event) else {
            continue;
        };
        let Some(inner) = session.upgrade() else { break };
        inner.on_peer_event(peer_event).await;
    }
}

async fn tick_duration(session: Weak<SessionInner>, cancel: CancellationToken) {
    let since = Instant::now();
    let mut ticker = tokio::time::interval_at(since + Duration::from_secs(1), Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = session.upgrade() else { break };
                let secs = since.elapsed().as_secs();
                inner.view.send_if_modified(|v| {
                    if v.ended || v.duration_secs == secs {
                        return false;
                    }
                    v.duration_secs = secs;
                    true
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::calling::error::{DeviceKind, MediaAccessError};
    use crate::calling::loopback::LoopbackNetwork;
    use crate::calling::media::{Availability, SyntheticDevices, TrackSource};
    use crate::calling::relay::SIGNALS_TABLE;
    use crate::calling::CallSettings;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        store: Arc<MemoryStore>,
        net: LoopbackNetwork,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                net: LoopbackNetwork::new(),
            }
        }

        fn context(&self, user: &str, devices: Arc<SyntheticDevices>) -> CallContext {
            CallContext {
                store: self.store.clone(),
                self_id: user.to_string(),
                devices,
                transports: Arc::new(self.net.clone()),
                settings: CallSettings::default(),
            }
        }

        fn session(
            &self,
            user: &str,
            devices: Arc<SyntheticDevices>,
            call_id: &CallId,
            role: Role,
            media: MediaKind,
        ) -> CallSession {
            CallSession::new(self.context(user, devices), call_id.clone(), role, media, "peer")
        }

        fn senders(&self, kind: &str) -> Vec<String> {
            self.store
                .rows(SIGNALS_TABLE)
                .iter()
                .filter(|r| r["signal_type"] == kind)
                .filter_map(|r| r["sender_id"].as_str().map(str::to_string))
                .collect()
        }

        fn signals(&self, kind: &str) -> usize {
            self.store
                .rows(SIGNALS_TABLE)
                .iter()
                .filter(|r| r["signal_type"] == kind)
                .count()
        }
    }

    async fn wait_until(session: &CallSession, pred: impl Fn(&CallView) -> bool) {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|v| pred(v)))
            .await
            .expect("timed out waiting for the call view")
            .expect("call view dropped");
    }

    /// Alice calls Bob and both ends connect.
    async fn connected_pair(
        h: &Harness,
        media: MediaKind,
    ) -> (CallSession, Arc<SyntheticDevices>, CallSession, Arc<SyntheticDevices>) {
        let call_id = CallId::new();
        let alice_devices = Arc::new(SyntheticDevices::granted());
        let bob_devices = Arc::new(SyntheticDevices::granted());
        let alice = h.session("alice", alice_devices.clone(), &call_id, Role::Initiator, media);
        let bob = h.session("bob", bob_devices.clone(), &call_id, Role::Receiver, media);

        assert_ok!(alice.start().await);
        assert_ok!(bob.start().await);
        wait_until(&alice, |v| v.state == ConnectionState::Connected).await;
        wait_until(&bob, |v| v.state == ConnectionState::Connected).await;
        (alice, alice_devices, bob, bob_devices)
    }

    #[tokio::test]
    async fn test_initiator_and_receiver_connect_once() {
        let h = Harness::new();
        let (alice, _, bob, _) = connected_pair(&h, MediaKind::AudioVideo).await;

        assert_eq!(h.senders("offer"), vec!["alice"]);
        assert_eq!(h.senders("answer"), vec!["bob"]);
        let candidates = h.senders("ice-candidate");
        assert!(candidates.iter().any(|s| s == "alice"));
        assert!(candidates.iter().any(|s| s == "bob"));

        for session in [&alice, &bob] {
            let connects = session
                .connection_history()
                .iter()
                .filter(|s| **s == ConnectionState::Connected)
                .count();
            assert_eq!(connects, 1);
            assert!(session.started_at().is_some());
        }
        wait_until(&bob, |v| v.remote_audio && v.remote_video).await;

        alice.end().await;
        bob.end().await;
    }

    #[tokio::test]
    async fn test_receiver_joining_late_sees_earlier_offer() {
        let h = Harness::new();
        let call_id = CallId::new();
        let alice = h.session(
            "alice",
            Arc::new(SyntheticDevices::granted()),
            &call_id,
            Role::Initiator,
            MediaKind::Audio,
        );
        assert_ok!(alice.start().await);
        tokio::task::yield_now().await;
        assert_eq!(h.signals("offer"), 1);

        let bob = h.session(
            "bob",
            Arc::new(SyntheticDevices::granted()),
            &call_id,
            Role::Receiver,
            MediaKind::Audio,
        );
        assert_ok!(bob.start().await);
        wait_until(&bob, |v| v.state == ConnectionState::Connected).await;
        wait_until(&alice, |v| v.state == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_double_end_releases_everything() {
        let h = Harness::new();
        let (alice, alice_devices, bob, bob_devices) =
            connected_pair(&h, MediaKind::AudioVideo).await;
        assert_ok!(alice.toggle_screen_share().await);

        alice.end().await;
        alice.end().await;
        bob.end().await;

        let view = alice.view();
        assert!(view.ended);
        assert_eq!(view.state, ConnectionState::Closed);
        assert_eq!(view.duration_secs, 0);
        for track in alice_devices
            .issued_tracks()
            .iter()
            .chain(bob_devices.issued_tracks().iter())
        {
            assert!(!track.is_live(), "{:?} still live", track);
        }
        assert_eq!(h.store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_mute_toggles_back() {
        let h = Harness::new();
        let (alice, devices, bob, _) = connected_pair(&h, MediaKind::Audio).await;
        let mic = devices
            .issued_tracks()
            .into_iter()
            .find(|t| t.source() == TrackSource::Microphone)
            .unwrap();

        assert!(alice.toggle_mute());
        assert!(!mic.enabled());
        assert!(!alice.toggle_mute());
        assert!(mic.enabled());
        assert!(!alice.view().muted);

        // Voice calls have no camera to toggle.
        assert!(!alice.toggle_camera());
        assert!(matches!(
            alice.toggle_screen_share().await,
            Err(CallError::Unavailable(_))
        ));
        alice.end().await;
        bob.end().await;
    }

    #[tokio::test]
    async fn test_speaker_toggle_mutes_remote_audio() {
        let h = Harness::new();
        let (alice, _, bob, _) = connected_pair(&h, MediaKind::Audio).await;
        wait_until(&bob, |v| v.remote_audio).await;

        assert!(!bob.toggle_speaker());
        assert!(!bob.view().speaker_enabled);
        assert!(bob.toggle_speaker());
        alice.end().await;
        bob.end().await;
    }

    #[tokio::test]
    async fn test_own_echo_changes_nothing() {
        let h = Harness::new();
        let call_id = CallId::new();
        let bob = h.session(
            "bob",
            Arc::new(SyntheticDevices::granted()),
            &call_id,
            Role::Receiver,
            MediaKind::Audio,
        );
        assert_ok!(bob.start().await);
        let before = bob.view();
        let rows_before = h.store.rows(SIGNALS_TABLE).len();

        let echo = SignalMessage::new(
            call_id.clone(),
            "bob",
            SignalType::Offer,
            serde_json::json!({"type": "offer", "sdp": "v=0\r\n"}),
        );
        bob.handle_incoming_signal(echo).await;

        assert_eq!(bob.view(), before);
        assert_eq!(h.store.rows(SIGNALS_TABLE).len(), rows_before);
        assert_eq!(bob.connection_history(), vec![ConnectionState::New]);
        bob.end().await;
    }

    #[tokio::test]
    async fn test_malformed_and_misrouted_signals_are_ignored() {
        let h = Harness::new();
        let call_id = CallId::new();
        let bob = h.session(
            "bob",
            Arc::new(SyntheticDevices::granted()),
            &call_id,
            Role::Receiver,
            MediaKind::Audio,
        );
        assert_ok!(bob.start().await);

        let garbage = SignalMessage::new(
            call_id.clone(),
            "alice",
            SignalType::Offer,
            serde_json::json!({"nope": true}),
        );
        bob.handle_incoming_signal(garbage).await;
        let other_call = SignalMessage::new(
            CallId::new(),
            "alice",
            SignalType::Answer,
            serde_json::json!({"type": "answer", "sdp": "v=0\r\n"}),
        );
        bob.handle_incoming_signal(other_call).await;
        let stray_answer = SignalMessage::new(
            call_id.clone(),
            "alice",
            SignalType::Answer,
            serde_json::json!({"type": "answer", "sdp": "v=0\r\n"}),
        );
        bob.handle_incoming_signal(stray_answer).await;

        assert_eq!(bob.state(), ConnectionState::New);
        assert_eq!(h.signals("answer"), 0);
        bob.end().await;
    }

    #[tokio::test]
    async fn test_screen_share_restores_camera_on_stop() {
        let h = Harness::new();
        let (alice, devices, bob, _) = connected_pair(&h, MediaKind::AudioVideo).await;
        let camera = alice.outbound_video().unwrap();
        assert_eq!(camera.source(), TrackSource::Camera);

        assert!(assert_ok!(alice.toggle_screen_share().await));
        let screen = alice.outbound_video().unwrap();
        assert_eq!(screen.source(), TrackSource::Screen);
        assert!(alice.view().screen_sharing);

        assert!(!assert_ok!(alice.toggle_screen_share().await));
        assert_eq!(alice.outbound_video(), Some(camera.clone()));
        assert!(!screen.is_live());
        assert!(camera.is_live());
        assert!(!alice.view().screen_sharing);
        assert_eq!(devices.issued_tracks().len(), 3);

        alice.end().await;
        bob.end().await;
    }

    #[tokio::test]
    async fn test_screen_share_restores_camera_when_capture_ends() {
        let h = Harness::new();
        let (alice, _, bob, _) = connected_pair(&h, MediaKind::AudioVideo).await;
        let camera = alice.outbound_video().unwrap();

        assert_ok!(alice.toggle_screen_share().await);
        let screen = alice.outbound_video().unwrap();
        screen.stop();

        wait_until(&alice, |v| !v.screen_sharing).await;
        assert_eq!(alice.outbound_video(), Some(camera));
        alice.end().await;
        bob.end().await;
    }

    #[tokio::test]
    async fn test_denied_screen_capture_keeps_camera() {
        let h = Harness::new();
        let call_id = CallId::new();
        let devices = Arc::new(SyntheticDevices::granted().with_screen(Availability::Denied));
        let alice = h.session("alice", devices, &call_id, Role::Initiator, MediaKind::AudioVideo);
        assert_ok!(alice.start().await);

        let err = assert_err!(alice.toggle_screen_share().await);
        assert!(matches!(
            err,
            CallError::MediaAccess(MediaAccessError::PermissionDenied(DeviceKind::Screen))
        ));
        assert_eq!(
            alice.outbound_video().map(|t| t.source()),
            Some(TrackSource::Camera)
        );
        alice.end().await;
    }

    #[tokio::test]
    async fn test_permission_denied_sends_nothing() {
        let h = Harness::new();
        let devices =
            Arc::new(SyntheticDevices::granted().with_microphone(Availability::Denied));
        let alice = h.session(
            "alice",
            devices.clone(),
            &CallId::new(),
            Role::Initiator,
            MediaKind::AudioVideo,
        );

        let err = assert_err!(alice.start().await);
        assert!(matches!(
            err,
            CallError::MediaAccess(MediaAccessError::PermissionDenied(DeviceKind::Microphone))
        ));
        assert!(h.store.rows(SIGNALS_TABLE).is_empty());
        assert_eq!(alice.state(), ConnectionState::New);
        assert!(alice.view().notice.unwrap().contains("microphone"));
        assert!(devices.issued_tracks().is_empty());
        assert_eq!(h.store.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_start_cancels_it() {
        let h = Harness::new();
        let devices =
            Arc::new(SyntheticDevices::granted().with_prompt_delay(Duration::from_secs(10)));
        let alice = h.session(
            "alice",
            devices.clone(),
            &CallId::new(),
            Role::Initiator,
            MediaKind::AudioVideo,
        );

        let starting = {
            let alice = alice.clone();
            tokio::spawn(async move { alice.start().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        alice.end().await;

        assert_ok!(starting.await.unwrap());
        assert!(alice.view().ended);
        assert!(h.store.rows(SIGNALS_TABLE).is_empty());
        assert_eq!(devices.issued_tracks().len(), 2);
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
        assert_eq!(h.store.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeliverable_offer_fails_start() {
        let h = Harness::new();
        h.store.fail_next_inserts(u32::MAX);
        let devices = Arc::new(SyntheticDevices::granted());
        let alice = h.session(
            "alice",
            devices.clone(),
            &CallId::new(),
            Role::Initiator,
            MediaKind::Audio,
        );

        let err = assert_err!(alice.start().await);
        assert!(matches!(
            err,
            CallError::SignalDelivery {
                kind: SignalType::Offer,
                ..
            }
        ));
        assert!(alice.view().ended);
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_transport_refusal_is_a_negotiation_error() {
        let h = Harness::new();
        h.net.refuse_new_transports(true);
        let devices = Arc::new(SyntheticDevices::granted());
        let alice = h.session(
            "alice",
            devices.clone(),
            &CallId::new(),
            Role::Initiator,
            MediaKind::Audio,
        );

        let err = assert_err!(alice.start().await);
        assert!(matches!(err, CallError::Negotiation(_)));
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
        assert!(h.store.rows(SIGNALS_TABLE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_ticks_and_resets_on_end() {
        let h = Harness::new();
        let (alice, _, bob, _) = connected_pair(&h, MediaKind::Audio).await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let view = alice.view();
        assert_eq!(view.duration_secs, 3);
        assert_eq!(view.duration_label(), "00:03");

        alice.end().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(alice.view().duration_secs, 0);
        bob.end().await;
    }

    #[tokio::test]
    async fn test_connection_loss_is_a_notice() {
        let h = Harness::new();
        let (alice, _, bob, _) = connected_pair(&h, MediaKind::Audio).await;

        h.net.sever();
        wait_until(&alice, |v| v.state == ConnectionState::Disconnected).await;
        let view = alice.view();
        assert!(!view.ended);
        assert!(view.notice.is_some());

        h.net.restore();
        wait_until(&alice, |v| v.state == ConnectionState::Connected).await;
        assert!(alice.view().notice.is_none());

        alice.end().await;
        bob.end().await;
    }

    #[tokio::test]
    async fn test_signals_after_end_are_ignored() {
        let h = Harness::new();
        let call_id = CallId::new();
        let bob = h.session(
            "bob",
            Arc::new(SyntheticDevices::granted()),
            &call_id,
            Role::Receiver,
            MediaKind::Audio,
        );
        assert_ok!(bob.start().await);
        bob.end().await;

        let alice = h.session(
            "alice",
            Arc::new(SyntheticDevices::granted()),
            &call_id,
            Role::Initiator,
            MediaKind::Audio,
        );
        assert_ok!(alice.start().await);
        tokio::task::yield_now().await;
        assert_eq!(h.signals("answer"), 0);
        assert_eq!(bob.state(), ConnectionState::Closed);
        alice.end().await;
    }

    #[tokio::test]
    async fn test_remote_hangup_ends_call() {
        let h = Harness::new();
        let alice_records = CallRecords::new(h.store.clone(), "alice");
        let bob_records = CallRecords::new(h.store.clone(), "bob");
        let record = alice_records.place("bob", MediaKind::Audio).await.unwrap();
        bob_records
            .set_status(&record.id, CallStatus::Accepted)
            .await
            .unwrap();

        let alice = CallSession::new(
            h.context("alice", Arc::new(SyntheticDevices::granted())),
            record.id.clone(),
            Role::Initiator,
            MediaKind::Audio,
            "bob",
        );
        let bob = h.session(
            "bob",
            Arc::new(SyntheticDevices::granted()),
            &record.id,
            Role::Receiver,
            MediaKind::Audio,
        );
        assert_ok!(alice.follow_record(&alice_records).await);
        assert_ok!(bob.follow_record(&bob_records).await);
        assert_ok!(alice.start().await);
        assert_ok!(bob.start().await);
        wait_until(&alice, |v| v.state == ConnectionState::Connected).await;

        bob.end().await;
        bob_records
            .set_status(&record.id, CallStatus::Ended)
            .await
            .unwrap();

        wait_until(&alice, |v| v.ended).await;
        let view = alice.view();
        assert_eq!(view.state, ConnectionState::Closed);
        assert_eq!(view.notice.as_deref(), Some("bob hung up."));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.store.subscription_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("record subscriptions left open");
    }

    #[tokio::test]
    async fn test_declined_record_ends_unstarted_call() {
        let h = Harness::new();
        let alice_records = CallRecords::new(h.store.clone(), "alice");
        let record = alice_records.place("bob", MediaKind::Audio).await.unwrap();
        alice_records
            .set_status(&record.id, CallStatus::Declined)
            .await
            .unwrap();

        let alice = h.session(
            "alice",
            Arc::new(SyntheticDevices::granted()),
            &record.id,
            Role::Initiator,
            MediaKind::Audio,
        );
        assert_ok!(alice.follow_record(&alice_records).await);
        wait_until(&alice, |v| v.ended).await;
        assert_eq!(alice.view().notice.as_deref(), Some("The call was declined."));

        // Starting afterwards is a no-op.
        assert_ok!(alice.start().await);
        assert!(h.store.rows(SIGNALS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_state_change_after_end_is_dropped() {
        let h = Harness::new();
        let (alice, _, bob, _) = connected_pair(&h, MediaKind::Audio).await;
        alice.end().await;

        alice
            .inner
            .on_state_changed(ConnectionState::Connected, ConnectionState::Disconnected);

        let view = alice.view();
        assert!(view.ended);
        assert_eq!(view.state, ConnectionState::Closed);
        assert!(view.notice.is_none());
        assert_eq!(
            alice.connection_history().last(),
            Some(&ConnectionState::Closed)
        );
        bob.end().await;
    }

    #[test]
    fn test_duration_label() {
        let mut view = CallView::new(CallId::new(), "x".into(), Role::Initiator, MediaKind::Audio);
        view.duration_secs = 3725;
        assert_eq!(view.duration_label(), "1:02:05");
        view.duration_secs = 59;
        assert_eq!(view.duration_label(), "00:59");
    }
}
