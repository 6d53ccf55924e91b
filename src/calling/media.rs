//! Local and remote media tracks and the capture-device seam.
//!
//! No samples flow through these types: a track is a handle with an
//! `enabled` flag and a ready state. Capture and playback hang off the
//! device implementation; the call logic only ever flips flags, swaps
//! handles and stops them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::error::{DeviceKind, MediaAccessError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Where a track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    /// Received from the other participant.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<ReadyState>,
}

/// Shared handle to one media track. Clones refer to the same track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ReadyState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.ready_state() == ReadyState::Live
    }

    /// Release the underlying device. Stopping twice is a no-op.
    pub fn stop(&self) {
        let was_live = self.inner.state.send_if_modified(|s| {
            if *s == ReadyState::Live {
                *s = ReadyState::Ended;
                true
            } else {
                false
            }
        });
        if was_live {
            tracing::debug!("Stopped {} track {} ({})", self.kind(), self.id(), self.label());
        }
    }

    /// Resolves once the track has ended, whoever stopped it.
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns on Ended.
        let _ = rx.wait_for(|s| *s == ReadyState::Ended).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.enabled())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

/// An ordered group of tracks from one source (local capture or the peer).
#[derive(Debug, Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// What `get_user_media` should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

/// Access to capture devices. Each call may prompt the user.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open microphone and/or camera.
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError>;

    /// Open a screen capture track.
    async fn get_display_media(&self) -> Result<MediaTrack, MediaAccessError>;
}

/// Outcome a [`SyntheticDevices`] reports for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Granted,
    Denied,
    Missing,
    Busy,
}

impl Availability {
    fn check(self, device: DeviceKind) -> Result<(), MediaAccessError> {
        match self {
            Availability::Granted => Ok(()),
            Availability::Denied => Err(MediaAccessError::PermissionDenied(device)),
            Availability::Missing => Err(MediaAccessError::DeviceMissing(device)),
            Availability::Busy => Err(MediaAccessError::DeviceBusy(device)),
        }
    }
}

/// Devices that hand out placeholder tracks according to a fixed policy.
///
/// Used by the loopback command and the tests. Every issued track is
/// remembered so callers can check that all of them were released.
pub struct SyntheticDevices {
    microphone: Availability,
    camera: Availability,
    screen: Availability,
    prompt_delay: Duration,
    issued: Mutex<Vec<MediaTrack>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::granted()
    }
}

impl SyntheticDevices {
    /// Every device present and permitted.
    pub fn granted() -> Self {
        Self {
            microphone: Availability::Granted,
            camera: Availability::Granted,
            screen: Availability::Granted,
            prompt_delay: Duration::ZERO,
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn with_microphone(mut self, a: Availability) -> Self {
        self.microphone = a;
        self
    }

    pub fn with_camera(mut self, a: Availability) -> Self {
        self.camera = a;
        self
    }

    pub fn with_screen(mut self, a: Availability) -> Self {
        self.screen = a;
        self
    }

    /// Simulate a permission prompt that takes `delay` to answer.
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    /// Every track handed out so far.
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn issue(&self, kind: TrackKind, source: TrackSource, label: &str) -> MediaTrack {
        let track = MediaTrack::new(kind, source, label);
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(track.clone());
        track
    }

    async fn prompt(&self) {
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        self.prompt().await;
        if constraints.audio {
            self.microphone.check(DeviceKind::Microphone)?;
        }
        if constraints.video {
            self.camera.check(DeviceKind::Camera)?;
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.issue(TrackKind::Audio, TrackSource::Microphone, "Synthetic microphone"));
        }
        if constraints.video {
            tracks.push(self.issue(TrackKind::Video, TrackSource::Camera, "Synthetic camera"));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaTrack, MediaAccessError> {
        self.prompt().await;
        self.screen.check(DeviceKind::Screen)?;
        Ok(self.issue(TrackKind::Video, TrackSource::Screen, "Synthetic screen"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_idempotent() {
        let track = MediaTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic");
        assert!(track.is_live());
        track.stop();
        track.stop();
        assert_eq!(track.ready_state(), ReadyState::Ended);
    }

    #[test]
    fn test_clones_share_state() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam");
        let other = track.clone();
        other.set_enabled(false);
        assert!(!track.enabled());
        assert_eq!(track, other);
        assert_ne!(track, MediaTrack::new(TrackKind::Video, TrackSource::Camera, "cam"));
    }

    #[tokio::test]
    async fn test_ended_wakes_on_stop() {
        let track = MediaTrack::new(TrackKind::Video, TrackSource::Screen, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        tokio::task::yield_now().await;
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already ended resolves immediately.
        track.ended().await;
    }

    #[tokio::test]
    async fn test_synthetic_policy() {
        let devices = SyntheticDevices::granted().with_camera(Availability::Busy);
        let audio_only = devices
            .get_user_media(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(audio_only.audio_tracks().count(), 1);
        assert_eq!(audio_only.video_tracks().count(), 0);

        let err = devices
            .get_user_media(MediaConstraints {
                audio: true,
                video: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err, MediaAccessError::DeviceBusy(DeviceKind::Camera));
        // A refused request issues nothing.
        assert_eq!(devices.issued_tracks().len(), 1);
    }
}
