//! Voice and video calling.
//!
//! Signaling is relayed through inserts into the `call_signals` table
//! ([`relay`]), media paths are negotiated by a [`peer::PeerConnection`]
//! over a pluggable [`transport::PeerTransport`], and one
//! [`session::CallSession`] drives a call from media acquisition to hangup.

#[cfg(any(feature = "audio", feature = "video-capture"))]
pub mod devices;
pub mod error;
pub mod ice;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod records;
pub mod relay;
pub mod sdp;
pub mod session;
pub mod transport;
pub mod udp;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::DataStore;

pub use error::CallError;
pub use session::{CallSession, CallView};

/// Identifier shared by both participants of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the offer/answer exchange we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates and sends the offer.
    Initiator,
    /// Waits for the offer and answers it.
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Media carried by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Voice only.
    Audio,
    /// Voice and camera.
    AudioVideo,
}

impl MediaKind {
    pub fn has_video(self) -> bool {
        matches!(self, MediaKind::AudioVideo)
    }

    /// `call_type` column value for call records.
    pub fn as_call_type(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::AudioVideo => "video",
        }
    }

    pub fn from_call_type(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::AudioVideo),
            _ => None,
        }
    }
}

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `new → connecting → connected ⇄ disconnected`, `failed` from any
    /// non-closed state, `closed` from anywhere. Staying put is not a
    /// transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (_, Failed) => true,
            (New, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) => true,
            (Disconnected, Connecting) => true,
            _ => false,
        }
    }

    /// Whether the transport has given up or been shut down.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-call tunables derived from the config file.
#[derive(Debug, Clone, Default)]
pub struct CallSettings {
    pub rtc: transport::RtcConfig,
    pub signal_retry: relay::RetryPolicy,
}

/// Collaborators shared by every call on this client.
///
/// Built once at startup and handed to each [`CallSession`].
#[derive(Clone)]
pub struct CallContext {
    pub store: Arc<dyn DataStore>,
    /// Local user id; used as `sender_id` and for echo suppression.
    pub self_id: String,
    pub devices: Arc<dyn media::MediaDevices>,
    pub transports: Arc<dyn transport::TransportFactory>,
    pub settings: CallSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_forward_path_is_legal() {
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
    }

    #[test]
    fn test_shortcuts_and_repeats_are_rejected() {
        assert!(!New.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Connected));
    }

    #[test]
    fn test_failed_reachable_from_any_open_state() {
        for s in [New, Connecting, Connected, Disconnected] {
            assert!(s.can_transition_to(Failed), "{} -> failed", s);
        }
        assert!(Failed.can_transition_to(Closed));
    }

    #[test]
    fn test_call_type_mapping() {
        assert_eq!(MediaKind::from_call_type("video"), Some(MediaKind::AudioVideo));
        assert_eq!(MediaKind::Audio.as_call_type(), "audio");
        assert_eq!(MediaKind::from_call_type("fax"), None);
    }
}
