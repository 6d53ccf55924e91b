//! The peer-to-peer transport seam.
//!
//! A [`PeerTransport`] negotiates a media path with one remote peer through
//! offer/answer descriptions and trickled ICE candidates, and reports what
//! happens on an event channel. [`crate::calling::loopback`] connects peers
//! inside one process; [`crate::calling::udp`] runs real ICE over UDP.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::media::{MediaStream, MediaTrack};
use super::ConnectionState;

/// One NAT-traversal server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Public STUN servers that need no credentials.
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
    ]
}

/// Transport construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// Offer or answer, as carried in `signal_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// A trickled candidate, as carried in `signal_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>, username_fragment: Option<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment,
        }
    }
}

/// Something the transport wants its owner to know.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate to trickle to the peer.
    LocalCandidate(IceCandidateInit),
    /// The peer's media became available.
    RemoteStream(MediaStream),
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// A negotiated media path to one remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Offer `track` to the peer in the next description.
    fn add_track(&self, track: MediaTrack) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    /// Requires a remote description.
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), TransportError>;

    /// Send `track` in place of the current outbound video, without
    /// renegotiating.
    fn replace_video_track(&self, track: MediaTrack) -> Result<(), TransportError>;

    fn outbound_video_track(&self) -> Option<MediaTrack>;

    /// Release the path. Idempotent.
    fn close(&self);
}

/// A freshly built transport and the receiving end of its events.
pub struct TransportHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &RtcConfig) -> Result<TransportHandle, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_wire_shape() {
        let desc = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "v=0\r\n".into(),
        };
        assert_eq!(
            serde_json::to_value(&desc).unwrap(),
            json!({"type": "offer", "sdp": "v=0\r\n"})
        );
    }

    #[test]
    fn test_candidate_accepts_browser_shape() {
        let c: IceCandidateInit = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 192.168.1.5 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))
        .unwrap();
        assert_eq!(c.sdp_m_line_index, Some(0));
        assert_eq!(c.username_fragment.as_deref(), Some("abcd"));

        let bare: IceCandidateInit =
            serde_json::from_value(json!({"candidate": "candidate:1 1 udp 1 h 1 typ host"})).unwrap();
        assert!(bare.sdp_mid.is_none());
    }

    #[test]
    fn test_default_servers_are_stun() {
        assert!(default_ice_servers()
            .iter()
            .all(|s| s.urls.iter().all(|u| u.starts_with("stun:"))));
    }
}
