//! Typed failures of the calling core.

use thiserror::Error;

use super::relay::SignalType;
use super::transport::TransportError;
use super::ConnectionState;

/// Capture device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Microphone,
    Camera,
    Screen,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Microphone => f.write_str("microphone"),
            DeviceKind::Camera => f.write_str("camera"),
            DeviceKind::Screen => f.write_str("screen"),
        }
    }
}

/// Local media could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    #[error("{0} access was denied")]
    PermissionDenied(DeviceKind),
    #[error("no {0} found")]
    DeviceMissing(DeviceKind),
    #[error("{0} is in use by another application")]
    DeviceBusy(DeviceKind),
}

impl MediaAccessError {
    /// Message shown on the call screen.
    pub fn user_message(&self) -> String {
        match self {
            MediaAccessError::PermissionDenied(d) => format!(
                "Permission to use your {} was denied. Allow access and try again.",
                d
            ),
            MediaAccessError::DeviceMissing(d) => {
                format!("No {} was found. Connect one and try again.", d)
            }
            MediaAccessError::DeviceBusy(d) => format!(
                "Your {} is being used by another application. Close it and try again.",
                d
            ),
        }
    }
}

/// Errors surfaced by a call session.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("could not deliver {kind} signal: {reason}")]
    SignalDelivery { kind: SignalType, reason: String },

    #[error("connection lost ({0})")]
    ConnectionLost(ConnectionState),

    #[error("signal relay error: {0}")]
    Relay(String),

    #[error("{0}")]
    Unavailable(String),
}

impl CallError {
    /// Message shown on the call screen.
    pub fn user_message(&self) -> String {
        match self {
            CallError::MediaAccess(e) => e.user_message(),
            CallError::Negotiation(_) => "Could not set up the call connection.".to_string(),
            CallError::SignalDelivery { .. } => {
                "Could not reach the other participant. Check your connection.".to_string()
            }
            CallError::ConnectionLost(_) => "Connection lost. Trying to reconnect...".to_string(),
            CallError::Relay(_) => "Call signaling is unavailable.".to_string(),
            CallError::Unavailable(msg) => msg.clone(),
        }
    }

    /// Whether the call attempt is over.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CallError::ConnectionLost(_))
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        CallError::Negotiation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_errors_have_distinct_messages() {
        let denied = MediaAccessError::PermissionDenied(DeviceKind::Camera).user_message();
        let missing = MediaAccessError::DeviceMissing(DeviceKind::Camera).user_message();
        let busy = MediaAccessError::DeviceBusy(DeviceKind::Camera).user_message();
        assert_ne!(denied, missing);
        assert_ne!(missing, busy);
        assert_ne!(denied, busy);
        assert!(denied.contains("camera"));
    }

    #[test]
    fn test_transport_errors_become_negotiation_errors() {
        let err: CallError = TransportError::Closed.into();
        assert!(matches!(err, CallError::Negotiation(_)));
        assert!(err.is_fatal());
        assert!(!CallError::ConnectionLost(ConnectionState::Failed).is_fatal());
    }
}
