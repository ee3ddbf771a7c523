use std::fmt;

use anyhow::Error as AnyhowError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Error taxonomy for the classroom session core.
///
/// Device and capture failures are surfaced to the caller; signaling races
/// (duplicate answers, late candidates, stale epochs) are recovered locally
/// and never reach this type.
#[derive(Debug)]
pub enum Error {
    /// The platform rejected access to a capture device.
    PermissionDenied(String),
    /// No capture backend or device exists for the requested media kind.
    DeviceUnavailable(String),
    /// A capture device was found but opening or reading it failed.
    CaptureFailed(String),
    /// Negotiation was attempted before any local media was acquired.
    NoLocalMedia,
    /// The signaling transport is not connected.
    SignalingUnavailable(String),
    /// The operation does not apply to the session's current phase.
    InvalidState(String),
    /// The registry refused to create a connection during teardown.
    SessionClosed,
    /// A peer connection reached a terminal failed state.
    PeerConnectionFailed(String),
    WebRTC(WebRTCError),
    Ws(WsError),
    Json(serde_json::Error),
    Other(AnyhowError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PermissionDenied(what) => write!(f, "permission denied: {}", what),
            Error::DeviceUnavailable(what) => write!(f, "device unavailable: {}", what),
            Error::CaptureFailed(what) => write!(f, "capture failed: {}", what),
            Error::NoLocalMedia => write!(f, "no local media acquired"),
            Error::SignalingUnavailable(why) => write!(f, "signaling unavailable: {}", why),
            Error::InvalidState(why) => write!(f, "invalid session state: {}", why),
            Error::SessionClosed => write!(f, "session is closed"),
            Error::PeerConnectionFailed(peer) => write!(f, "peer connection failed: {}", peer),
            Error::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            Error::Ws(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Other(e) => write!(f, "error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<WebRTCError> for Error {
    fn from(err: WebRTCError) -> Self {
        Error::WebRTC(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::Ws(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<AnyhowError> for Error {
    fn from(err: AnyhowError) -> Self {
        Error::Other(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
