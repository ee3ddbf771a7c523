use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Presence of a remote participant as seen by the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    Joining,
    Ready,
    Connected,
    Disconnected,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceState::Joining => write!(f, "Joining"),
            PresenceState::Ready => write!(f, "Ready"),
            PresenceState::Connected => write!(f, "Connected"),
            PresenceState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Snapshot of one peer's connectivity, published over a watch channel.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub presence: PresenceState,
    pub ice_state: RTCIceConnectionState,
    pub peer_state: RTCPeerConnectionState,
    pub last_error: Option<String>,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self {
            presence: PresenceState::Joining,
            ice_state: RTCIceConnectionState::New,
            peer_state: RTCPeerConnectionState::New,
            last_error: None,
        }
    }
}

/// Per-peer connectivity monitor.
///
/// Updated from the RTCPeerConnection state callbacks; the UI layer
/// subscribes to the watch side.
#[derive(Clone)]
pub struct PeerMonitor {
    status: Arc<watch::Sender<PeerStatus>>,
    receiver: watch::Receiver<PeerStatus>,
}

impl PeerMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(PeerStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn mark_ready(&self) {
        self.status.send_modify(|status| {
            if status.presence == PresenceState::Joining {
                status.presence = PresenceState::Ready;
            }
        });
    }

    pub fn update_peer_state(&self, state: RTCPeerConnectionState) {
        self.status.send_modify(|status| {
            status.peer_state = state;
            status.presence = match state {
                RTCPeerConnectionState::Connected => PresenceState::Connected,
                RTCPeerConnectionState::Failed
                | RTCPeerConnectionState::Closed
                | RTCPeerConnectionState::Disconnected => PresenceState::Disconnected,
                _ => status.presence,
            };
        });
    }

    pub fn update_ice_state(&self, state: RTCIceConnectionState) {
        self.status.send_modify(|status| {
            status.ice_state = state;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
            status.presence = PresenceState::Disconnected;
        });
    }

    pub fn presence(&self) -> PresenceState {
        self.receiver.borrow().presence
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.receiver.clone()
    }
}

impl Default for PeerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
