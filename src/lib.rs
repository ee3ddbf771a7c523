//! Peer-mesh signaling and media-session core for live classrooms.
//!
//! Every participant keeps one RTCPeerConnection per remote peer, negotiated
//! over a JSON WebSocket signaling channel. The [`session::RoomSession`]
//! controller owns the moving parts: capture via [`capture`], the connection
//! registry in [`registry`], SDP/ICE exchange in [`negotiation`], and the
//! signaling transport in [`signaling`].

pub mod capture;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod negotiation;
pub mod registry;
pub mod session;
pub mod signaling;

pub use capture::{CpalDevices, LocalTrack, ManualDevices, MediaCaptureManager, MediaDevices};
pub use connection::{PeerMonitor, PeerStatus, PresenceState};
pub use error::{Error, Result};
pub use metrics::{ConnectionQuality, QualityMonitor};
pub use negotiation::NegotiationEngine;
pub use registry::{PeerEvent, PeerHandle, PeerRegistry};
pub use session::{Participant, RoomEvent, RoomSession, SessionPhase};
pub use signaling::{
    ParticipantInfo, SignalMessage, SignalingTransport, TransportStatus, WebSocketTransport,
};
