use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::capture::LocalTrack;
use crate::connection::PeerMonitor;
use crate::error::{Error, Result};
use crate::metrics::QualityMonitor;

pub const STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// How long a connection may sit in a non-connected state before it is
/// reported failed and torn down.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Events produced by peer connection callbacks, funneled into the session's
/// event loop.
pub enum PeerEvent {
    /// Trickle ICE: a local candidate ready to be sent to the peer.
    LocalCandidate {
        peer_id: String,
        candidate: RTCIceCandidateInit,
    },
    /// The peer's media arrived.
    RemoteTrack {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    /// The connection reached a terminal state or timed out negotiating.
    ConnectionFailed { peer_id: String },
}

/// One negotiated connection to a remote participant.
///
/// Owned exclusively by the registry; other components address it by
/// participant id. The negotiation mutex serializes description and
/// candidate operations per peer.
pub struct PeerHandle {
    id: String,
    pub(crate) pc: Arc<RTCPeerConnection>,
    video_sender: StdMutex<Option<Arc<RTCRtpSender>>>,
    remote_tracks: StdMutex<Vec<Arc<TrackRemote>>>,
    pending_candidates: StdMutex<Vec<RTCIceCandidateInit>>,
    pub(crate) negotiation: Mutex<()>,
    monitor: PeerMonitor,
    quality: QualityMonitor,
}

impl PeerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub fn monitor(&self) -> &PeerMonitor {
        &self.monitor
    }

    pub fn quality(&self) -> &QualityMonitor {
        &self.quality
    }

    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_tracks
            .lock()
            .map(|tracks| tracks.clone())
            .unwrap_or_default()
    }

    /// Id of the track currently attached to the outbound video sender.
    pub async fn outbound_video_track_id(&self) -> Option<String> {
        let sender = self.video_sender()?;
        let track = sender.track().await?;
        Some(track.id().to_string())
    }

    pub(crate) fn video_sender(&self) -> Option<Arc<RTCRtpSender>> {
        self.video_sender.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn push_pending_candidate(&self, candidate: RTCIceCandidateInit) {
        if let Ok(mut pending) = self.pending_candidates.lock() {
            pending.push(candidate);
        }
    }

    pub(crate) fn drain_pending_candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.pending_candidates
            .lock()
            .map(|mut pending| pending.drain(..).collect())
            .unwrap_or_default()
    }
}

struct PeerMap {
    entries: HashMap<String, Arc<PeerHandle>>,
    accepting: bool,
}

/// Sole owner of the participant-id → connection map.
///
/// `remove_all` flips `accepting` under the same lock that guards creation,
/// so no connection can be created mid-teardown.
pub struct PeerRegistry {
    api: API,
    peers: Mutex<PeerMap>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerRegistry {
    pub fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            api,
            peers: Mutex::new(PeerMap {
                entries: HashMap::new(),
                accepting: true,
            }),
            events: events_tx,
        });
        Ok((registry, events_rx))
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.lock().await.entries.get(peer_id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().await.entries.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.peers.lock().await.entries.len()
    }

    /// Returns the existing connection for the participant, or builds one:
    /// fixed STUN set, current local tracks attached, candidate/track/state
    /// callbacks wired into the event channel.
    pub async fn get_or_create(
        &self,
        peer_id: &str,
        local_tracks: &[Arc<LocalTrack>],
    ) -> Result<Arc<PeerHandle>> {
        let mut map = self.peers.lock().await;
        if !map.accepting {
            return Err(Error::SessionClosed);
        }
        if let Some(handle) = map.entries.get(peer_id) {
            return Ok(Arc::clone(handle));
        }

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let mut video_sender = None;
        for track in local_tracks {
            let sender = pc
                .add_track(track.rtc() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            if track.kind() == RTPCodecType::Video {
                video_sender = Some(sender);
            }
        }

        let quality = QualityMonitor::new(Arc::clone(&pc));
        let handle = Arc::new(PeerHandle {
            id: peer_id.to_string(),
            pc: Arc::clone(&pc),
            video_sender: StdMutex::new(video_sender),
            remote_tracks: StdMutex::new(Vec::new()),
            pending_candidates: StdMutex::new(Vec::new()),
            negotiation: Mutex::new(()),
            monitor: PeerMonitor::new(),
            quality,
        });

        self.wire_callbacks(&handle);
        handle.quality.start();
        self.spawn_negotiation_watchdog(&handle);

        map.entries.insert(peer_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Closes and forgets the participant's connection. No-op when absent.
    pub async fn remove(&self, peer_id: &str) {
        let handle = self.peers.lock().await.entries.remove(peer_id);
        if let Some(handle) = handle {
            debug!(peer = peer_id, "closing peer connection");
            if let Err(e) = handle.pc.close().await {
                debug!(peer = peer_id, error = %e, "error closing peer connection");
            }
        }
    }

    /// Closes every connection and refuses new creations until `open` is
    /// called again.
    pub async fn remove_all(&self) {
        let handles: Vec<Arc<PeerHandle>> = {
            let mut map = self.peers.lock().await;
            map.accepting = false;
            map.entries.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            if let Err(e) = handle.pc.close().await {
                debug!(peer = handle.id(), error = %e, "error closing peer connection");
            }
        }
    }

    /// Re-arms the registry for a new session epoch.
    pub async fn open(&self) {
        self.peers.lock().await.accepting = true;
    }

    /// Swaps the outbound video track in place on every connection
    /// (`replace_track`; no renegotiation). `None` stops sending video.
    pub async fn replace_outbound_video(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let handles: Vec<Arc<PeerHandle>> = {
            let map = self.peers.lock().await;
            map.entries.values().cloned().collect()
        };
        for handle in handles {
            let Some(sender) = handle.video_sender() else {
                continue;
            };
            let new_track = track
                .as_ref()
                .map(|t| t.rtc() as Arc<dyn TrackLocal + Send + Sync>);
            sender.replace_track(new_track).await?;
        }
        Ok(())
    }

    fn wire_callbacks(&self, handle: &Arc<PeerHandle>) {
        let pc = &handle.pc;

        let events = self.events.clone();
        let peer_id = handle.id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate {
                            peer_id,
                            candidate: init,
                        });
                    }
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "failed to serialize ICE candidate")
                    }
                }
            })
        }));

        let events = self.events.clone();
        let peer_id = handle.id.clone();
        let weak = Arc::downgrade(handle);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(handle) = weak.upgrade() else { return };
                    if let Ok(mut tracks) = handle.remote_tracks.lock() {
                        tracks.push(Arc::clone(&track));
                    }
                    debug!(peer = %peer_id, kind = %track.kind(), "remote track received");
                    let _ = events.send(PeerEvent::RemoteTrack { peer_id, track });
                })
            },
        ));

        let events = self.events.clone();
        let peer_id = handle.id.clone();
        let monitor = handle.monitor.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            monitor.update_peer_state(state);
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                debug!(peer = %peer_id, state = %state, "peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = events.send(PeerEvent::ConnectionFailed { peer_id });
                }
            })
        }));

        let monitor = handle.monitor.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            monitor.update_ice_state(state);
            Box::pin(async {})
        }));
    }

    fn spawn_negotiation_watchdog(&self, handle: &Arc<PeerHandle>) {
        let events = self.events.clone();
        let weak = Arc::downgrade(handle);
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_TIMEOUT).await;
            let Some(handle) = weak.upgrade() else { return };
            if handle.connection_state() != RTCPeerConnectionState::Connected {
                warn!(peer = handle.id(), "negotiation timed out");
                let _ = events.send(PeerEvent::ConnectionFailed {
                    peer_id: handle.id().to_string(),
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ManualDevices, MediaCaptureManager, MediaDevices};

    #[tokio::test]
    async fn get_or_create_reuses_existing_connection() {
        let (registry, _events) = PeerRegistry::new().unwrap();
        let first = registry.get_or_create("peer-a", &[]).await.unwrap();
        let second = registry.get_or_create("peer-a", &[]).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (registry, _events) = PeerRegistry::new().unwrap();
        registry.get_or_create("peer-a", &[]).await.unwrap();

        registry.remove("peer-a").await;
        assert!(registry.get("peer-a").await.is_none());

        // Absent id is a no-op, not an error.
        registry.remove("peer-a").await;
        registry.remove("never-existed").await;
    }

    #[tokio::test]
    async fn remove_all_blocks_new_creations_until_reopened() {
        let (registry, _events) = PeerRegistry::new().unwrap();
        registry.get_or_create("peer-a", &[]).await.unwrap();
        registry.get_or_create("peer-b", &[]).await.unwrap();

        registry.remove_all().await;
        assert_eq!(registry.count().await, 0);
        assert!(matches!(
            registry.get_or_create("peer-c", &[]).await,
            Err(Error::SessionClosed)
        ));

        registry.open().await;
        assert!(registry.get_or_create("peer-c", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn local_tracks_are_attached_on_creation() {
        let (registry, _events) = PeerRegistry::new().unwrap();
        let stream = ManualDevices.open_user_media(true, true).await.unwrap();
        let tracks = stream.tracks().to_vec();

        let handle = registry.get_or_create("peer-a", &tracks).await.unwrap();
        let camera_id = tracks
            .iter()
            .find(|t| t.kind() == RTPCodecType::Video)
            .map(|t| t.rtc().id().to_string())
            .unwrap();
        assert_eq!(
            handle.outbound_video_track_id().await.as_deref(),
            Some(camera_id.as_str())
        );
    }

    #[tokio::test]
    async fn screen_share_swaps_video_track_without_renegotiation() {
        let (registry, _events) = PeerRegistry::new().unwrap();
        let manager = Arc::new(MediaCaptureManager::new(Arc::new(ManualDevices)));
        let tracks = manager.acquire_local_stream(true, true).await.unwrap();
        let handle = registry.get_or_create("peer-a", &tracks).await.unwrap();

        let camera_id = manager.camera_track().await.unwrap().rtc().id().to_string();
        assert_eq!(handle.signaling_state(), RTCSignalingState::Stable);

        let screen = manager.start_screen_share(&registry).await.unwrap();
        assert_eq!(
            handle.outbound_video_track_id().await.as_deref(),
            Some(screen.rtc().id())
        );
        assert_eq!(handle.signaling_state(), RTCSignalingState::Stable);

        manager.stop_screen_share(&registry).await.unwrap();
        assert_eq!(
            handle.outbound_video_track_id().await.as_deref(),
            Some(camera_id.as_str())
        );
        assert_eq!(handle.signaling_state(), RTCSignalingState::Stable);
    }

    #[tokio::test]
    async fn ended_screen_capture_stops_share_automatically() {
        let (registry, _events) = PeerRegistry::new().unwrap();
        let manager = Arc::new(MediaCaptureManager::new(Arc::new(ManualDevices)));
        let tracks = manager.acquire_local_stream(true, true).await.unwrap();
        registry.get_or_create("peer-a", &tracks).await.unwrap();

        let screen = manager.start_screen_share(&registry).await.unwrap();
        assert!(manager.screen_active().await);

        // Platform reports the user stopped sharing.
        screen.end();
        for _ in 0..50 {
            if !manager.screen_active().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.screen_active().await);
    }
}
