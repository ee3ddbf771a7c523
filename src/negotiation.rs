use std::sync::Arc;

use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::capture::MediaCaptureManager;
use crate::error::{Error, Result};
use crate::registry::{PeerHandle, PeerRegistry};
use crate::signaling::{SignalMessage, SignalingTransport};

/// Drives the offer/answer/ICE exchange for one peer pair at a time.
///
/// Glare is avoided by convention, not rollback: the party that sent
/// `user-ready` never offers, so each pair has exactly one offering
/// direction. An offer that still arrives while a local offer is pending is
/// logged and dropped.
pub struct NegotiationEngine {
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn SignalingTransport>,
    media: Arc<MediaCaptureManager>,
    local_id: String,
    display_name: String,
}

impl NegotiationEngine {
    pub fn new(
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn SignalingTransport>,
        media: Arc<MediaCaptureManager>,
        local_id: String,
        display_name: String,
    ) -> Self {
        Self {
            registry,
            transport,
            media,
            local_id,
            display_name,
        }
    }

    /// Creates and sends an offer toward the peer. Requires local media to
    /// be attached first.
    pub async fn initiate_offer(&self, room_id: &str, peer_id: &str) -> Result<()> {
        let tracks = self.media.local_tracks().await;
        if tracks.is_empty() {
            return Err(Error::NoLocalMedia);
        }

        let handle = self.registry.get_or_create(peer_id, &tracks).await?;
        let _guard = handle.negotiation.lock().await;

        let offer = handle.pc.create_offer(None).await?;
        handle.pc.set_local_description(offer.clone()).await?;
        handle.monitor().mark_ready();
        debug!(peer = peer_id, "sending offer");

        self.transport
            .send(SignalMessage::WebrtcOffer {
                room_id: room_id.to_string(),
                offer,
                sender: self.local_id.clone(),
                sender_name: self.display_name.clone(),
                receiver: peer_id.to_string(),
            })
            .await
    }

    /// Answers a remote offer, lazily creating the connection when none
    /// exists yet.
    pub async fn handle_offer(
        &self,
        room_id: &str,
        peer_id: &str,
        offer: RTCSessionDescription,
    ) -> Result<()> {
        let tracks = self.media.local_tracks().await;
        let handle = self.registry.get_or_create(peer_id, &tracks).await?;
        let _guard = handle.negotiation.lock().await;

        if handle.signaling_state() == RTCSignalingState::HaveLocalOffer {
            warn!(peer = peer_id, "offer received while offering (glare); dropping");
            return Ok(());
        }

        handle.pc.set_remote_description(offer).await?;
        flush_pending_candidates(&handle).await;

        let answer = handle.pc.create_answer(None).await?;
        handle.pc.set_local_description(answer.clone()).await?;
        handle.monitor().mark_ready();
        debug!(peer = peer_id, "sending answer");

        self.transport
            .send(SignalMessage::WebrtcAnswer {
                room_id: room_id.to_string(),
                answer,
                sender: self.local_id.clone(),
                receiver: peer_id.to_string(),
            })
            .await
    }

    /// Applies a remote answer. Unknown or duplicate answers are dropped;
    /// signaling is at-least-once and stale messages must not fail the
    /// engine.
    pub async fn handle_answer(&self, peer_id: &str, answer: RTCSessionDescription) -> Result<()> {
        let Some(handle) = self.registry.get(peer_id).await else {
            debug!(peer = peer_id, "answer for unknown peer; dropping");
            return Ok(());
        };
        let _guard = handle.negotiation.lock().await;

        if handle.signaling_state() != RTCSignalingState::HaveLocalOffer {
            debug!(peer = peer_id, "unexpected answer; dropping");
            return Ok(());
        }

        handle.pc.set_remote_description(answer).await?;
        flush_pending_candidates(&handle).await;
        Ok(())
    }

    /// Adds a remote ICE candidate, buffering it until a remote description
    /// exists. A candidate for a peer with no connection is dropped.
    pub async fn handle_remote_candidate(
        &self,
        peer_id: &str,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let Some(handle) = self.registry.get(peer_id).await else {
            debug!(peer = peer_id, "candidate for unknown peer; dropping");
            return Ok(());
        };
        let _guard = handle.negotiation.lock().await;

        if handle.pc.remote_description().await.is_none() {
            handle.push_pending_candidate(candidate);
            return Ok(());
        }
        if let Err(e) = handle.pc.add_ice_candidate(candidate).await {
            warn!(peer = peer_id, error = %e, "failed to add ICE candidate");
        }
        Ok(())
    }
}

async fn flush_pending_candidates(handle: &PeerHandle) {
    for candidate in handle.drain_pending_candidates() {
        if let Err(e) = handle.pc.add_ice_candidate(candidate).await {
            warn!(peer = handle.id(), error = %e, "failed to add buffered ICE candidate");
        }
    }
}
