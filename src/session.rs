use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::capture::{LocalTrack, MediaCaptureManager, MediaDevices};
use crate::connection::PresenceState;
use crate::error::{Error, Result};
use crate::negotiation::NegotiationEngine;
use crate::registry::{PeerEvent, PeerHandle, PeerRegistry};
use crate::signaling::{ParticipantInfo, SignalMessage, SignalingTransport, TransportStatus};

/// Lifecycle of the local participant within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Active,
    Leaving,
}

/// One remote participant in the roster.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub profile_img: Option<String>,
    pub presence: PresenceState,
}

/// Events the application consumes to render the room.
pub enum RoomEvent {
    Joined {
        room_id: String,
        class_name: String,
        description: String,
    },
    ParticipantJoined(Participant),
    ParticipantLeft {
        user_id: String,
    },
    RosterUpdated(Vec<Participant>),
    RemoteTrack {
        user_id: String,
        track: Arc<TrackRemote>,
    },
    SignalingLost,
    SignalingRestored,
}

struct SessionState {
    phase: SessionPhase,
    room_id: Option<String>,
    roster: HashMap<String, Participant>,
    driver: Option<JoinHandle<()>>,
}

/// The room controller: owns the peer registry, the capture manager and the
/// negotiation engine, and drives them from signaling and peer events.
///
/// All signaling for a given room epoch is handled by a single driver task,
/// so message handling never races with itself. `join` starts a new epoch;
/// continuations from an older epoch are discarded.
pub struct RoomSession {
    transport: Arc<dyn SignalingTransport>,
    media: Arc<MediaCaptureManager>,
    registry: Arc<PeerRegistry>,
    engine: NegotiationEngine,
    local_id: String,
    display_name: String,
    state: StdMutex<SessionState>,
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<RoomEvent>,
    peer_events: Arc<TokioMutex<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl RoomSession {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        local_id: String,
        display_name: String,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RoomEvent>)> {
        let (registry, peer_rx) = PeerRegistry::new()?;
        let media = Arc::new(MediaCaptureManager::new(devices));
        let engine = NegotiationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&media),
            local_id.clone(),
            display_name.clone(),
        );
        let (events, event_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            transport,
            media,
            registry,
            engine,
            local_id,
            display_name,
            state: StdMutex::new(SessionState {
                phase: SessionPhase::Idle,
                room_id: None,
                roster: HashMap::new(),
                driver: None,
            }),
            epoch: AtomicU64::new(0),
            events,
            peer_events: Arc::new(TokioMutex::new(peer_rx)),
        });
        Ok((session, event_rx))
    }

    /// Joins a room and starts the driver task for this epoch. Fails when
    /// the session is not idle.
    pub async fn join(self: &Arc<Self>, room_id: &str) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.phase != SessionPhase::Idle {
                return Err(Error::InvalidState(format!(
                    "cannot join while {:?}",
                    state.phase
                )));
            }
            state.phase = SessionPhase::Joining;
            state.room_id = Some(room_id.to_string());
        }

        self.registry.open().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let join = SignalMessage::JoinRoom {
            room_id: room_id.to_string(),
            user_id: self.local_id.clone(),
        };
        if let Err(e) = self.transport.send(join).await {
            let mut state = self.lock_state();
            state.phase = SessionPhase::Idle;
            state.room_id = None;
            return Err(e);
        }

        let driver = tokio::spawn(drive(
            Arc::downgrade(self),
            Arc::clone(&self.transport),
            Arc::clone(&self.peer_events),
            epoch,
        ));
        let old = {
            let mut state = self.lock_state();
            state.driver.replace(driver)
        };
        if let Some(old) = old {
            old.abort();
        }
        info!(room = room_id, user = %self.local_id, "joining room");
        Ok(())
    }

    /// Leaves the room and tears everything down: notifies the server on a
    /// best-effort basis, closes every peer connection and releases capture
    /// devices. Safe to call more than once.
    pub async fn leave(&self) -> Result<()> {
        let (room_id, driver) = {
            let mut state = self.lock_state();
            if state.phase == SessionPhase::Idle {
                return Ok(());
            }
            state.phase = SessionPhase::Leaving;
            (state.room_id.take(), state.driver.take())
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(room_id) = room_id.as_deref() {
            let msg = SignalMessage::LeaveRoom {
                room_id: room_id.to_string(),
            };
            if let Err(e) = self.transport.send(msg).await {
                debug!(error = %e, "leave notification not delivered");
            }
        }
        if let Some(driver) = driver {
            driver.abort();
        }

        self.registry.remove_all().await;
        self.media.release_all().await;

        let mut state = self.lock_state();
        state.roster.clear();
        state.phase = SessionPhase::Idle;
        info!(user = %self.local_id, "left room");
        Ok(())
    }

    /// Opens camera and microphone capture. Must happen before this side can
    /// offer; answering works without it (receive-only).
    pub async fn acquire_local_media(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<Vec<Arc<LocalTrack>>> {
        self.media.acquire_local_stream(video, audio).await
    }

    pub async fn toggle_audio(&self) -> bool {
        self.media.toggle_track_kind(RTPCodecType::Audio).await
    }

    pub async fn toggle_video(&self) -> bool {
        self.media.toggle_track_kind(RTPCodecType::Video).await
    }

    pub async fn start_screen_share(&self) -> Result<Arc<LocalTrack>> {
        self.media.start_screen_share(&self.registry).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.media.stop_screen_share(&self.registry).await
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    pub fn roster(&self) -> Vec<Participant> {
        let mut roster: Vec<Participant> = self.lock_state().roster.values().cloned().collect();
        roster.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        roster
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.registry.peer_ids().await
    }

    pub async fn peer(&self, user_id: &str) -> Option<Arc<PeerHandle>> {
        self.registry.get(user_id).await
    }

    pub async fn remote_tracks(&self, user_id: &str) -> Vec<Arc<TrackRemote>> {
        match self.registry.get(user_id).await {
            Some(handle) => handle.remote_tracks(),
            None => Vec::new(),
        }
    }

    pub fn media(&self) -> &Arc<MediaCaptureManager> {
        &self.media
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_room(&self) -> Option<String> {
        self.lock_state().room_id.clone()
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    async fn dispatch_signal(&self, msg: SignalMessage) {
        if let Some(msg_room) = msg.room_id() {
            let current = self.current_room();
            if current.as_deref() != Some(msg_room) {
                debug!(room = msg_room, "message for another room; dropping");
                return;
            }
        }

        match msg {
            SignalMessage::RoomJoined {
                room_id,
                class_name,
                description,
                participants,
            } => self.on_room_joined(room_id, class_name, description, participants).await,
            SignalMessage::UserJoined {
                user_id,
                username,
                profile_img,
                ..
            } => self.on_user_joined(user_id, username, profile_img),
            SignalMessage::UserReady {
                user_id, username, ..
            } => self.on_user_ready(user_id, username).await,
            SignalMessage::WebrtcOffer {
                room_id,
                offer,
                sender,
                sender_name,
                receiver,
            } => {
                if receiver != self.local_id {
                    return;
                }
                self.ensure_in_roster(&sender, &sender_name);
                if let Err(e) = self.engine.handle_offer(&room_id, &sender, offer).await {
                    warn!(peer = %sender, error = %e, "offer handling failed");
                }
            }
            SignalMessage::WebrtcAnswer {
                answer,
                sender,
                receiver,
                ..
            } => {
                if receiver != self.local_id {
                    return;
                }
                if let Err(e) = self.engine.handle_answer(&sender, answer).await {
                    warn!(peer = %sender, error = %e, "answer handling failed");
                }
            }
            SignalMessage::WebrtcIceCandidate {
                candidate,
                sender,
                receiver,
                ..
            } => {
                if receiver != self.local_id {
                    return;
                }
                if let Err(e) = self.engine.handle_remote_candidate(&sender, candidate).await {
                    warn!(peer = %sender, error = %e, "candidate handling failed");
                }
            }
            SignalMessage::UserDisconnected { user_id } => {
                self.on_user_disconnected(&user_id).await;
            }
            SignalMessage::ParticipantsUpdated { participants } => {
                self.reconcile_roster(participants);
            }
            SignalMessage::JoinRoom { .. } | SignalMessage::LeaveRoom { .. } => {
                debug!("client-bound message echoed back; ignoring");
            }
        }
    }

    async fn on_room_joined(
        &self,
        room_id: String,
        class_name: String,
        description: String,
        participants: Vec<ParticipantInfo>,
    ) {
        {
            let mut state = self.lock_state();
            state.phase = SessionPhase::Active;
            state.roster.clear();
            for p in participants {
                if p.user_id == self.local_id {
                    continue;
                }
                state.roster.insert(
                    p.user_id.clone(),
                    Participant {
                        user_id: p.user_id,
                        username: p.username,
                        profile_img: p.profile_img,
                        presence: PresenceState::Joining,
                    },
                );
            }
        }
        info!(room = %room_id, class = %class_name, "room joined");
        self.emit(RoomEvent::Joined {
            room_id: room_id.clone(),
            class_name,
            description,
        });
        self.emit(RoomEvent::RosterUpdated(self.roster()));

        // Announce readiness. By convention the announcer never offers;
        // participants that already hold local media offer toward us.
        let ready = SignalMessage::UserReady {
            room_id: Some(room_id),
            user_id: None,
            username: self.display_name.clone(),
        };
        if let Err(e) = self.transport.send(ready).await {
            warn!(error = %e, "could not announce readiness");
        }
    }

    fn on_user_joined(&self, user_id: String, username: String, profile_img: Option<String>) {
        if user_id == self.local_id {
            return;
        }
        let participant = Participant {
            user_id: user_id.clone(),
            username,
            profile_img,
            presence: PresenceState::Joining,
        };
        self.lock_state()
            .roster
            .insert(user_id, participant.clone());
        self.emit(RoomEvent::ParticipantJoined(participant));
    }

    async fn on_user_ready(&self, user_id: Option<String>, username: String) {
        let Some(user_id) = user_id else {
            debug!("ready announcement without a user id; dropping");
            return;
        };
        if user_id == self.local_id {
            return;
        }
        {
            let mut state = self.lock_state();
            state
                .roster
                .entry(user_id.clone())
                .or_insert_with(|| Participant {
                    user_id: user_id.clone(),
                    username: username.clone(),
                    profile_img: None,
                    presence: PresenceState::Joining,
                })
                .presence = PresenceState::Ready;
        }

        if !self.media.has_local_media().await {
            debug!(peer = %user_id, "no local media yet; not offering");
            return;
        }
        // At-least-once signaling: a repeated announcement must not spawn a
        // second connection.
        if self.registry.get(&user_id).await.is_some() {
            debug!(peer = %user_id, "connection already exists; not offering");
            return;
        }
        let Some(room_id) = self.current_room() else {
            return;
        };
        if let Err(e) = self.engine.initiate_offer(&room_id, &user_id).await {
            warn!(peer = %user_id, error = %e, "offer initiation failed");
        }
    }

    async fn on_user_disconnected(&self, user_id: &str) {
        self.registry.remove(user_id).await;
        let removed = self.lock_state().roster.remove(user_id).is_some();
        if removed {
            self.emit(RoomEvent::ParticipantLeft {
                user_id: user_id.to_string(),
            });
        }
    }

    fn ensure_in_roster(&self, user_id: &str, username: &str) {
        self.lock_state()
            .roster
            .entry(user_id.to_string())
            .or_insert_with(|| Participant {
                user_id: user_id.to_string(),
                username: username.to_string(),
                profile_img: None,
                presence: PresenceState::Joining,
            });
    }

    fn reconcile_roster(&self, participants: Vec<ParticipantInfo>) {
        {
            let mut state = self.lock_state();
            let mut next = HashMap::new();
            for p in participants {
                if p.user_id == self.local_id {
                    continue;
                }
                let presence = state
                    .roster
                    .get(&p.user_id)
                    .map(|existing| existing.presence)
                    .unwrap_or(PresenceState::Joining);
                next.insert(
                    p.user_id.clone(),
                    Participant {
                        user_id: p.user_id,
                        username: p.username,
                        profile_img: p.profile_img,
                        presence,
                    },
                );
            }
            state.roster = next;
        }
        self.emit(RoomEvent::RosterUpdated(self.roster()));
    }

    async fn dispatch_peer(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { peer_id, candidate } => {
                let Some(room_id) = self.current_room() else {
                    return;
                };
                let msg = SignalMessage::WebrtcIceCandidate {
                    room_id,
                    candidate,
                    sender: self.local_id.clone(),
                    receiver: peer_id,
                };
                if let Err(e) = self.transport.send(msg).await {
                    debug!(error = %e, "local candidate not delivered");
                }
            }
            PeerEvent::RemoteTrack { peer_id, track } => {
                if let Some(p) = self.lock_state().roster.get_mut(&peer_id) {
                    p.presence = PresenceState::Connected;
                }
                self.emit(RoomEvent::RemoteTrack {
                    user_id: peer_id,
                    track,
                });
            }
            PeerEvent::ConnectionFailed { peer_id } => {
                warn!(peer = %peer_id, "peer connection failed");
                self.on_user_disconnected(&peer_id).await;
            }
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Some(driver) = self.lock_state().driver.take() {
            driver.abort();
        }
    }
}

async fn drive(
    session: Weak<RoomSession>,
    transport: Arc<dyn SignalingTransport>,
    peer_events: Arc<TokioMutex<mpsc::UnboundedReceiver<PeerEvent>>>,
    epoch: u64,
) {
    let mut status = transport.status();
    let mut status_alive = true;
    let mut peer_rx = peer_events.lock().await;

    loop {
        tokio::select! {
            msg = transport.recv() => {
                let Some(session) = session.upgrade() else { return };
                if session.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match msg {
                    Some(msg) => session.dispatch_signal(msg).await,
                    None => {
                        session.emit(RoomEvent::SignalingLost);
                        return;
                    }
                }
            }
            event = peer_rx.recv() => {
                let Some(session) = session.upgrade() else { return };
                if session.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match event {
                    Some(event) => session.dispatch_peer(event).await,
                    None => return,
                }
            }
            changed = status.changed(), if status_alive => {
                let Some(session) = session.upgrade() else { return };
                match changed {
                    Ok(()) => {
                        let current = *status.borrow_and_update();
                        match current {
                            TransportStatus::Connected => {
                                session.emit(RoomEvent::SignalingRestored);
                            }
                            TransportStatus::Reconnecting | TransportStatus::Closed => {
                                session.emit(RoomEvent::SignalingLost);
                            }
                        }
                    }
                    Err(_) => status_alive = false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ManualDevices;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::watch;

    struct NullTransport {
        sent: StdMutex<Vec<SignalMessage>>,
        status: watch::Receiver<TransportStatus>,
        _status_tx: watch::Sender<TransportStatus>,
    }

    impl NullTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = watch::channel(TransportStatus::Connected);
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                status: rx,
                _status_tx: tx,
            })
        }
    }

    #[async_trait]
    impl SignalingTransport for NullTransport {
        async fn send(&self, msg: SignalMessage) -> Result<()> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        async fn recv(&self) -> Option<SignalMessage> {
            std::future::pending().await
        }

        fn status(&self) -> watch::Receiver<TransportStatus> {
            self.status.clone()
        }
    }

    fn session() -> (Arc<RoomSession>, mpsc::UnboundedReceiver<RoomEvent>, Arc<NullTransport>) {
        let transport = NullTransport::new();
        let (session, events) = RoomSession::new(
            transport.clone(),
            Arc::new(ManualDevices),
            "alice".to_string(),
            "Alice".to_string(),
        )
        .unwrap();
        (session, events, transport)
    }

    #[tokio::test]
    async fn join_twice_is_rejected() {
        let (session, _events, _transport) = session();
        session.join("r1").await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Joining);
        assert!(matches!(
            session.join("r1").await,
            Err(Error::InvalidState(_))
        ));
        session.leave().await.unwrap();
    }

    #[tokio::test]
    async fn leave_when_idle_is_a_no_op() {
        let (session, _events, _transport) = session();
        assert!(session.leave().await.is_ok());
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn join_sends_join_room_and_leave_resets() {
        let (session, _events, transport) = session();
        session.join("r1").await.unwrap();
        {
            let sent = transport.sent.lock().unwrap();
            assert!(matches!(
                sent.first(),
                Some(SignalMessage::JoinRoom { room_id, user_id })
                    if room_id == "r1" && user_id == "alice"
            ));
        }

        session.leave().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.roster().is_empty());
        assert_eq!(session.peer_ids().await.len(), 0);
        {
            let sent = transport.sent.lock().unwrap();
            assert!(sent
                .iter()
                .any(|m| matches!(m, SignalMessage::LeaveRoom { room_id } if room_id == "r1")));
        }
    }

    #[tokio::test]
    async fn ready_without_user_id_does_not_offer() {
        let (session, _events, transport) = session();
        session.join("r1").await.unwrap();
        session.acquire_local_media(true, true).await.unwrap();

        session
            .dispatch_signal(SignalMessage::UserReady {
                room_id: Some("r1".to_string()),
                user_id: None,
                username: "Bob".to_string(),
            })
            .await;

        assert_eq!(session.peer_ids().await.len(), 0);
        let sent = transport.sent.lock().unwrap();
        assert!(!sent
            .iter()
            .any(|m| matches!(m, SignalMessage::WebrtcOffer { .. })));
    }

    #[tokio::test]
    async fn ready_from_peer_triggers_one_offer() {
        let (session, _events, transport) = session();
        session.join("r1").await.unwrap();
        session.acquire_local_media(true, true).await.unwrap();

        let ready = SignalMessage::UserReady {
            room_id: Some("r1".to_string()),
            user_id: Some("bob".to_string()),
            username: "Bob".to_string(),
        };
        session.dispatch_signal(ready.clone()).await;
        session.dispatch_signal(ready).await;

        assert_eq!(session.peer_ids().await, vec!["bob".to_string()]);
        let sent = transport.sent.lock().unwrap();
        let offers = sent
            .iter()
            .filter(|m| matches!(m, SignalMessage::WebrtcOffer { receiver, .. } if receiver == "bob"))
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn messages_for_other_rooms_are_dropped() {
        let (session, _events, _transport) = session();
        session.join("r1").await.unwrap();

        session
            .dispatch_signal(SignalMessage::RoomJoined {
                room_id: "r2".to_string(),
                class_name: "other".to_string(),
                description: String::new(),
                participants: vec![],
            })
            .await;

        assert_eq!(session.phase(), SessionPhase::Joining);
    }
}
