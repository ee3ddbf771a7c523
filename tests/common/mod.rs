//! In-process signaling server used by the integration tests. Routes the
//! same JSON message set a real deployment would, minus the WebSocket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};

use classroom_rtc::{
    ParticipantInfo, Result, SignalMessage, SignalingTransport, TransportStatus,
};

struct Client {
    username: String,
    inbox: mpsc::UnboundedSender<SignalMessage>,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<String, Client>,
    rooms: HashMap<String, Vec<String>>,
}

/// Routes signaling between connected transports the way the classroom
/// server does: join/ready fan out within a room, offers/answers/candidates
/// go point to point, and the server stamps the sender id on `user-ready`.
#[derive(Default)]
pub struct Hub {
    inner: StdMutex<HubInner>,
    log: StdMutex<Vec<SignalMessage>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>, user_id: &str, username: &str) -> Arc<HubTransport> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TransportStatus::Connected);
        self.inner.lock().unwrap().clients.insert(
            user_id.to_string(),
            Client {
                username: username.to_string(),
                inbox: inbox_tx,
            },
        );
        Arc::new(HubTransport {
            hub: Arc::clone(self),
            user_id: user_id.to_string(),
            username: username.to_string(),
            inbox: TokioMutex::new(inbox_rx),
            status: status_rx,
            status_tx,
        })
    }

    /// Pushes a message straight into a client's inbox, bypassing routing.
    pub fn deliver(&self, user_id: &str, msg: SignalMessage) {
        let inner = self.inner.lock().unwrap();
        if let Some(client) = inner.clients.get(user_id) {
            let _ = client.inbox.send(msg);
        }
    }

    pub fn log(&self) -> Vec<SignalMessage> {
        self.log.lock().unwrap().clone()
    }

    fn route(&self, sender_id: &str, sender_name: &str, msg: SignalMessage) {
        self.log.lock().unwrap().push(msg.clone());
        let mut inner = self.inner.lock().unwrap();
        match msg {
            SignalMessage::JoinRoom { room_id, user_id } => {
                let members = inner.rooms.entry(room_id.clone()).or_default();
                if !members.contains(&user_id) {
                    members.push(user_id.clone());
                }
                let participants = roster(&inner, &room_id);
                deliver(
                    &inner,
                    &user_id,
                    SignalMessage::RoomJoined {
                        room_id: room_id.clone(),
                        class_name: "Test Class".to_string(),
                        description: String::new(),
                        participants: participants.clone(),
                    },
                );
                for member in members_except(&inner, &room_id, &user_id) {
                    deliver(
                        &inner,
                        &member,
                        SignalMessage::UserJoined {
                            user_id: user_id.clone(),
                            username: sender_name.to_string(),
                            profile_img: None,
                            participants: participants.clone(),
                        },
                    );
                }
            }
            SignalMessage::UserReady {
                room_id, username, ..
            } => {
                let Some(room_id) = room_id.or_else(|| room_of(&inner, sender_id)) else {
                    return;
                };
                for member in members_except(&inner, &room_id, sender_id) {
                    deliver(
                        &inner,
                        &member,
                        SignalMessage::UserReady {
                            room_id: Some(room_id.clone()),
                            user_id: Some(sender_id.to_string()),
                            username: username.clone(),
                        },
                    );
                }
            }
            SignalMessage::WebrtcOffer { ref receiver, .. }
            | SignalMessage::WebrtcAnswer { ref receiver, .. }
            | SignalMessage::WebrtcIceCandidate { ref receiver, .. } => {
                let receiver = receiver.clone();
                deliver(&inner, &receiver, msg);
            }
            SignalMessage::LeaveRoom { room_id } => {
                if let Some(members) = inner.rooms.get_mut(&room_id) {
                    members.retain(|m| m != sender_id);
                }
                let participants = roster(&inner, &room_id);
                for member in members_except(&inner, &room_id, sender_id) {
                    deliver(
                        &inner,
                        &member,
                        SignalMessage::UserDisconnected {
                            user_id: sender_id.to_string(),
                        },
                    );
                    deliver(
                        &inner,
                        &member,
                        SignalMessage::ParticipantsUpdated {
                            participants: participants.clone(),
                        },
                    );
                }
            }
            _ => {}
        }
    }
}

fn roster(inner: &HubInner, room_id: &str) -> Vec<ParticipantInfo> {
    inner
        .rooms
        .get(room_id)
        .map(|members| {
            members
                .iter()
                .filter_map(|id| {
                    inner.clients.get(id).map(|c| ParticipantInfo {
                        user_id: id.clone(),
                        username: c.username.clone(),
                        profile_img: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn members_except(inner: &HubInner, room_id: &str, excluded: &str) -> Vec<String> {
    inner
        .rooms
        .get(room_id)
        .map(|members| {
            members
                .iter()
                .filter(|id| id.as_str() != excluded)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn deliver(inner: &HubInner, user_id: &str, msg: SignalMessage) {
    if let Some(client) = inner.clients.get(user_id) {
        let _ = client.inbox.send(msg);
    }
}

fn room_of(inner: &HubInner, user_id: &str) -> Option<String> {
    inner
        .rooms
        .iter()
        .find(|(_, members)| members.iter().any(|m| m == user_id))
        .map(|(room_id, _)| room_id.clone())
}

pub struct HubTransport {
    hub: Arc<Hub>,
    user_id: String,
    username: String,
    inbox: TokioMutex<mpsc::UnboundedReceiver<SignalMessage>>,
    status: watch::Receiver<TransportStatus>,
    status_tx: watch::Sender<TransportStatus>,
}

impl HubTransport {
    /// Simulates the transport layer changing state underneath the session.
    pub fn set_status(&self, status: TransportStatus) {
        self.status_tx.send_replace(status);
    }
}

#[async_trait]
impl SignalingTransport for HubTransport {
    async fn send(&self, msg: SignalMessage) -> Result<()> {
        self.hub.route(&self.user_id, &self.username, msg);
        Ok(())
    }

    async fn recv(&self) -> Option<SignalMessage> {
        self.inbox.lock().await.recv().await
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }
}

/// Installs a per-test log subscriber so `RUST_LOG`-style debugging works
/// when a scenario misbehaves. Safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Polls `check` until it returns true or the deadline passes.
pub async fn settle<F>(check: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
