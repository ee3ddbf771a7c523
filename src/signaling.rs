use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Error, Result};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY_MS: u64 = 1000;

/// Roster entry as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_img: Option<String>,
}

/// Signaling payloads exchanged with the rendezvous server.
///
/// `user-ready` is asymmetric: outbound it carries the room, inbound the
/// server stamps the sender's id. Offer/answer/candidate payloads carry the
/// sender id so the receiving side can address the right peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        class_name: String,
        #[serde(default)]
        description: String,
        participants: Vec<ParticipantInfo>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: String,
        username: String,
        #[serde(default)]
        profile_img: Option<String>,
        participants: Vec<ParticipantInfo>,
    },
    #[serde(rename_all = "camelCase")]
    UserReady {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        room_id: String,
        offer: RTCSessionDescription,
        sender: String,
        sender_name: String,
        receiver: String,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        room_id: String,
        answer: RTCSessionDescription,
        sender: String,
        receiver: String,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        room_id: String,
        candidate: RTCIceCandidateInit,
        sender: String,
        receiver: String,
    },
    #[serde(rename_all = "camelCase")]
    UserDisconnected { user_id: String },
    #[serde(rename_all = "camelCase")]
    ParticipantsUpdated { participants: Vec<ParticipantInfo> },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
}

impl SignalMessage {
    /// Room the message belongs to, when the payload carries one.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            SignalMessage::JoinRoom { room_id, .. }
            | SignalMessage::RoomJoined { room_id, .. }
            | SignalMessage::WebrtcOffer { room_id, .. }
            | SignalMessage::WebrtcAnswer { room_id, .. }
            | SignalMessage::WebrtcIceCandidate { room_id, .. }
            | SignalMessage::LeaveRoom { room_id } => Some(room_id),
            SignalMessage::UserReady { room_id, .. } => room_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Connected,
    Reconnecting,
    Closed,
}

/// Bidirectional, ordered, at-least-once signaling channel.
///
/// The session core only ever talks to this interface; the WebSocket
/// implementation below is the production one, tests plug in an in-process
/// hub.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, msg: SignalMessage) -> Result<()>;

    /// Next inbound message, or `None` once the transport is gone for good.
    async fn recv(&self) -> Option<SignalMessage>;

    fn status(&self) -> watch::Receiver<TransportStatus>;
}

/// WebSocket signaling client.
///
/// A supervisor task owns the socket and pumps JSON frames both ways. When
/// the socket drops it retries with a fixed delay up to a bounded number of
/// attempts; while disconnected, `send` fails with `SignalingUnavailable`
/// and the status watch reports `Reconnecting`. Established peer
/// connections are unaffected by transport loss.
pub struct WebSocketTransport {
    outgoing: mpsc::Sender<SignalMessage>,
    incoming: Mutex<mpsc::Receiver<SignalMessage>>,
    status: watch::Receiver<TransportStatus>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let (ws, _) = connect_async(url).await?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<SignalMessage>(100);
        let (incoming_tx, incoming_rx) = mpsc::channel::<SignalMessage>(100);
        let (status_tx, status_rx) = watch::channel(TransportStatus::Connected);

        tokio::spawn(supervise(
            url.to_string(),
            ws,
            outgoing_rx,
            incoming_tx,
            status_tx,
        ));

        Ok(Arc::new(Self {
            outgoing: outgoing_tx,
            incoming: Mutex::new(incoming_rx),
            status: status_rx,
        }))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&self, msg: SignalMessage) -> Result<()> {
        if *self.status.borrow() != TransportStatus::Connected {
            return Err(Error::SignalingUnavailable(
                "transport is not connected".to_string(),
            ));
        }
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| Error::SignalingUnavailable("transport task ended".to_string()))
    }

    async fn recv(&self) -> Option<SignalMessage> {
        self.incoming.lock().await.recv().await
    }

    fn status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn supervise(
    url: String,
    first: WsStream,
    mut outgoing_rx: mpsc::Receiver<SignalMessage>,
    incoming_tx: mpsc::Sender<SignalMessage>,
    status_tx: watch::Sender<TransportStatus>,
) {
    let mut socket = Some(first);
    let mut attempts = 0u32;

    loop {
        let stream = match socket.take() {
            Some(s) => s,
            None => {
                if attempts >= MAX_RECONNECT_ATTEMPTS {
                    warn!("signaling reconnect attempts exhausted");
                    let _ = status_tx.send(TransportStatus::Closed);
                    return;
                }
                attempts += 1;
                sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
                match connect_async(&url).await {
                    Ok((s, _)) => s,
                    Err(e) => {
                        debug!(attempt = attempts, error = %e, "signaling reconnect failed");
                        continue;
                    }
                }
            }
        };

        attempts = 0;
        let _ = status_tx.send(TransportStatus::Connected);
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                out = outgoing_rx.recv() => match out {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to encode signaling message");
                                continue;
                            }
                        };
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // Transport handle dropped; nothing left to do.
                    None => return,
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(msg) => {
                                if incoming_tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "unrecognized signaling frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "signaling read error");
                        break;
                    }
                },
            }
        }

        let _ = status_tx.send(TransportStatus::Reconnecting);
    }
}
