use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Observed quality of one peer connection. Observation only; the session
/// never adapts media based on these numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    pub round_trip_time: f64,   // milliseconds
    pub packet_loss_rate: f64,  // percentage (0-100)
    pub quality_score: u8,      // 0-100
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            round_trip_time: 0.0,
            packet_loss_rate: 0.0,
            quality_score: 100,
        }
    }
}

pub(crate) fn quality_score(
    rtt_ms: f64,
    loss_pct: f64,
    state: RTCPeerConnectionState,
) -> u8 {
    match state {
        RTCPeerConnectionState::Connected => {}
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => return 50,
        _ => return 0,
    }

    let rtt_score = if rtt_ms < 150.0 {
        60
    } else if rtt_ms < 300.0 {
        45
    } else {
        25
    };

    let loss_score = if loss_pct < 1.0 {
        40
    } else if loss_pct < 3.0 {
        30
    } else if loss_pct < 5.0 {
        20
    } else {
        10
    };

    rtt_score + loss_score
}

/// Polls `get_stats` once a second and publishes a quality snapshot over a
/// watch channel. Stops on its own once the connection is closed or its
/// handle is dropped.
pub struct QualityMonitor {
    pc: Weak<RTCPeerConnection>,
    quality: Arc<watch::Sender<ConnectionQuality>>,
    receiver: watch::Receiver<ConnectionQuality>,
}

impl QualityMonitor {
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (quality, receiver) = watch::channel(ConnectionQuality::default());
        Self {
            pc: Arc::downgrade(&pc),
            quality: Arc::new(quality),
            receiver,
        }
    }

    pub fn start(&self) {
        let pc = self.pc.clone();
        let quality = Arc::clone(&self.quality);

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let Some(pc) = pc.upgrade() else { break };
                let state = pc.connection_state();
                if state == RTCPeerConnectionState::Closed {
                    break;
                }

                let stats = pc.get_stats().await;
                let mut rtt_ms = 0.0f64;
                let mut packets_sent = 0u64;
                let mut packets_lost = 0i64;
                for (_key, stat) in stats.reports.iter() {
                    if let StatsReportType::OutboundRTP(rtp) = stat {
                        packets_sent += rtp.packets_sent;
                    }
                    if let StatsReportType::RemoteInboundRTP(remote) = stat {
                        packets_lost += remote.packets_lost;
                        if let Some(rtt) = remote.round_trip_time {
                            rtt_ms = rtt * 1000.0;
                        }
                    }
                }

                let loss_pct = if packets_sent > 0 {
                    (packets_lost.max(0) as f64 / packets_sent as f64) * 100.0
                } else {
                    0.0
                };

                quality.send_replace(ConnectionQuality {
                    round_trip_time: rtt_ms,
                    packet_loss_rate: loss_pct,
                    quality_score: quality_score(rtt_ms, loss_pct, state),
                });
            }
        });
    }

    pub fn current(&self) -> ConnectionQuality {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionQuality> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_reflects_rtt_and_loss_thresholds() {
        let connected = RTCPeerConnectionState::Connected;
        assert_eq!(quality_score(50.0, 0.0, connected), 100);
        assert_eq!(quality_score(200.0, 0.0, connected), 85);
        assert_eq!(quality_score(400.0, 10.0, connected), 35);
    }

    #[test]
    fn score_collapses_on_terminal_states() {
        assert_eq!(
            quality_score(50.0, 0.0, RTCPeerConnectionState::Failed),
            0
        );
        assert_eq!(
            quality_score(50.0, 0.0, RTCPeerConnectionState::Connecting),
            50
        );
    }
}
