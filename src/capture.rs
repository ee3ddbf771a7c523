use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};
use crate::registry::PeerRegistry;

/// One locally produced media track.
///
/// The `enabled` flag is honored at the source: a disabled audio track keeps
/// writing silence so the peer connections stay up without renegotiation.
/// `ended` flips exactly once, when the underlying capture goes away.
pub struct LocalTrack {
    kind: RTPCodecType,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
    ended_rx: watch::Receiver<bool>,
}

impl LocalTrack {
    pub fn new(kind: RTPCodecType, id: String, stream_id: String) -> Self {
        let codec = match kind {
            RTPCodecType::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            _ => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
        };
        let (ended_tx, ended_rx) = watch::channel(false);
        Self {
            kind,
            rtc: Arc::new(TrackLocalStaticSample::new(codec, id, stream_id)),
            enabled: AtomicBool::new(true),
            ended_tx,
            ended_rx,
        }
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips the enabled flag and returns the new state.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        *self.ended_rx.borrow()
    }

    /// Marks the track ended. Safe to call more than once.
    pub fn end(&self) {
        self.ended_tx.send_replace(true);
    }

    pub fn ended_watch(&self) -> watch::Receiver<bool> {
        self.ended_rx.clone()
    }
}

/// A set of tracks acquired from one capture request, plus the handle that
/// keeps the device pump alive. Dropping the stream ends every track and
/// signals the device side to release hardware.
pub struct CapturedStream {
    tracks: Vec<Arc<LocalTrack>>,
    stop: Option<watch::Sender<bool>>,
}

impl CapturedStream {
    pub fn new(tracks: Vec<Arc<LocalTrack>>, stop: Option<watch::Sender<bool>>) -> Self {
        Self { tracks, stop }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track_of(&self, kind: RTPCodecType) -> Option<Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    fn shutdown(&mut self) {
        for track in &self.tracks {
            track.end();
        }
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

impl Drop for CapturedStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Capture backend, the crate's stand-in for the browser media API.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and/or microphone capture.
    async fn open_user_media(&self, video: bool, audio: bool) -> Result<CapturedStream>;

    /// Display capture for screen sharing.
    async fn open_display_media(&self) -> Result<CapturedStream>;
}

/// Microphone capture through cpal.
///
/// A dedicated thread owns the cpal stream (it is not `Send`) and writes
/// 20ms PCM samples into the track until the stop signal fires. There is no
/// camera or display backend on this device set.
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn open_user_media(&self, video: bool, audio: bool) -> Result<CapturedStream> {
        if video {
            return Err(Error::DeviceUnavailable(
                "no camera capture backend".to_string(),
            ));
        }
        if !audio {
            return Err(Error::DeviceUnavailable("no media requested".to_string()));
        }

        let stream_id = format!("classroom-{}", rand::random::<u32>());
        let track = Arc::new(LocalTrack::new(
            RTPCodecType::Audio,
            format!("mic-{}", rand::random::<u32>()),
            stream_id,
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let thread_track = Arc::clone(&track);
        tokio::task::spawn_blocking(move || spawn_microphone(thread_track, stop_rx))
            .await
            .map_err(|e| Error::CaptureFailed(e.to_string()))??;

        Ok(CapturedStream::new(vec![track], Some(stop_tx)))
    }

    async fn open_display_media(&self) -> Result<CapturedStream> {
        Err(Error::DeviceUnavailable(
            "no display capture backend".to_string(),
        ))
    }
}

/// Device set whose tracks are fed by the embedding application writing
/// samples directly (`LocalTrack::rtc().write_sample`). Also what the test
/// suites capture with.
pub struct ManualDevices;

#[async_trait]
impl MediaDevices for ManualDevices {
    async fn open_user_media(&self, video: bool, audio: bool) -> Result<CapturedStream> {
        if !video && !audio {
            return Err(Error::DeviceUnavailable("no media requested".to_string()));
        }
        let stream_id = format!("classroom-{}", rand::random::<u32>());
        let mut tracks = Vec::new();
        if audio {
            tracks.push(Arc::new(LocalTrack::new(
                RTPCodecType::Audio,
                format!("audio-{}", rand::random::<u32>()),
                stream_id.clone(),
            )));
        }
        if video {
            tracks.push(Arc::new(LocalTrack::new(
                RTPCodecType::Video,
                format!("video-{}", rand::random::<u32>()),
                stream_id.clone(),
            )));
        }
        Ok(CapturedStream::new(tracks, None))
    }

    async fn open_display_media(&self) -> Result<CapturedStream> {
        let stream_id = format!("screen-{}", rand::random::<u32>());
        let track = Arc::new(LocalTrack::new(
            RTPCodecType::Video,
            format!("screen-{}", rand::random::<u32>()),
            stream_id,
        ));
        Ok(CapturedStream::new(vec![track], None))
    }
}

fn spawn_microphone(track: Arc<LocalTrack>, mut stop: watch::Receiver<bool>) -> Result<()> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

    std::thread::spawn(move || {
        let stream = match build_microphone_stream(&track) {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };

        while !*stop.borrow() {
            if stop.has_changed().is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        track.end();
        drop(stream);
    });

    match ready_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(classify_capture_error(e)),
        Err(_) => Err(Error::CaptureFailed(
            "timed out opening microphone".to_string(),
        )),
    }
}

fn classify_capture_error(message: String) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        Error::PermissionDenied(message)
    } else if lower.contains("no input device") {
        Error::DeviceUnavailable(message)
    } else {
        Error::CaptureFailed(message)
    }
}

fn build_microphone_stream(track: &Arc<LocalTrack>) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no input device available"))?;
    let config = device.default_input_config()?;
    debug!(config = ?config, "opening microphone input");

    let stream = match config.sample_format() {
        SampleFormat::F32 => {
            build_input_stream::<f32>(&device, &config.into(), Arc::clone(track), |s| s)?
        }
        SampleFormat::I16 => {
            build_input_stream::<i16>(&device, &config.into(), Arc::clone(track), |s| {
                s as f32 / 32768.0
            })?
        }
        SampleFormat::U16 => {
            build_input_stream::<u16>(&device, &config.into(), Arc::clone(track), |s| {
                (s as f32 - 32768.0) / 32768.0
            })?
        }
        format => return Err(anyhow!("unsupported sample format: {:?}", format)),
    };

    stream.play()?;
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<LocalTrack>,
    convert: fn(T) -> f32,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let err_fn = |err| warn!(error = %err, "input audio stream error");

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut buf = vec![0u8; data.len() * 4];
            if track.is_enabled() {
                for (chunk, sample) in buf.chunks_exact_mut(4).zip(data) {
                    chunk.copy_from_slice(&convert(*sample).to_le_bytes());
                }
            }
            let sample = Sample {
                data: buf.into(),
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(e) = futures::executor::block_on(track.rtc().write_sample(&sample)) {
                warn!(error = %e, "failed to write audio sample");
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

#[derive(Default)]
struct CaptureInner {
    local: Option<CapturedStream>,
    screen: Option<CapturedStream>,
}

/// Owns the local camera/microphone stream and the optional screen-share
/// stream. Only this manager may stop or replace local tracks; every peer
/// connection merely references them.
pub struct MediaCaptureManager {
    devices: Arc<dyn MediaDevices>,
    inner: Mutex<CaptureInner>,
}

impl MediaCaptureManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            inner: Mutex::new(CaptureInner::default()),
        }
    }

    /// Opens camera/microphone capture, releasing any previously held local
    /// stream first so capture devices never leak.
    pub async fn acquire_local_stream(
        &self,
        video: bool,
        audio: bool,
    ) -> Result<Vec<Arc<LocalTrack>>> {
        let mut inner = self.inner.lock().await;
        inner.local.take();
        let stream = self.devices.open_user_media(video, audio).await?;
        let tracks = stream.tracks().to_vec();
        inner.local = Some(stream);
        Ok(tracks)
    }

    pub async fn local_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.inner
            .lock()
            .await
            .local
            .as_ref()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default()
    }

    pub async fn has_local_media(&self) -> bool {
        self.inner.lock().await.local.is_some()
    }

    pub async fn camera_track(&self) -> Option<Arc<LocalTrack>> {
        self.inner
            .lock()
            .await
            .local
            .as_ref()
            .and_then(|s| s.track_of(RTPCodecType::Video))
    }

    pub async fn screen_active(&self) -> bool {
        self.inner.lock().await.screen.is_some()
    }

    /// Flips `enabled` on every local track of the kind; returns the new
    /// state, or `false` when no such track exists.
    pub async fn toggle_track_kind(&self, kind: RTPCodecType) -> bool {
        let inner = self.inner.lock().await;
        let Some(stream) = inner.local.as_ref() else {
            return false;
        };
        let mut state = false;
        let mut found = false;
        for track in stream.tracks().iter().filter(|t| t.kind() == kind) {
            state = track.toggle();
            found = true;
        }
        found && state
    }

    /// Starts display capture and substitutes the outbound video track on
    /// every registered peer connection in place, without renegotiation.
    /// When the platform ends the capture (the user stopped sharing), the
    /// share is stopped automatically.
    pub async fn start_screen_share(
        self: &Arc<Self>,
        registry: &Arc<PeerRegistry>,
    ) -> Result<Arc<LocalTrack>> {
        let mut inner = self.inner.lock().await;
        if inner.screen.is_some() {
            return Err(Error::InvalidState(
                "screen share already active".to_string(),
            ));
        }

        let stream = self.devices.open_display_media().await?;
        let track = stream.track_of(RTPCodecType::Video).ok_or_else(|| {
            Error::CaptureFailed("display stream has no video track".to_string())
        })?;

        registry.replace_outbound_video(Some(track.clone())).await?;
        inner.screen = Some(stream);
        drop(inner);

        let mut ended = track.ended_watch();
        let manager = Arc::downgrade(self);
        let registry = Arc::downgrade(registry);
        tokio::spawn(async move {
            while ended.changed().await.is_ok() {
                if !*ended.borrow() {
                    continue;
                }
                if let (Some(manager), Some(registry)) = (manager.upgrade(), registry.upgrade()) {
                    if let Err(e) = manager.stop_screen_share(&registry).await {
                        debug!(error = %e, "screen share auto-stop failed");
                    }
                }
                break;
            }
        });

        Ok(track)
    }

    /// Restores the camera track as the outbound video on every peer
    /// connection and releases the display capture. No-op when no share is
    /// active.
    pub async fn stop_screen_share(&self, registry: &Arc<PeerRegistry>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(stream) = inner.screen.take() else {
            return Ok(());
        };
        let camera = inner.local.as_ref().and_then(|s| s.track_of(RTPCodecType::Video));
        registry.replace_outbound_video(camera).await?;
        drop(stream);
        Ok(())
    }

    /// Ends every held track and releases all capture devices. Called on
    /// room leave and on any fatal exit; safe to call repeatedly.
    pub async fn release_all(&self) {
        let mut inner = self.inner.lock().await;
        inner.local.take();
        inner.screen.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MediaCaptureManager {
        MediaCaptureManager::new(Arc::new(ManualDevices))
    }

    #[tokio::test]
    async fn acquire_yields_requested_tracks() {
        let manager = manager();
        let tracks = manager.acquire_local_stream(true, true).await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().any(|t| t.kind() == RTPCodecType::Audio));
        assert!(tracks.iter().any(|t| t.kind() == RTPCodecType::Video));
    }

    #[tokio::test]
    async fn toggle_twice_restores_original_state() {
        let manager = manager();
        manager.acquire_local_stream(false, true).await.unwrap();

        assert!(!manager.toggle_track_kind(RTPCodecType::Audio).await);
        assert!(manager.toggle_track_kind(RTPCodecType::Audio).await);
        let tracks = manager.local_tracks().await;
        assert!(tracks[0].is_enabled());
    }

    #[tokio::test]
    async fn toggle_without_matching_track_is_noop() {
        let manager = manager();
        assert!(!manager.toggle_track_kind(RTPCodecType::Audio).await);

        manager.acquire_local_stream(false, true).await.unwrap();
        assert!(!manager.toggle_track_kind(RTPCodecType::Video).await);
    }

    #[tokio::test]
    async fn release_all_ends_every_track() {
        let manager = manager();
        let tracks = manager.acquire_local_stream(true, true).await.unwrap();
        manager.release_all().await;
        assert!(tracks.iter().all(|t| t.is_ended()));
        assert!(!manager.has_local_media().await);
    }

    #[tokio::test]
    async fn reacquire_releases_previous_stream() {
        let manager = manager();
        let first = manager.acquire_local_stream(true, true).await.unwrap();
        let second = manager.acquire_local_stream(true, true).await.unwrap();
        assert!(first.iter().all(|t| t.is_ended()));
        assert!(second.iter().all(|t| !t.is_ended()));
    }

    #[tokio::test]
    async fn release_all_is_idempotent() {
        let manager = manager();
        manager.acquire_local_stream(true, true).await.unwrap();
        manager.release_all().await;
        manager.release_all().await;
    }
}
