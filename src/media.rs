//! Local capture tracks and the bundle that owns them.
//!
//! [`LocalMedia`] is the one place the outbound video track can change. The
//! optimizer (suspend/resume), the screen-share switch (replace) and quality
//! changes (reacquire) all go through its lock, so a swap can never race a
//! disable.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Display => TrackKind::Video,
        }
    }
}

/// Outbound video encoding limits applied per sender.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingParameters {
    pub max_bitrate: u64,
    pub scale_resolution_down_by: f64,
    pub max_framerate: f64,
}

impl Default for EncodingParameters {
    fn default() -> Self {
        Self {
            max_bitrate: 2_500_000,
            scale_resolution_down_by: 1.0,
            max_framerate: 30.0,
        }
    }
}

/// Encoder-side counters for a video track, fed by whatever produces its samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutboundVideoStats {
    pub frames_encoded: u64,
    pub total_encode_time: Duration,
    pub frames_per_second: Option<f64>,
}

impl OutboundVideoStats {
    pub fn average_encode_time(&self) -> Option<Duration> {
        if self.frames_encoded == 0 {
            return None;
        }
        Some(self.total_encode_time / self.frames_encoded.min(u32::MAX as u64) as u32)
    }
}

/// What became of a sample handed to [`LocalTrack::write_sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    /// Track disabled; nothing goes on the wire.
    Muted,
    /// Over the frame rate or bitrate of the current encoding.
    Paced,
    Ended,
}

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Pacing {
    last_sent: Option<Instant>,
    window_start: Option<Instant>,
    window_frames: u32,
    window_bytes: u64,
}

struct TrackInner {
    id: String,
    source: TrackSource,
    sample: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    samples_written: AtomicU64,
    frames_encoded: AtomicU64,
    encode_micros: AtomicU64,
    frame_rate: SyncMutex<Option<f64>>,
    pacing: SyncMutex<Pacing>,
    encoding: watch::Sender<EncodingParameters>,
}

/// Shared handle to one capture track. Clones refer to the same track, so
/// enabling or stopping through any clone is seen by every sender.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, source: TrackSource) -> Self {
        let id = id.into();
        let mime_type = match source.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            "local".to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        let (encoding, _) = watch::channel(EncodingParameters::default());

        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                sample,
                enabled: AtomicBool::new(true),
                ended,
                samples_written: AtomicU64::new(0),
                frames_encoded: AtomicU64::new(0),
                encode_micros: AtomicU64::new(0),
                frame_rate: SyncMutex::new(None),
                pacing: SyncMutex::new(Pacing::default()),
                encoding,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    /// The webrtc-rs track that senders attach.
    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.inner.sample
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Ends the track. Watchers of [`LocalTrack::ended`] are woken.
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, including when the platform ends it.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sends one encoded sample on every sender this track is bound to.
    ///
    /// Disabled and ended tracks send nothing. Video is held to the frame
    /// rate and bitrate of the current encoding; frames that pass count
    /// towards [`LocalTrack::encode_stats`] with `encode_time`.
    pub async fn write_sample(&self, sample: &Sample, encode_time: Duration) -> Result<WriteOutcome> {
        if self.is_ended() {
            return Ok(WriteOutcome::Ended);
        }
        if !self.is_enabled() {
            return Ok(WriteOutcome::Muted);
        }
        if self.kind() == TrackKind::Video {
            let params = *self.inner.encoding.borrow();
            if !self.admit_frame(Instant::now(), sample.data.len(), params) {
                return Ok(WriteOutcome::Paced);
            }
            self.record_encoded_frame(encode_time);
        }

        self.inner.sample.write_sample(sample).await?;
        self.inner.samples_written.fetch_add(1, Ordering::Relaxed);
        Ok(WriteOutcome::Sent)
    }

    /// Samples that went out through [`LocalTrack::write_sample`].
    pub fn samples_written(&self) -> u64 {
        self.inner.samples_written.load(Ordering::Relaxed)
    }

    fn admit_frame(&self, now: Instant, bytes: usize, params: EncodingParameters) -> bool {
        let mut pacing = self.inner.pacing.lock();

        if params.max_framerate > 0.0 {
            // Allow a little capture jitter.
            let interval = Duration::from_secs_f64(0.9 / params.max_framerate);
            if let Some(last) = pacing.last_sent {
                if now.duration_since(last) < interval {
                    return false;
                }
            }
        }

        let window_start = *pacing.window_start.get_or_insert(now);
        let elapsed = now.duration_since(window_start);
        if elapsed >= RATE_WINDOW {
            let fps = pacing.window_frames as f64 / elapsed.as_secs_f64();
            *self.inner.frame_rate.lock() = Some(fps);
            pacing.window_start = Some(now);
            pacing.window_frames = 0;
            pacing.window_bytes = 0;
        }

        let byte_budget = params.max_bitrate / 8;
        if params.max_bitrate > 0
            && pacing.window_frames > 0
            && pacing.window_bytes + bytes as u64 > byte_budget
        {
            return false;
        }

        pacing.last_sent = Some(now);
        pacing.window_frames += 1;
        pacing.window_bytes += bytes as u64;
        true
    }

    pub fn record_encoded_frame(&self, encode_time: Duration) {
        self.inner.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.inner
            .encode_micros
            .fetch_add(encode_time.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set_frame_rate(&self, fps: f64) {
        *self.inner.frame_rate.lock() = Some(fps);
    }

    pub fn encode_stats(&self) -> OutboundVideoStats {
        OutboundVideoStats {
            frames_encoded: self.inner.frames_encoded.load(Ordering::Relaxed),
            total_encode_time: Duration::from_micros(
                self.inner.encode_micros.load(Ordering::Relaxed),
            ),
            frames_per_second: *self.inner.frame_rate.lock(),
        }
    }

    /// Publishes the limits for this track. Frame rate and bitrate are
    /// enforced by [`LocalTrack::write_sample`]; the resolution scale is for
    /// the encoder feeding it.
    pub fn set_encoding_hint(&self, params: EncodingParameters) {
        self.inner.encoding.send_replace(params);
    }

    pub fn encoding_hint(&self) -> watch::Receiver<EncodingParameters> {
        self.inner.encoding.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityProfile {
    Hd,
    Sd,
    AudioOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl QualityProfile {
    pub fn video_constraints(self) -> Option<VideoConstraints> {
        match self {
            QualityProfile::Hd => Some(VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            }),
            QualityProfile::Sd => Some(VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 24,
            }),
            QualityProfile::AudioOnly => None,
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityProfile::Hd => write!(f, "hd"),
            QualityProfile::Sd => write!(f, "sd"),
            QualityProfile::AudioOnly => write!(f, "audio-only"),
        }
    }
}

impl FromStr for QualityProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hd" => Ok(QualityProfile::Hd),
            "sd" => Ok(QualityProfile::Sd),
            "audio-only" => Ok(QualityProfile::AudioOnly),
            other => Err(Error::Config(format!("unknown video quality '{}'", other))),
        }
    }
}

/// One audio track and at most one video track.
#[derive(Debug, Clone)]
pub struct MediaBundle {
    pub audio: LocalTrack,
    pub video: Option<LocalTrack>,
}

/// Platform capture devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Microphone plus, unless the profile is audio-only, a camera track.
    async fn user_media(&self, profile: QualityProfile) -> Result<MediaBundle>;

    /// A display-capture video track, no audio.
    async fn display_media(&self) -> Result<LocalTrack>;
}

/// Something that can swap the outbound video track on all live senders.
/// Implemented by the peer registry.
#[async_trait]
pub trait VideoSenders: Send + Sync {
    /// Replaces the video track on every sender in one pass. On failure the
    /// senders already switched are put back on `previous`.
    async fn replace_video_everywhere(
        &self,
        previous: Option<&LocalTrack>,
        next: Option<&LocalTrack>,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MediaState {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
    /// Camera track parked while a display track is being sent.
    pub saved_camera: Option<LocalTrack>,
    pub camera_enabled: bool,
    pub power_save: bool,
    pub profile: Option<QualityProfile>,
}

impl MediaState {
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.saved_camera.is_some()
            || matches!(self.video.as_ref().map(|t| t.source()), Some(TrackSource::Display))
    }

    /// Re-derives the camera track's enabled flag from user choice and power save.
    pub(crate) fn sync_camera_enabled(&self) {
        if let Some(ref video) = self.video {
            if video.source() == TrackSource::Camera {
                video.set_enabled(self.camera_enabled && !self.power_save);
            }
        }
    }
}

/// Owner of the local media bundle.
#[derive(Clone)]
pub struct LocalMedia {
    state: Arc<Mutex<MediaState>>,
    notifier: Notifier,
}

impl LocalMedia {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            state: Arc::new(Mutex::new(MediaState {
                camera_enabled: true,
                ..Default::default()
            })),
            notifier,
        }
    }

    /// Locks the bundle. Callers that also need the registry must take this
    /// lock first.
    pub async fn lock(&self) -> MutexGuard<'_, MediaState> {
        self.state.lock().await
    }

    /// Captures local media, falling back to audio only when the camera
    /// cannot be opened.
    pub async fn acquire(&self, devices: &dyn MediaDevices, profile: QualityProfile) -> Result<()> {
        let bundle = match devices.user_media(profile).await {
            Ok(bundle) => bundle,
            Err(e) if profile != QualityProfile::AudioOnly => {
                warn!("Camera capture failed ({}), falling back to audio only", e);
                self.notifier
                    .warning(format!("Media permission error: {}. Continuing with audio only.", e));
                devices.user_media(QualityProfile::AudioOnly).await?
            }
            Err(e) => return Err(e),
        };

        let mut state = self.state.lock().await;
        for old in state.tracks().into_iter().chain(state.saved_camera.take()) {
            old.stop();
        }
        state.profile = Some(if bundle.video.is_some() {
            profile
        } else {
            QualityProfile::AudioOnly
        });
        state.camera_enabled = bundle.video.is_some();
        state.audio = Some(bundle.audio);
        state.video = bundle.video;
        state.sync_camera_enabled();
        info!(
            "Local media ready (audio: yes, video: {})",
            if state.video.is_some() { "yes" } else { "no" }
        );
        Ok(())
    }

    pub async fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().await.tracks()
    }

    pub async fn video_track(&self) -> Option<LocalTrack> {
        self.state.lock().await.video.clone()
    }

    pub async fn audio_track(&self) -> Option<LocalTrack> {
        self.state.lock().await.audio.clone()
    }

    pub async fn camera_enabled(&self) -> bool {
        self.state.lock().await.camera_enabled
    }

    /// User camera toggle. Returns the new state.
    pub async fn set_camera_enabled(&self, enabled: bool) -> bool {
        let mut state = self.state.lock().await;
        state.camera_enabled = enabled;
        state.sync_camera_enabled();
        if state.saved_camera.is_some() {
            debug!("Camera toggled while sharing screen; applied on restore");
        }
        enabled
    }

    /// Optimizer hook: suspends or resumes outbound camera video.
    pub async fn set_power_save(&self, suspended: bool) {
        let mut state = self.state.lock().await;
        if state.power_save == suspended {
            return;
        }
        state.power_save = suspended;
        state.sync_camera_enabled();
        if suspended {
            info!("Local video paused (inactivity)");
        } else {
            info!("Local video resumed");
        }
    }

    /// Reacquires the camera under `profile` and swaps it on every sender,
    /// or drops video entirely for audio-only.
    pub async fn change_quality(
        &self,
        devices: &dyn MediaDevices,
        senders: &dyn VideoSenders,
        profile: QualityProfile,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_screen_sharing() {
            return Err(Error::Acquisition(
                "cannot change camera quality while sharing the screen".into(),
            ));
        }

        if profile == QualityProfile::AudioOnly {
            let old = state.video.take();
            if let Some(ref old) = old {
                senders.replace_video_everywhere(Some(old), None).await?;
                old.stop();
            }
            state.profile = Some(profile);
            self.notifier.info("Audio-only mode enabled");
            return Ok(());
        }

        let bundle = match devices.user_media(profile).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.notifier.error("Unable to change video quality");
                return Err(e);
            }
        };
        bundle.audio.stop();
        let new_video = bundle
            .video
            .ok_or_else(|| Error::Acquisition("no camera track returned".into()))?;

        let old = state.video.clone();
        if let Err(e) = senders
            .replace_video_everywhere(old.as_ref(), Some(&new_video))
            .await
        {
            new_video.stop();
            self.notifier.error("Unable to change video quality");
            return Err(e);
        }
        if let Some(old) = old {
            old.stop();
        }
        state.video = Some(new_video);
        state.profile = Some(profile);
        state.sync_camera_enabled();
        self.notifier.success(format!("Video quality: {}", profile));
        Ok(())
    }

    /// Stops every local track.
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        for track in state.tracks() {
            track.stop();
        }
        if let Some(camera) = state.saved_camera.take() {
            camera.stop();
        }
        state.audio = None;
        state.video = None;
    }
}
