//! One joined room: local media, the peer registry and the samplers around
//! it, driven by the room controller through explicit hooks.

use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::media::{LocalMedia, MediaDevices, QualityProfile};
use crate::metrics::QualityMonitor;
use crate::notify::{Notice, Notifier};
use crate::optimizer::{ActivityTracker, BitrateController, PerformanceMetrics, ResourceSource};
use crate::peer::{MediaRenderer, PeerConnector};
use crate::registry::PeerRegistry;
use crate::screen_share::ScreenShare;
use crate::signaling::{InboundMessage, OutboundMessage, ParticipantId, SignalSink};
use crate::vad::{VoiceActivityMonitor, VoiceEvent, VoiceLevel};

/// Platform services a session runs on.
#[derive(Clone)]
pub struct Platform {
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
    pub renderer: Arc<dyn MediaRenderer>,
    pub resources: Arc<dyn ResourceSource>,
    pub signal: Arc<dyn SignalSink>,
}

pub struct RoomSession {
    config: ClientConfig,
    platform: Platform,
    notifier: Notifier,
    media: LocalMedia,
    registry: Arc<PeerRegistry>,
    quality: Arc<QualityMonitor>,
    optimizer: Arc<BitrateController>,
    screen_share: Arc<ScreenShare>,
    voice: SyncMutex<Option<VoiceActivityMonitor>>,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl RoomSession {
    /// Wires the session together. Notices for the user arrive on the
    /// returned receiver.
    pub fn new(config: ClientConfig, platform: Platform) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notifier, notices) = Notifier::channel();
        let media = LocalMedia::new(notifier.clone());

        let registry = PeerRegistry::new(
            Arc::clone(&platform.connector),
            media.clone(),
            Arc::clone(&platform.signal),
            Arc::clone(&platform.renderer),
            notifier.clone(),
            config.retry,
        );
        let quality = QualityMonitor::new(registry.clone(), notifier.clone(), &config.timings);
        let optimizer = BitrateController::new(
            registry.clone(),
            media.clone(),
            notifier.clone(),
            if config.track_inactivity {
                ActivityTracker::new(config.timings.inactivity_timeout)
            } else {
                ActivityTracker::always_active()
            },
            Arc::clone(&platform.resources),
            &config.timings,
        );
        let screen_share = ScreenShare::new(
            config.participant_id.clone(),
            media.clone(),
            Arc::clone(&platform.devices),
            registry.clone(),
            Arc::clone(&platform.renderer),
            Arc::clone(&platform.signal),
            notifier.clone(),
        );

        let session = Self {
            config,
            platform,
            notifier,
            media,
            registry,
            quality,
            optimizer,
            screen_share,
            voice: SyncMutex::new(None),
            tasks: SyncMutex::new(Vec::new()),
        };
        (session, notices)
    }

    pub fn participant_id(&self) -> &str {
        &self.config.participant_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn activity(&self) -> &ActivityTracker {
        self.optimizer.activity()
    }

    /// Acquires local media and starts the periodic samplers.
    pub async fn init(&self) -> Result<()> {
        let profile = if self.config.enable_video {
            self.config.video_quality
        } else {
            QualityProfile::AudioOnly
        };
        self.media
            .acquire(self.platform.devices.as_ref(), profile)
            .await?;
        self.platform
            .renderer
            .show_local(self.media.video_track().await.as_ref());

        let samplers = [self.quality.start_monitoring(), self.optimizer.start_monitoring()];
        self.tasks.lock().extend(samplers);
        info!("Room session initialised for {}", self.config.participant_id);
        Ok(())
    }

    /// Starts voice activity detection on microphone frames.
    pub fn attach_voice(
        &self,
        frames: mpsc::Receiver<Vec<f32>>,
    ) -> (broadcast::Receiver<VoiceEvent>, watch::Receiver<VoiceLevel>) {
        let monitor = VoiceActivityMonitor::spawn(
            frames,
            self.config.vad_threshold,
            self.config.timings.speech_hang_time,
        );
        let handles = (monitor.subscribe(), monitor.level());
        if let Some(previous) = self.voice.lock().replace(monitor) {
            previous.stop();
        }
        handles
    }

    /// Sends microphone PCM on the outbound audio track and runs voice
    /// activity detection on the same frames.
    pub async fn attach_microphone(
        &self,
        pcm: mpsc::Receiver<Vec<f32>>,
        sample_rate: u32,
    ) -> Result<(broadcast::Receiver<VoiceEvent>, watch::Receiver<VoiceLevel>)> {
        let (detector_tx, detector_rx) = mpsc::channel(64);
        let uplink = audio::spawn_uplink(pcm, sample_rate, self.media.clone(), detector_tx).await?;
        self.tasks.lock().push(uplink);
        Ok(self.attach_voice(detector_rx))
    }

    /// Routes one inbound room message. Failures are logged, never fatal.
    pub async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::ParticipantsList { participants } => {
                for participant in participants {
                    if participant.id == self.config.participant_id {
                        continue;
                    }
                    if let Err(e) = self.registry.open(&participant.id).await {
                        error!("Could not connect to {}: {}", participant.id, e);
                    }
                }
            }
            InboundMessage::ParticipantJoined { participant_id } => {
                self.on_participant_joined(&participant_id).await
            }
            InboundMessage::ParticipantLeft { participant_id } => {
                self.on_participant_left(&participant_id).await
            }
            InboundMessage::WebrtcOffer { from_id, offer } => {
                if let Err(e) = self.registry.accept_offer(&from_id, offer).await {
                    error!("Offer from {} not handled: {}", from_id, e);
                }
            }
            InboundMessage::WebrtcAnswer { from_id, answer } => {
                if let Err(e) = self.registry.accept_answer(&from_id, answer).await {
                    error!("Answer from {} not handled: {}", from_id, e);
                }
            }
            InboundMessage::WebrtcIceCandidate { from_id, candidate } => {
                if let Err(e) = self.registry.add_remote_candidate(&from_id, candidate).await {
                    error!("Candidate from {} not handled: {}", from_id, e);
                }
            }
            InboundMessage::ScreenShareStarted { participant_id } => {
                if participant_id != self.config.participant_id {
                    self.notifier.info("A participant is sharing their screen");
                }
            }
            InboundMessage::ScreenShareStopped { participant_id } => {
                if participant_id != self.config.participant_id {
                    self.notifier.info("Screen sharing has stopped");
                }
            }
            InboundMessage::Other => {}
        }
    }

    /// The newcomer offers to everyone in its participant list, so existing
    /// members only wait for that offer.
    pub async fn on_participant_joined(&self, participant: &ParticipantId) {
        if *participant == self.config.participant_id {
            return;
        }
        debug!("{} joined, waiting for their offer", participant);
    }

    pub async fn on_participant_left(&self, participant: &ParticipantId) {
        self.registry.close(participant).await;
    }

    /// Flips the camera and tells the room. Returns the new state.
    pub async fn toggle_video(&self) -> bool {
        if self.media.video_track().await.is_none() {
            self.notifier.warning("No camera available");
            return false;
        }
        let active = !self.media.camera_enabled().await;
        self.media.set_camera_enabled(active).await;
        if let Err(e) = self
            .platform
            .signal
            .send(OutboundMessage::VideoToggle { active })
        {
            warn!("Video toggle notice not sent: {}", e);
        }
        self.notifier
            .info(if active { "Camera enabled" } else { "Camera disabled" });
        active
    }

    pub async fn toggle_screen_share(&self) -> Result<()> {
        if self.screen_share.is_active().await {
            self.screen_share.stop().await
        } else {
            self.screen_share.start().await
        }
    }

    pub async fn change_quality(&self, profile: QualityProfile) -> Result<()> {
        self.media
            .change_quality(
                self.platform.devices.as_ref(),
                self.registry.as_ref(),
                profile,
            )
            .await?;
        self.platform
            .renderer
            .show_local(self.media.video_track().await.as_ref());
        Ok(())
    }

    pub async fn metrics(&self) -> PerformanceMetrics {
        self.optimizer.metrics().await
    }

    /// Stops the samplers and the share, closes every connection and
    /// releases local media.
    pub async fn leave(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let voice = self.voice.lock().take();
        if let Some(voice) = voice {
            voice.stop();
        }
        if let Err(e) = self.screen_share.stop().await {
            warn!("Screen share not stopped cleanly: {}", e);
        }
        self.registry.shutdown().await;
        self.media.stop_all().await;
        self.platform.renderer.show_local(None);
        info!("Left the room");
    }
}
