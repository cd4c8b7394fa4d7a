//! Switches the outbound video between camera and display capture.
//!
//! Both directions run under the media lock and swap every sender in one
//! pass, so peers never disagree about which track they receive.

use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::media::{LocalMedia, LocalTrack, MediaDevices, MediaState, TrackSource, VideoSenders};
use crate::notify::Notifier;
use crate::peer::MediaRenderer;
use crate::signaling::{OutboundMessage, ParticipantId, SignalSink};

pub struct ScreenShare {
    participant_id: ParticipantId,
    media: LocalMedia,
    devices: Arc<dyn MediaDevices>,
    senders: Arc<dyn VideoSenders>,
    renderer: Arc<dyn MediaRenderer>,
    signal: Arc<dyn SignalSink>,
    notifier: Notifier,
    watcher: SyncMutex<Option<JoinHandle<()>>>,
    me: Weak<ScreenShare>,
}

impl ScreenShare {
    pub fn new(
        participant_id: ParticipantId,
        media: LocalMedia,
        devices: Arc<dyn MediaDevices>,
        senders: Arc<dyn VideoSenders>,
        renderer: Arc<dyn MediaRenderer>,
        signal: Arc<dyn SignalSink>,
        notifier: Notifier,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            participant_id,
            media,
            devices,
            senders,
            renderer,
            signal,
            notifier,
            watcher: SyncMutex::new(None),
            me: me.clone(),
        })
    }

    pub async fn is_active(&self) -> bool {
        self.media.lock().await.is_screen_sharing()
    }

    /// Captures the display and sends it in place of the camera. On any
    /// failure the camera stays on every sender.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.media.lock().await;
        if state.is_screen_sharing() {
            debug!("Screen share already active");
            return Ok(());
        }

        let display = match self.devices.display_media().await {
            Ok(track) => track,
            Err(e) => {
                error!("Screen capture failed: {}", e);
                self.notifier.error("Unable to share screen");
                return Err(e);
            }
        };

        let camera = state.video.clone();
        if let Err(e) = self
            .senders
            .replace_video_everywhere(camera.as_ref(), Some(&display))
            .await
        {
            display.stop();
            error!("Screen share swap failed: {}", e);
            self.notifier.error("Unable to share screen");
            return Err(e);
        }

        if let Some(ref camera) = camera {
            camera.set_enabled(false);
        }
        state.saved_camera = camera;
        state.video = Some(display.clone());
        self.renderer.show_local(Some(&display));
        drop(state);

        self.watch_for_end(display);
        self.announce(OutboundMessage::ScreenShareStarted {
            participant_id: self.participant_id.clone(),
        });
        info!("Screen sharing started");
        self.notifier.success("Screen sharing started");
        Ok(())
    }

    /// Puts the saved camera back on every sender.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.media.lock().await;
        self.restore(&mut state).await
    }

    async fn restore(&self, state: &mut MediaState) -> Result<()> {
        let Some(display) = state
            .video
            .clone()
            .filter(|track| track.source() == TrackSource::Display)
        else {
            return Ok(());
        };

        let camera = state.saved_camera.clone();
        if let Err(e) = self
            .senders
            .replace_video_everywhere(Some(&display), camera.as_ref())
            .await
        {
            error!("Restoring camera failed: {}", e);
            self.notifier.error("Unable to stop screen sharing");
            return Err(e);
        }

        state.saved_camera = None;
        state.video = camera;
        state.sync_camera_enabled();
        display.stop();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.renderer.show_local(state.video.as_ref());

        self.announce(OutboundMessage::ScreenShareStopped {
            participant_id: self.participant_id.clone(),
        });
        info!("Screen sharing stopped");
        self.notifier.info("Screen sharing stopped");
        Ok(())
    }

    /// Restores the camera when the platform ends the share on its own.
    fn watch_for_end(&self, display: LocalTrack) {
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            display.ended().await;
            let Some(share) = me.upgrade() else {
                return;
            };
            let mut state = share.media.lock().await;
            let still_sharing = state
                .video
                .as_ref()
                .map_or(false, |track| track.same_track(&display));
            if !still_sharing {
                return;
            }
            info!("Display capture ended externally, restoring camera");
            // The running task is this one; detach it instead of aborting.
            share.watcher.lock().take();
            if let Err(e) = share.restore(&mut state).await {
                warn!("Automatic camera restore failed: {}", e);
            }
        });
        if let Some(previous) = self.watcher.lock().replace(task) {
            previous.abort();
        }
    }

    fn announce(&self, message: OutboundMessage) {
        if let Err(e) = self.signal.send(message) {
            warn!("Screen share notice not sent: {}", e);
        }
    }
}

impl Drop for ScreenShare {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}
