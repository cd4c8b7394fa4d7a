use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use log::info;

use crate::audio;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::media::{LocalTrack, MediaBundle, MediaDevices, QualityProfile, TrackSource};

/// Capture devices of the local host.
///
/// The microphone must exist according to cpal; its frames reach the audio
/// track through [`crate::audio::spawn_uplink`]. Camera and display tracks
/// take encoded VP8 frames through [`LocalTrack::write_sample`], which
/// applies the enabled flag and the current encoding limits.
pub struct NativeDevices {
    camera: bool,
    display_capture: bool,
    counter: AtomicUsize,
}

impl NativeDevices {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            camera: config.enable_video,
            display_capture: config.enable_screen_capture,
            counter: AtomicUsize::new(0),
        }
    }

    fn track(&self, prefix: &str, source: TrackSource) -> LocalTrack {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        LocalTrack::new(format!("{}-{}", prefix, n), source)
    }
}

#[async_trait]
impl MediaDevices for NativeDevices {
    async fn user_media(&self, profile: QualityProfile) -> Result<MediaBundle> {
        if !audio::input_available() {
            return Err(Error::Acquisition("no microphone available".into()));
        }

        let video = match profile.video_constraints() {
            None => None,
            Some(_) if !self.camera => {
                return Err(Error::Acquisition("no camera available".into()));
            }
            Some(constraints) => {
                let track = self.track("camera", TrackSource::Camera);
                track.set_frame_rate(constraints.frame_rate as f64);
                info!(
                    "Camera track {} at {}x{}@{}",
                    track.id(),
                    constraints.width,
                    constraints.height,
                    constraints.frame_rate
                );
                Some(track)
            }
        };

        Ok(MediaBundle {
            audio: self.track("microphone", TrackSource::Microphone),
            video,
        })
    }

    async fn display_media(&self) -> Result<LocalTrack> {
        if !self.display_capture {
            return Err(Error::ScreenShare("display capture not available".into()));
        }
        Ok(self.track("screen", TrackSource::Display))
    }
}
