//! What this host can do, reported as data rather than discovered ad hoc.

use log::{info, warn};
use serde::Serialize;
use webrtc::api::media_engine::MediaEngine;

use crate::audio;
use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub feature: &'static str,
    pub severity: Severity,
    pub message: &'static str,
}

/// Raw feature flags as seen by a capability check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Features {
    pub peer_connection: bool,
    pub microphone: bool,
    pub camera: bool,
    pub display_capture: bool,
    pub audio_analysis: bool,
    pub audio_output: bool,
    pub signaling: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupportReport {
    pub features: Features,
    pub issues: Vec<Issue>,
    pub warnings: Vec<&'static str>,
}

impl SupportReport {
    pub fn evaluate(features: Features) -> Self {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        if !features.peer_connection {
            issues.push(Issue {
                feature: "peer-connection",
                severity: Severity::Critical,
                message: "WebRTC unavailable, video conferencing impossible",
            });
        }
        if !features.microphone {
            issues.push(Issue {
                feature: "microphone",
                severity: Severity::Critical,
                message: "No audio input device",
            });
        }
        if !features.signaling {
            issues.push(Issue {
                feature: "signaling",
                severity: Severity::Critical,
                message: "WebSocket unavailable, real-time signaling impossible",
            });
        }
        if !features.audio_analysis {
            issues.push(Issue {
                feature: "audio-analysis",
                severity: Severity::Medium,
                message: "Voice activity detection unavailable",
            });
        }
        if !features.camera {
            warnings.push("No camera source, joining with audio only");
        }
        if !features.display_capture {
            warnings.push("Screen sharing not supported");
        }
        if !features.audio_output {
            warnings.push("No audio output device");
        }

        Self {
            features,
            issues,
            warnings,
        }
    }

    /// Conferencing needs a peer connection, a microphone and signaling.
    pub fn is_supported(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    pub fn log(&self) {
        for issue in &self.issues {
            warn!("[{:?}] {}: {}", issue.severity, issue.feature, issue.message);
        }
        for warning in &self.warnings {
            info!("{}", warning);
        }
    }
}

pub trait CapabilityCheck: Send + Sync {
    fn check(&self) -> SupportReport;
}

/// Checks the webrtc codec stack and cpal devices on this machine.
pub struct NativeCapabilities {
    camera: bool,
    display_capture: bool,
}

impl NativeCapabilities {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            camera: config.enable_video,
            display_capture: config.enable_screen_capture,
        }
    }
}

impl CapabilityCheck for NativeCapabilities {
    fn check(&self) -> SupportReport {
        let mut engine = MediaEngine::default();
        let peer_connection = match engine.register_default_codecs() {
            Ok(()) => true,
            Err(e) => {
                warn!("Codec registration failed: {}", e);
                false
            }
        };

        SupportReport::evaluate(Features {
            peer_connection,
            microphone: audio::input_available(),
            camera: self.camera,
            display_capture: self.display_capture,
            audio_analysis: true,
            audio_output: audio::output_available(),
            signaling: true,
        })
    }
}
