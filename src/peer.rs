//! The seam between the registry and a concrete peer connection stack.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::media::{EncodingParameters, LocalTrack, OutboundVideoStats, TrackKind};
use crate::signaling::{IceCandidate, ParticipantId, SessionDescription};

/// Connection state as reported by the underlying stack. Observed, not owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Identifies one incarnation of a registry entry. A participant that is
/// closed and reopened gets a new generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryTag {
    pub participant: ParticipantId,
    pub generation: u64,
}

#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: TrackKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(RemoteStream),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub tag: EntryTag,
    pub kind: PeerEventKind,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// One transport statistics reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub packets_lost: u64,
    pub packets_received: u64,
    pub round_trip_time: Option<Duration>,
    pub outbound_video: Option<OutboundVideoStats>,
}

impl TransportStats {
    pub fn packet_loss_percent(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / self.packets_received as f64 * 100.0
    }

    pub fn round_trip_ms(&self) -> f64 {
        self.round_trip_time
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// A single negotiated media connection to one remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Applies a remote offer, then creates and installs the answer.
    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swaps the outbound video track without renegotiating.
    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> Result<()>;

    async fn set_video_encoding(&self, params: EncodingParameters) -> Result<()>;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self) -> Result<()>;
}

/// Builds peer links. Events for the link are reported on `events`,
/// stamped with `tag`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, tag: EntryTag, events: PeerEventSender) -> Result<Arc<dyn PeerLink>>;
}

/// Rendering slots owned by the host UI.
pub trait MediaRenderer: Send + Sync {
    fn show_local(&self, track: Option<&LocalTrack>);
    fn attach_remote(&self, participant: &str, stream: RemoteStream);
    fn detach_remote(&self, participant: &str);
}

/// Renderer for headless sessions; only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderer;

impl MediaRenderer for NullRenderer {
    fn show_local(&self, track: Option<&LocalTrack>) {
        log::debug!("Local preview -> {:?}", track.map(|t| t.id().to_string()));
    }

    fn attach_remote(&self, participant: &str, stream: RemoteStream) {
        log::debug!("Remote {:?} track from {}", stream.kind, participant);
    }

    fn detach_remote(&self, participant: &str) {
        log::debug!("Remote media from {} detached", participant);
    }
}
