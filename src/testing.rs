//! Recording fakes for the platform seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::media::{
    EncodingParameters, LocalTrack, MediaBundle, MediaDevices, QualityProfile, TrackKind,
    TrackSource, VideoSenders,
};
use crate::peer::{
    EntryTag, MediaRenderer, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender, PeerLink,
    PeerState, RemoteStream, TransportStats,
};
use crate::signaling::{IceCandidate, OutboundMessage, SessionDescription, SignalSink};

/// Lets every spawned task run; time only moves once the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Default)]
struct LinkState {
    tracks: Vec<LocalTrack>,
    video: Option<LocalTrack>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    encoding: Option<EncodingParameters>,
    stats: TransportStats,
    fail_stats: bool,
    fail_replace: bool,
    closed: bool,
}

pub struct FakeLink {
    tag: EntryTag,
    events: PeerEventSender,
    offer_gate: Option<Arc<Notify>>,
    stats_gate: Mutex<Option<Arc<Notify>>>,
    stats_calls: AtomicUsize,
    state: Mutex<LinkState>,
}

impl FakeLink {
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn video_track(&self) -> Option<LocalTrack> {
        self.state.lock().video.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn encoding(&self) -> Option<EncodingParameters> {
        self.state.lock().encoding
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_stats(&self, stats: TransportStats) {
        self.state.lock().stats = stats;
    }

    pub fn fail_stats(&self, fail: bool) {
        self.state.lock().fail_stats = fail;
    }

    pub fn fail_replace(&self, fail: bool) {
        self.state.lock().fail_replace = fail;
    }

    pub fn gate_stats(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.stats_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            tag: self.tag.clone(),
            kind,
        });
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(PeerEventKind::LocalCandidate(IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    pub fn emit_state(&self, state: PeerState) {
        self.emit(PeerEventKind::StateChanged(state));
    }

    pub fn emit_remote_track(&self) {
        self.emit(PeerEventKind::RemoteTrack(RemoteStream {
            stream_id: format!("stream-{}", self.tag.participant),
            track_id: "video".into(),
            kind: TrackKind::Video,
            track: None,
        }));
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut state = self.state.lock();
        state.tracks.push(track.clone());
        if track.kind() == TrackKind::Video {
            state.video = Some(track.clone());
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if let Some(ref gate) = self.offer_gate {
            gate.notified().await;
        }
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.tag.participant, self.tag.generation
        )))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.state.lock().remote.push(offer);
        Ok(SessionDescription::answer(format!(
            "answer-{}",
            self.tag.participant
        )))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.state.lock().remote.push(answer);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_replace {
            return Err(Error::negotiation(&self.tag.participant, "replace refused"));
        }
        state.video = track.cloned();
        Ok(())
    }

    async fn set_video_encoding(&self, params: EncodingParameters) -> Result<()> {
        self.state.lock().encoding = Some(params);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.stats_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.state.lock();
        if state.fail_stats {
            return Err(Error::stats(&self.tag.participant, "report unavailable"));
        }
        Ok(state.stats)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<Arc<FakeLink>>>,
    offer_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeConnector {
    pub fn links(&self) -> Vec<Arc<FakeLink>> {
        self.links.lock().clone()
    }

    /// Offers created from now on wait for a notification.
    pub fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, tag: EntryTag, events: PeerEventSender) -> Result<Arc<dyn PeerLink>> {
        let link = Arc::new(FakeLink {
            tag,
            events,
            offer_gate: self.offer_gate.lock().clone(),
            stats_gate: Mutex::new(None),
            stats_calls: AtomicUsize::new(0),
            state: Mutex::new(LinkState::default()),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

pub struct FakeDevices {
    camera_denied: bool,
    microphone_denied: bool,
    display_denied: AtomicBool,
    counter: AtomicUsize,
    displays: Mutex<Vec<LocalTrack>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self {
            camera_denied: false,
            microphone_denied: false,
            display_denied: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
            displays: Mutex::new(Vec::new()),
        }
    }

    pub fn deny_camera(mut self) -> Self {
        self.camera_denied = true;
        self
    }

    pub fn deny_microphone(mut self) -> Self {
        self.microphone_denied = true;
        self
    }

    pub fn set_display_denied(&self, denied: bool) {
        self.display_denied.store(denied, Ordering::SeqCst);
    }

    pub fn displays(&self) -> Vec<LocalTrack> {
        self.displays.lock().clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self, profile: QualityProfile) -> Result<MediaBundle> {
        if self.microphone_denied {
            return Err(Error::Acquisition("microphone permission denied".into()));
        }
        let video = match profile {
            QualityProfile::AudioOnly => None,
            _ if self.camera_denied => {
                return Err(Error::Acquisition("camera permission denied".into()))
            }
            _ => Some(LocalTrack::new(self.next_id("camera"), TrackSource::Camera)),
        };
        Ok(MediaBundle {
            audio: LocalTrack::new(self.next_id("mic"), TrackSource::Microphone),
            video,
        })
    }

    async fn display_media(&self) -> Result<LocalTrack> {
        if self.display_denied.load(Ordering::SeqCst) {
            return Err(Error::ScreenShare("display capture denied".into()));
        }
        let track = LocalTrack::new(self.next_id("screen"), TrackSource::Display);
        self.displays.lock().push(track.clone());
        Ok(track)
    }
}

#[derive(Default)]
pub struct RecordingSignals {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSignals {
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl SignalSink for RecordingSignals {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRenderer {
    local: Mutex<Option<LocalTrack>>,
    attached: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
}

impl RecordingRenderer {
    pub fn local(&self) -> Option<LocalTrack> {
        self.local.lock().clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.attached.lock().clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached.lock().clone()
    }
}

impl MediaRenderer for RecordingRenderer {
    fn show_local(&self, track: Option<&LocalTrack>) {
        *self.local.lock() = track.cloned();
    }

    fn attach_remote(&self, participant: &str, _stream: RemoteStream) {
        self.attached.lock().push(participant.to_string());
    }

    fn detach_remote(&self, participant: &str) {
        self.detached.lock().push(participant.to_string());
    }
}

type Swap = (Option<String>, Option<String>);

#[derive(Default)]
pub struct RecordingSenders {
    swaps: Mutex<Vec<Swap>>,
}

impl RecordingSenders {
    pub fn swaps(&self) -> Vec<Swap> {
        self.swaps.lock().clone()
    }
}

#[async_trait]
impl VideoSenders for RecordingSenders {
    async fn replace_video_everywhere(
        &self,
        previous: Option<&LocalTrack>,
        next: Option<&LocalTrack>,
    ) -> Result<()> {
        self.swaps.lock().push((
            previous.map(|t| t.id().to_string()),
            next.map(|t| t.id().to_string()),
        ));
        Ok(())
    }
}
