//! Keyed collection of peer links, one per remote participant.
//!
//! Every entry is stamped with a generation. Anything that completes after
//! an await (offers, answers, candidates, retries, connector events) checks
//! that its generation is still current before touching the entry or the
//! signaling channel, so a `close` always wins over work still in flight.
//!
//! Lock order is media bundle first, then registry. Entry creation holds
//! both so a video swap can never miss a freshly created sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::RetryPolicy;
use crate::connection::ConnectionMonitor;
use crate::error::{Error, Result};
use crate::media::{EncodingParameters, LocalMedia, LocalTrack, VideoSenders};
use crate::metrics::ConnectionQuality;
use crate::notify::Notifier;
use crate::peer::{
    EntryTag, MediaRenderer, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender, PeerLink,
    PeerState,
};
use crate::signaling::{IceCandidate, OutboundMessage, ParticipantId, SessionDescription, SignalSink};

/// Remote candidates held per entry until its remote description is applied.
pub const MAX_PENDING_CANDIDATES: usize = 64;

struct PeerEntry {
    generation: u64,
    link: Arc<dyn PeerLink>,
    state: PeerState,
    quality: Option<ConnectionQuality>,
    remote_described: bool,
    pending_candidates: Vec<IceCandidate>,
    sampling: Arc<AtomicBool>,
}

impl PeerEntry {
    fn handle(&self, participant: &str) -> PeerHandle {
        PeerHandle {
            tag: EntryTag {
                participant: participant.to_string(),
                generation: self.generation,
            },
            link: Arc::clone(&self.link),
            state: self.state,
            sampling: Arc::clone(&self.sampling),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ParticipantId, PeerEntry>,
    next_generation: u64,
    retry_attempts: HashMap<ParticipantId, u32>,
    retry_tasks: HashMap<ParticipantId, JoinHandle<()>>,
    encoding: Option<EncodingParameters>,
    shut_down: bool,
}

impl Inner {
    fn is_current(&self, tag: &EntryTag) -> bool {
        self.entries
            .get(&tag.participant)
            .map_or(false, |entry| entry.generation == tag.generation)
    }

    fn current_mut(&mut self, tag: &EntryTag) -> Option<&mut PeerEntry> {
        self.entries
            .get_mut(&tag.participant)
            .filter(|entry| entry.generation == tag.generation)
    }

    fn cancel_retry(&mut self, participant: &str) {
        if let Some(task) = self.retry_tasks.remove(participant) {
            task.abort();
        }
    }
}

/// Snapshot of one registry entry.
#[derive(Clone)]
pub struct PeerHandle {
    tag: EntryTag,
    link: Arc<dyn PeerLink>,
    state: PeerState,
    sampling: Arc<AtomicBool>,
}

impl PeerHandle {
    pub fn participant(&self) -> &str {
        &self.tag.participant
    }

    pub fn tag(&self) -> &EntryTag {
        &self.tag
    }

    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// State when the snapshot was taken.
    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn same_entry(&self, other: &PeerHandle) -> bool {
        self.tag == other.tag && Arc::ptr_eq(&self.link, &other.link)
    }

    /// Claims the entry for one sampling pass. `None` while a previous pass
    /// is still running.
    pub fn try_begin_sampling(&self) -> Option<SamplingGuard> {
        self.sampling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SamplingGuard {
                flag: Arc::clone(&self.sampling),
            })
    }
}

pub struct SamplingGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SamplingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct PeerRegistry {
    inner: Mutex<Inner>,
    connector: Arc<dyn PeerConnector>,
    media: LocalMedia,
    signal: Arc<dyn SignalSink>,
    renderer: Arc<dyn MediaRenderer>,
    notifier: Notifier,
    monitor: ConnectionMonitor,
    retry: RetryPolicy,
    events: PeerEventSender,
    me: Weak<PeerRegistry>,
}

impl PeerRegistry {
    /// Builds the registry and starts its event pump on the current runtime.
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        media: LocalMedia,
        signal: Arc<dyn SignalSink>,
        renderer: Arc<dyn MediaRenderer>,
        notifier: Notifier,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (events, mut events_rx) = mpsc::unbounded_channel::<PeerEvent>();
        let registry = Arc::new_cyclic(|me| Self {
            inner: Mutex::new(Inner::default()),
            connector,
            media,
            signal,
            renderer,
            notifier,
            monitor: ConnectionMonitor::new(),
            retry,
            events,
            me: me.clone(),
        });

        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.handle_event(event).await;
            }
        });

        registry
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Returns the entry for `participant`, creating it and sending an offer
    /// when none exists yet.
    pub async fn open(&self, participant: &str) -> Result<PeerHandle> {
        let media = self.media.lock().await;
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get(participant) {
            return Ok(entry.handle(participant));
        }
        let handle = self
            .create_entry(&mut inner, participant, &media.tracks())
            .await?;
        drop(inner);
        drop(media);

        self.send_offer(&handle).await;
        Ok(handle)
    }

    /// Applies a remote offer, creating the entry if needed, and answers it.
    pub async fn accept_offer(&self, participant: &str, offer: SessionDescription) -> Result<()> {
        info!("WebRTC offer received from {}", participant);
        let handle = {
            let media = self.media.lock().await;
            let mut inner = self.inner.lock().await;
            match inner.entries.get(participant) {
                Some(entry) => entry.handle(participant),
                None => {
                    self.create_entry(&mut inner, participant, &media.tracks())
                        .await?
                }
            }
        };

        match handle.link.accept_offer(offer).await {
            Ok(answer) => {
                self.remote_description_applied(&handle).await;
                self.emit_if_current(
                    &handle.tag,
                    OutboundMessage::WebrtcAnswer {
                        target_id: participant.to_string(),
                        answer,
                    },
                )
                .await;
            }
            Err(e) => error!("Failed to handle offer from {}: {}", participant, e),
        }
        Ok(())
    }

    pub async fn accept_answer(&self, participant: &str, answer: SessionDescription) -> Result<()> {
        let Some(handle) = self.get(participant).await else {
            warn!("Answer from {} with no open connection, ignoring", participant);
            return Ok(());
        };

        match handle.link.accept_answer(answer).await {
            Ok(()) => self.remote_description_applied(&handle).await,
            Err(e) => error!("Failed to apply answer from {}: {}", participant, e),
        }
        Ok(())
    }

    /// Applies a trickled candidate, or holds it until the remote description is in.
    pub async fn add_remote_candidate(&self, participant: &str, candidate: IceCandidate) -> Result<()> {
        let link = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.entries.get_mut(participant) else {
                debug!("Candidate from {} with no open connection, ignoring", participant);
                return Ok(());
            };
            if !entry.remote_described {
                if entry.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                    warn!("Candidate queue for {} is full, dropping candidate", participant);
                } else {
                    entry.pending_candidates.push(candidate);
                }
                return Ok(());
            }
            Arc::clone(&entry.link)
        };

        if let Err(e) = link.add_ice_candidate(candidate).await {
            error!("Failed to add ICE candidate from {}: {}", participant, e);
        }
        Ok(())
    }

    /// Tears down the entry. Idempotent; also cancels a pending retry.
    pub async fn close(&self, participant: &str) {
        let entry = {
            let mut inner = self.inner.lock().await;
            inner.cancel_retry(participant);
            inner.retry_attempts.remove(participant);
            inner.entries.remove(participant)
        };

        if let Some(entry) = entry {
            self.dispose(participant, entry).await;
            info!("Connection closed with {}", participant);
        }
    }

    /// Closes everything and refuses new entries.
    pub async fn shutdown(&self) {
        let entries: Vec<(ParticipantId, PeerEntry)> = {
            let mut inner = self.inner.lock().await;
            inner.shut_down = true;
            for (_, task) in inner.retry_tasks.drain() {
                task.abort();
            }
            inner.retry_attempts.clear();
            inner.entries.drain().collect()
        };

        for (participant, entry) in entries {
            self.dispose(&participant, entry).await;
        }
    }

    pub async fn get(&self, participant: &str) -> Option<PeerHandle> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .get(participant)
            .map(|entry| entry.handle(participant))
    }

    pub async fn handles(&self) -> Vec<PeerHandle> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .map(|(participant, entry)| entry.handle(participant))
            .collect()
    }

    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.inner.lock().await.entries.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn quality_of(&self, participant: &str) -> Option<ConnectionQuality> {
        let inner = self.inner.lock().await;
        inner.entries.get(participant).and_then(|entry| entry.quality)
    }

    /// Records a quality sample. Dropped if the entry was closed or replaced.
    pub async fn record_quality(&self, tag: &EntryTag, quality: ConnectionQuality) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.current_mut(tag) {
            Some(entry) => {
                entry.quality = Some(quality);
                self.monitor.update_quality(&tag.participant, quality);
                true
            }
            None => false,
        }
    }

    /// Sets the outbound video encoding on every sender, and on senders
    /// created from now on.
    pub async fn apply_encoding(&self, params: EncodingParameters) {
        let handles = {
            let mut inner = self.inner.lock().await;
            inner.encoding = Some(params);
            inner
                .entries
                .iter()
                .map(|(participant, entry)| entry.handle(participant))
                .collect::<Vec<_>>()
        };

        for handle in handles {
            if let Err(e) = handle.link.set_video_encoding(params).await {
                error!(
                    "Failed to apply encoding for {}: {}",
                    handle.participant(),
                    e
                );
            }
        }
    }

    async fn create_entry(
        &self,
        inner: &mut Inner,
        participant: &str,
        tracks: &[LocalTrack],
    ) -> Result<PeerHandle> {
        if inner.shut_down {
            return Err(Error::Connection("session is closed".into()));
        }

        inner.next_generation += 1;
        let tag = EntryTag {
            participant: participant.to_string(),
            generation: inner.next_generation,
        };
        let link = self.connector.connect(tag.clone(), self.events.clone()).await?;

        for track in tracks {
            if let Err(e) = link.add_track(track).await {
                warn!("Could not attach {:?} track for {}: {}", track.kind(), participant, e);
            }
        }
        if let Some(params) = inner.encoding {
            if let Err(e) = link.set_video_encoding(params).await {
                warn!("Could not apply encoding for {}: {}", participant, e);
            }
        }

        let entry = PeerEntry {
            generation: tag.generation,
            link,
            state: PeerState::New,
            quality: None,
            remote_described: false,
            pending_candidates: Vec::new(),
            sampling: Arc::new(AtomicBool::new(false)),
        };
        let handle = entry.handle(participant);
        inner.entries.insert(participant.to_string(), entry);
        self.monitor.track(participant);
        if let Some(&attempts) = inner.retry_attempts.get(participant) {
            self.monitor.set_retry(participant, attempts);
        }
        debug!("Peer entry {} generation {} created", participant, tag.generation);
        Ok(handle)
    }

    async fn send_offer(&self, handle: &PeerHandle) {
        match handle.link.create_offer().await {
            Ok(offer) => {
                self.emit_if_current(
                    &handle.tag,
                    OutboundMessage::WebrtcOffer {
                        target_id: handle.participant().to_string(),
                        offer,
                    },
                )
                .await;
            }
            Err(e) => error!("Failed to create offer for {}: {}", handle.participant(), e),
        }
    }

    /// Sends `message` only if `tag` still names the live entry. The check
    /// and the send happen under the registry lock.
    async fn emit_if_current(&self, tag: &EntryTag, message: OutboundMessage) -> bool {
        let inner = self.inner.lock().await;
        if !inner.is_current(tag) {
            debug!(
                "Discarding stale result for {} (generation {})",
                tag.participant, tag.generation
            );
            return false;
        }
        if let Err(e) = self.signal.send(message) {
            warn!("Signaling send for {} failed: {}", tag.participant, e);
        }
        true
    }

    async fn remote_description_applied(&self, handle: &PeerHandle) {
        let pending = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.current_mut(&handle.tag) else {
                return;
            };
            entry.remote_described = true;
            std::mem::take(&mut entry.pending_candidates)
        };

        for candidate in pending {
            if let Err(e) = handle.link.add_ice_candidate(candidate).await {
                error!(
                    "Failed to add queued ICE candidate from {}: {}",
                    handle.participant(),
                    e
                );
            }
        }
    }

    async fn dispose(&self, participant: &str, entry: PeerEntry) {
        if let Err(e) = entry.link.close().await {
            warn!("Error closing connection with {}: {}", participant, e);
        }
        self.renderer.detach_remote(participant);
        self.monitor.forget(participant);
    }

    async fn handle_event(&self, event: PeerEvent) {
        let tag = event.tag;
        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.emit_if_current(
                    &tag,
                    OutboundMessage::WebrtcIceCandidate {
                        target_id: tag.participant.clone(),
                        candidate,
                    },
                )
                .await;
            }
            PeerEventKind::RemoteTrack(stream) => {
                let inner = self.inner.lock().await;
                if inner.is_current(&tag) {
                    info!("Track received from {}", tag.participant);
                    self.renderer.attach_remote(&tag.participant, stream);
                }
            }
            PeerEventKind::StateChanged(state) => self.on_state_change(tag, state).await,
        }
    }

    async fn on_state_change(&self, tag: EntryTag, state: PeerState) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.current_mut(&tag) else {
            return;
        };
        entry.state = state;
        if state == PeerState::Failed {
            entry.pending_candidates.clear();
        }
        self.monitor.update_state(&tag.participant, state);
        info!("Connection state with {}: {}", tag.participant, state);

        match state {
            PeerState::Connected => {
                inner.retry_attempts.remove(&tag.participant);
                self.notifier.success("Video connection established");
            }
            PeerState::Disconnected => {
                self.notifier.warning("Video connection interrupted");
            }
            PeerState::Failed => {
                self.notifier.error("Video connection failed");
                self.monitor
                    .set_error(&tag.participant, "connection failed".to_string());
                self.schedule_retry(&mut inner, tag);
            }
            _ => {}
        }
    }

    fn schedule_retry(&self, inner: &mut Inner, tag: EntryTag) {
        let attempts = inner.retry_attempts.entry(tag.participant.clone()).or_insert(0);
        *attempts += 1;
        let attempt = *attempts;

        if attempt > self.retry.max_attempts {
            inner.retry_attempts.remove(&tag.participant);
            inner.cancel_retry(&tag.participant);
            if let Some(entry) = inner.entries.remove(&tag.participant) {
                self.notifier.error(format!(
                    "Giving up on connection with {} after {} attempts",
                    tag.participant, self.retry.max_attempts
                ));
                let link = entry.link;
                let renderer = Arc::clone(&self.renderer);
                let monitor = self.monitor.clone();
                let participant = tag.participant;
                tokio::spawn(async move {
                    if let Err(e) = link.close().await {
                        warn!("Error closing connection with {}: {}", participant, e);
                    }
                    renderer.detach_remote(&participant);
                    monitor.forget(&participant);
                });
            }
            return;
        }

        let Some(registry) = self.me.upgrade() else {
            return;
        };
        self.monitor.set_retry(&tag.participant, attempt);
        let delay = self.retry.delay_for(attempt);
        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            tag.participant, delay, attempt, self.retry.max_attempts
        );

        let participant = tag.participant.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            registry.retry(tag).await;
        });
        if let Some(previous) = inner.retry_tasks.insert(participant, task) {
            previous.abort();
        }
    }

    /// Replaces the failed incarnation named by `tag` with a fresh one.
    async fn retry(&self, tag: EntryTag) {
        let media = self.media.lock().await;
        let mut inner = self.inner.lock().await;
        // Dropping our own handle detaches it rather than aborting.
        inner.retry_tasks.remove(&tag.participant);
        if !inner.is_current(&tag) {
            debug!("Retry for {} no longer needed", tag.participant);
            return;
        }

        let old = inner.entries.remove(&tag.participant);
        let handle = match self
            .create_entry(&mut inner, &tag.participant, &media.tracks())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Reconnect to {} failed: {}", tag.participant, e);
                self.notifier.error("Reconnection failed");
                return;
            }
        };
        drop(inner);
        drop(media);

        if let Some(old) = old {
            if let Err(e) = old.link.close().await {
                debug!("Closing failed link to {}: {}", tag.participant, e);
            }
        }
        self.send_offer(&handle).await;
    }
}

#[async_trait]
impl VideoSenders for PeerRegistry {
    async fn replace_video_everywhere(
        &self,
        previous: Option<&LocalTrack>,
        next: Option<&LocalTrack>,
    ) -> Result<()> {
        let handles = self.handles().await;
        let mut switched: Vec<&PeerHandle> = Vec::with_capacity(handles.len());

        for handle in &handles {
            if let Err(e) = handle.link.replace_video_track(next).await {
                error!(
                    "Video swap failed for {}, reverting {} sender(s): {}",
                    handle.participant(),
                    switched.len(),
                    e
                );
                for done in switched {
                    if let Err(e) = done.link.replace_video_track(previous).await {
                        error!("Revert failed for {}: {}", done.participant(), e);
                    }
                }
                return Err(e);
            }
            switched.push(handle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::QualityProfile;
    use crate::notify::NoticeLevel;
    use crate::testing::{settle, FakeConnector, FakeDevices, RecordingRenderer, RecordingSignals};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<PeerRegistry>,
        connector: Arc<FakeConnector>,
        signals: Arc<RecordingSignals>,
        renderer: Arc<RecordingRenderer>,
        media: LocalMedia,
        notices: mpsc::UnboundedReceiver<crate::notify::Notice>,
    }

    async fn fixture(retry: RetryPolicy) -> Fixture {
        let (notifier, notices) = Notifier::channel();
        let media = LocalMedia::new(notifier.clone());
        media
            .acquire(&FakeDevices::new(), QualityProfile::Hd)
            .await
            .unwrap();
        let connector = Arc::new(FakeConnector::default());
        let signals = Arc::new(RecordingSignals::default());
        let renderer = Arc::new(RecordingRenderer::default());
        let registry = PeerRegistry::new(
            connector.clone(),
            media.clone(),
            signals.clone(),
            renderer.clone(),
            notifier,
            retry,
        );
        Fixture {
            registry,
            connector,
            signals,
            renderer,
            media,
            notices,
        }
    }

    fn offers_to(signals: &RecordingSignals, participant: &str) -> usize {
        signals
            .messages()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::WebrtcOffer { target_id, .. } if target_id == participant))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_idempotent_and_offers_once() {
        let f = fixture(RetryPolicy::default()).await;

        let first = f.registry.open("alice").await.unwrap();
        let second = f.registry.open("alice").await.unwrap();

        assert!(first.same_entry(&second));
        assert_eq!(f.connector.links().len(), 1);
        assert_eq!(offers_to(&f.signals, "alice"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_attaches_shared_local_tracks() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("alice").await.unwrap();
        f.registry.open("bob").await.unwrap();

        let camera = f.media.video_track().await.unwrap();
        for link in f.connector.links() {
            assert_eq!(link.tracks().len(), 2);
            assert!(link.video_track().unwrap().same_track(&camera));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_leaves_other_entries_untouched() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("a").await.unwrap();
        f.registry.open("b").await.unwrap();
        let links = f.connector.links();
        let (link_a, link_b) = (links[0].clone(), links[1].clone());

        f.registry.close("a").await;
        f.signals.clear();
        link_a.emit_candidate("candidate:late");
        link_b.emit_candidate("candidate:b");
        settle().await;

        assert!(link_a.is_closed());
        assert!(!link_b.is_closed());
        assert!(f.registry.get("a").await.is_none());
        assert!(f.registry.get("b").await.is_some());
        assert!(f.signals.messages().iter().all(|m| m.target() != Some("a")));
        assert_eq!(f.signals.messages().len(), 1);
        assert_eq!(f.renderer.detached(), vec!["a".to_string()]);

        // idempotent
        f.registry.close("a").await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_pending_open_discards_late_offer() {
        let f = fixture(RetryPolicy::default()).await;
        let gate = f.connector.gate_offers();

        let registry = f.registry.clone();
        let opening = tokio::spawn(async move { registry.open("carol").await });
        settle().await;

        f.registry.close("carol").await;
        gate.notify_one();
        opening.await.unwrap().unwrap();
        settle().await;

        assert!(f.registry.get("carol").await.is_none());
        assert_eq!(offers_to(&f.signals, "carol"), 0);
        assert!(f.connector.links()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_offer_creates_entry_and_answers() {
        let f = fixture(RetryPolicy::default()).await;

        f.registry
            .accept_offer("dave", SessionDescription::offer("remote-offer"))
            .await
            .unwrap();

        let link = &f.connector.links()[0];
        assert_eq!(link.remote_descriptions(), vec![SessionDescription::offer("remote-offer")]);
        assert!(matches!(
            f.signals.messages().last(),
            Some(OutboundMessage::WebrtcAnswer { target_id, .. }) if target_id == "dave"
        ));
        assert_eq!(link.tracks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_and_candidate_without_entry_are_ignored() {
        let f = fixture(RetryPolicy::default()).await;

        f.registry
            .accept_answer("nobody", SessionDescription::answer("x"))
            .await
            .unwrap();
        f.registry
            .add_remote_candidate("nobody", IceCandidate::default())
            .await
            .unwrap();

        assert!(f.registry.is_empty().await);
        assert!(f.connector.links().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_wait_for_remote_description() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("erin").await.unwrap();
        let link = f.connector.links()[0].clone();

        let candidate = IceCandidate {
            candidate: "candidate:early".into(),
            ..Default::default()
        };
        f.registry
            .add_remote_candidate("erin", candidate.clone())
            .await
            .unwrap();
        assert!(link.candidates().is_empty());

        f.registry
            .accept_answer("erin", SessionDescription::answer("remote-answer"))
            .await
            .unwrap();
        assert_eq!(link.candidates(), vec![candidate]);
    }

    #[tokio::test(start_paused = true)]
    async fn early_candidate_queue_is_bounded() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("ivy").await.unwrap();
        let link = f.connector.links()[0].clone();

        for n in 0..MAX_PENDING_CANDIDATES + 10 {
            let candidate = IceCandidate {
                candidate: format!("candidate:{}", n),
                ..Default::default()
            };
            f.registry.add_remote_candidate("ivy", candidate).await.unwrap();
        }

        f.registry
            .accept_answer("ivy", SessionDescription::answer("remote-answer"))
            .await
            .unwrap();
        let applied = link.candidates();
        assert_eq!(applied.len(), MAX_PENDING_CANDIDATES);
        assert_eq!(applied[0].candidate, "candidate:0");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_discards_queued_candidates() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("jon").await.unwrap();
        let first = f.connector.links()[0].clone();
        f.registry
            .add_remote_candidate(
                "jon",
                IceCandidate {
                    candidate: "candidate:stale".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        first.emit_state(PeerState::Failed);
        settle().await;
        f.registry
            .accept_answer("jon", SessionDescription::answer("late-answer"))
            .await
            .unwrap();

        assert!(first.candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_candidates_are_forwarded() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("frank").await.unwrap();
        f.connector.links()[0].emit_candidate("candidate:local");
        settle().await;

        assert!(matches!(
            f.signals.messages().last(),
            Some(OutboundMessage::WebrtcIceCandidate { target_id, candidate })
                if target_id == "frank" && candidate.candidate == "candidate:local"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_track_goes_to_renderer() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("gina").await.unwrap();
        f.connector.links()[0].emit_remote_track();
        settle().await;

        assert_eq!(f.renderer.attached(), vec!["gina".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connection_is_reopened_after_backoff() {
        let f = fixture(RetryPolicy::default()).await;
        let before = f.registry.open("hank").await.unwrap();
        f.connector.links()[0].emit_state(PeerState::Failed);
        settle().await;

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(f.connector.links().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;

        let links = f.connector.links();
        assert_eq!(links.len(), 2);
        assert!(links[0].is_closed());
        let after = f.registry.get("hank").await.unwrap();
        assert!(!after.same_entry(&before));
        assert_eq!(offers_to(&f.signals, "hank"), 2);
        assert_eq!(f.registry.monitor().get("hank").unwrap().retry_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_queued_retry() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("ivy").await.unwrap();
        f.connector.links()[0].emit_state(PeerState::Failed);
        settle().await;

        f.registry.close("ivy").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(f.connector.links().len(), 1);
        assert!(f.registry.get("ivy").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let mut f = fixture(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(3),
        })
        .await;
        f.registry.open("jay").await.unwrap();

        for _ in 0..3 {
            f.connector.links().last().unwrap().emit_state(PeerState::Failed);
            settle().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            settle().await;
        }

        assert_eq!(f.connector.links().len(), 3);
        assert!(f.registry.get("jay").await.is_none());
        assert!(f.connector.links().iter().all(|l| l.is_closed()));

        let mut gave_up = false;
        while let Ok(notice) = f.notices.try_recv() {
            if notice.level == NoticeLevel::Error && notice.message.contains("Giving up") {
                gave_up = true;
            }
        }
        assert!(gave_up);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_resets_retry_budget() {
        let f = fixture(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
        })
        .await;
        f.registry.open("kim").await.unwrap();

        f.connector.links()[0].emit_state(PeerState::Failed);
        settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        f.connector.links()[1].emit_state(PeerState::Connected);
        settle().await;
        f.connector.links()[1].emit_state(PeerState::Failed);
        settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(f.connector.links().len(), 3);
        assert!(f.registry.get("kim").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_state_events_are_ignored() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("lee").await.unwrap();
        let old = f.connector.links()[0].clone();
        f.registry.close("lee").await;
        f.registry.open("lee").await.unwrap();

        old.emit_state(PeerState::Failed);
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(f.connector.links().len(), 2);
        assert_eq!(
            f.registry.get("lee").await.unwrap().state(),
            PeerState::New
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_entries_inherit_current_encoding() {
        let f = fixture(RetryPolicy::default()).await;
        let params = EncodingParameters {
            max_bitrate: 1_000_000,
            scale_resolution_down_by: 2.0,
            max_framerate: 24.0,
        };
        f.registry.apply_encoding(params).await;
        f.registry.open("mia").await.unwrap();

        assert_eq!(f.connector.links()[0].encoding(), Some(params));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_entries() {
        let f = fixture(RetryPolicy::default()).await;
        f.registry.open("ned").await.unwrap();
        f.registry.shutdown().await;

        assert!(f.connector.links()[0].is_closed());
        assert!(f.registry.open("ned").await.is_err());
    }
}
