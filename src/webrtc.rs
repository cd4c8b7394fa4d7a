use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceConfig;
use crate::error::{Error, Result};
use crate::media::{EncodingParameters, LocalTrack, TrackKind};
use crate::peer::{
    EntryTag, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender, PeerLink, RemoteStream,
    TransportStats,
};
use crate::signaling::{IceCandidate, SessionDescription};

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct WebRtcConnector {
    api: API,
    ice: IceConfig,
}

impl WebRtcConnector {
    pub fn new(ice: IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice })
    }
}

fn emit(events: &PeerEventSender, tag: &EntryTag, kind: PeerEventKind) {
    let _ = events.send(PeerEvent {
        tag: tag.clone(),
        kind,
    });
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, tag: EntryTag, events: PeerEventSender) -> Result<Arc<dyn PeerLink>> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.ice.to_rtc_configuration())
                .await?,
        );

        let (ev, t) = (events.clone(), tag.clone());
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let (events, tag) = (ev.clone(), t.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for {}", tag.participant);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => emit(
                        &events,
                        &tag,
                        PeerEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                    ),
                    Err(e) => warn!("Unusable local candidate for {}: {}", tag.participant, e),
                }
            })
        }));

        let (ev, t) = (events.clone(), tag.clone());
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let (events, tag) = (ev.clone(), t.clone());
                Box::pin(async move {
                    debug!("Peer connection state for {}: {}", tag.participant, state);
                    emit(&events, &tag, PeerEventKind::StateChanged(state.into()));
                })
            },
        ));

        let (ev, t) = (events, tag.clone());
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let (events, tag) = (ev.clone(), t.clone());
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    emit(
                        &events,
                        &tag,
                        PeerEventKind::RemoteTrack(RemoteStream {
                            stream_id: track.stream_id(),
                            track_id: track.id(),
                            kind,
                            track: Some(track),
                        }),
                    );
                })
            },
        ));

        info!(
            "Peer connection created for {} (generation {})",
            tag.participant, tag.generation
        );
        Ok(Arc::new(WebRtcLink {
            participant: tag.participant,
            peer_connection,
            video_sender: Mutex::new(None),
            video_track: SyncMutex::new(None),
            encoding: SyncMutex::new(EncodingParameters::default()),
        }))
    }
}

pub struct WebRtcLink {
    participant: String,
    peer_connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    video_track: SyncMutex<Option<LocalTrack>>,
    encoding: SyncMutex<EncodingParameters>,
}

impl WebRtcLink {
    fn negotiation(&self, e: webrtc::Error) -> Error {
        Error::negotiation(&self.participant, e)
    }

    fn attach_video(&self, track: Option<&LocalTrack>) {
        let params = *self.encoding.lock();
        if let Some(track) = track {
            track.set_encoding_hint(params);
        }
        *self.video_track.lock() = track.cloned();
    }
}

/// Drains RTCP for a sender so interceptors keep running.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(Arc::clone(track.sample_track()) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        drain_rtcp(Arc::clone(&sender));

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(sender);
            self.attach_video(Some(track));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| self.negotiation(e))?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| self.negotiation(e))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if self.peer_connection.signaling_state() != RTCSignalingState::Stable {
            warn!(
                "Offer from {} while signaling state is {}",
                self.participant,
                self.peer_connection.signaling_state()
            );
        }
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(|e| self.negotiation(e))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| self.negotiation(e))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| self.negotiation(e))?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| self.negotiation(e))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(|e| self.negotiation(e))?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| self.negotiation(e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| self.negotiation(e))
    }

    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> Result<()> {
        let slot = self.video_sender.lock().await;
        let Some(ref sender) = *slot else {
            warn!("No video sender for {}, nothing to replace", self.participant);
            return Ok(());
        };

        let next = track.map(|t| Arc::clone(t.sample_track()) as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(next).await?;
        self.attach_video(track);
        Ok(())
    }

    async fn set_video_encoding(&self, params: EncodingParameters) -> Result<()> {
        *self.encoding.lock() = params;
        if let Some(ref track) = *self.video_track.lock() {
            track.set_encoding_hint(params);
        }
        debug!(
            "Encoding for {}: {} bps, scale {}, {} fps",
            self.participant, params.max_bitrate, params.scale_resolution_down_by, params.max_framerate
        );
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        let report = self.peer_connection.get_stats().await;
        let mut stats = TransportStats::default();

        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if pair.current_round_trip_time > 0.0 {
                        stats.round_trip_time =
                            Some(Duration::from_secs_f64(pair.current_round_trip_time));
                    }
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_lost += remote.packets_lost.max(0) as u64;
                    stats.packets_received += remote.packets_received;
                }
                _ => {}
            }
        }

        stats.outbound_video = self
            .video_track
            .lock()
            .as_ref()
            .map(|track| track.encode_stats());
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
