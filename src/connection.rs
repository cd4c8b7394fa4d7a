use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::metrics::ConnectionQuality;
use crate::peer::PeerState;
use crate::signaling::ParticipantId;

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: PeerState,
    pub quality: Option<ConnectionQuality>,
    pub retry_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: PeerState::New,
            quality: None,
            retry_attempts: 0,
            last_error: None,
        }
    }
}

pub type StatusMap = HashMap<ParticipantId, ConnectionStatus>;

/// Per-participant status mirror for whatever renders it.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<StatusMap>>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(StatusMap::new());
        Self {
            status: Arc::new(status),
        }
    }

    pub fn track(&self, participant: &str) {
        self.status.send_modify(|map| {
            map.insert(participant.to_string(), ConnectionStatus::default());
        });
    }

    pub fn update_state(&self, participant: &str, state: PeerState) {
        self.modify(participant, |status| {
            status.state = state;
            if state == PeerState::Connected {
                status.last_error = None;
                status.retry_attempts = 0;
            }
        });
    }

    pub fn update_quality(&self, participant: &str, quality: ConnectionQuality) {
        self.modify(participant, |status| status.quality = Some(quality));
    }

    pub fn set_retry(&self, participant: &str, attempts: u32) {
        self.modify(participant, |status| status.retry_attempts = attempts);
    }

    pub fn set_error(&self, participant: &str, error: String) {
        self.modify(participant, |status| status.last_error = Some(error));
    }

    pub fn forget(&self, participant: &str) {
        self.status.send_if_modified(|map| map.remove(participant).is_some());
    }

    pub fn get(&self, participant: &str) -> Option<ConnectionStatus> {
        self.status.borrow().get(participant).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusMap> {
        self.status.subscribe()
    }

    fn modify(&self, participant: &str, f: impl FnOnce(&mut ConnectionStatus)) {
        self.status.send_if_modified(|map| match map.get_mut(participant) {
            Some(status) => {
                f(status);
                true
            }
            None => false,
        });
    }
}
