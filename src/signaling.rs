use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

pub type ParticipantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the JSON shape browsers exchange: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Join {
        participant_id: ParticipantId,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    WebrtcOffer {
        target_id: ParticipantId,
        offer: SessionDescription,
    },
    WebrtcAnswer {
        target_id: ParticipantId,
        answer: SessionDescription,
    },
    WebrtcIceCandidate {
        target_id: ParticipantId,
        candidate: IceCandidate,
    },
    ScreenShareStarted {
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        participant_id: ParticipantId,
    },
    VideoToggle {
        active: bool,
    },
}

impl OutboundMessage {
    /// The remote participant this message is addressed to, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            OutboundMessage::WebrtcOffer { target_id, .. }
            | OutboundMessage::WebrtcAnswer { target_id, .. }
            | OutboundMessage::WebrtcIceCandidate { target_id, .. } => Some(target_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParticipantInfo {
    #[serde(deserialize_with = "participant_id")]
    pub id: ParticipantId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    ParticipantsList {
        #[serde(default)]
        participants: Vec<ParticipantInfo>,
    },
    ParticipantJoined {
        #[serde(deserialize_with = "participant_id")]
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        #[serde(deserialize_with = "participant_id")]
        participant_id: ParticipantId,
    },
    WebrtcOffer {
        #[serde(deserialize_with = "participant_id")]
        from_id: ParticipantId,
        offer: SessionDescription,
    },
    WebrtcAnswer {
        #[serde(deserialize_with = "participant_id")]
        from_id: ParticipantId,
        answer: SessionDescription,
    },
    WebrtcIceCandidate {
        #[serde(deserialize_with = "participant_id")]
        from_id: ParticipantId,
        candidate: IceCandidate,
    },
    ScreenShareStarted {
        #[serde(deserialize_with = "participant_id")]
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        #[serde(deserialize_with = "participant_id")]
        participant_id: ParticipantId,
    },
    /// Room traffic that is not ours to handle (translations, transcripts, ...).
    #[serde(other)]
    Other,
}

/// The room server hands out numeric ids in some deployments.
fn participant_id<'de, D>(deserializer: D) -> std::result::Result<ParticipantId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// The room controller's send primitive.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<()>;
}

impl SignalSink for mpsc::UnboundedSender<OutboundMessage> {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|e| Error::Signaling(format!("Failed to queue message: {}", e)))
    }
}

/// Full-duplex JSON channel to the room server.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    rx: mpsc::Receiver<InboundMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, rx) = mpsc::channel(100);
        let (tx, mut outgoing_rx) = mpsc::unbounded_channel::<OutboundMessage>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping unserializable message: {}", e),
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(signal) => {
                        if incoming_tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring unparseable room message: {}", e),
                }
            }
        });

        Ok(Self { tx, rx })
    }

    /// A sender handle collaborators can hold on to.
    pub fn sender(&self) -> mpsc::UnboundedSender<OutboundMessage> {
        self.tx.clone()
    }

    pub fn send(&self, msg: OutboundMessage) -> Result<()> {
        SignalSink::send(&self.tx, msg)
    }

    pub async fn receive(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}
