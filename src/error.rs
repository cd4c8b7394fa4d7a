use thiserror::Error as ThisError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
    /// Camera or microphone denied or unavailable.
    #[error("Media acquisition failed: {0}")]
    Acquisition(String),
    #[error("Negotiation failed with {participant}: {reason}")]
    Negotiation { participant: String, reason: String },
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Screen share failed: {0}")]
    ScreenShare(String),
    #[error("Statistics unavailable for {participant}: {reason}")]
    Stats { participant: String, reason: String },
    #[error("Signaling error: {0}")]
    Signaling(String),
    #[error("Audio error: {0}")]
    Audio(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn negotiation(participant: &str, reason: impl ToString) -> Self {
        Error::Negotiation {
            participant: participant.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn stats(participant: &str, reason: impl ToString) -> Self {
        Error::Stats {
            participant: participant.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
