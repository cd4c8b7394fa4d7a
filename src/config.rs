use std::env;
use std::str::FromStr;
use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

use crate::media::QualityProfile;

pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Static per-session ICE setup. Never renegotiated once connections exist.
#[derive(Debug, Clone, PartialEq)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn: Option<TurnServer>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn: None,
            candidate_pool_size: 10,
        }
    }
}

impl IceConfig {
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        if let Some(ref turn) = self.turn {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        servers
    }

    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers(),
            ice_transport_policy: RTCIceTransportPolicy::All,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ice_candidate_pool_size: self.candidate_pool_size,
            ..Default::default()
        }
    }
}

/// Reconnect schedule for entries whose connection reached `failed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timings {
    pub quality_period: Duration,
    pub optimizer_period: Duration,
    pub warning_debounce: Duration,
    pub inactivity_timeout: Duration,
    pub speech_hang_time: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            quality_period: Duration::from_secs(2),
            optimizer_period: Duration::from_secs(3),
            warning_debounce: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(10),
            speech_hang_time: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub participant_id: String,
    pub ice: IceConfig,
    pub retry: RetryPolicy,
    pub timings: Timings,
    pub video_quality: QualityProfile,
    pub vad_threshold: f32,
    pub enable_video: bool,
    pub enable_screen_capture: bool,
    /// When false the user always counts as active. For hosts with no
    /// input device feeding the session.
    pub track_inactivity: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8000/ws/room/demo/".to_string(),
            participant_id: format!("user-{}", rand::random::<u32>()),
            ice: IceConfig::default(),
            retry: RetryPolicy::default(),
            timings: Timings::default(),
            video_quality: QualityProfile::Hd,
            vad_threshold: 30.0,
            enable_video: true,
            enable_screen_capture: false,
            track_inactivity: true,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let stun_servers = env::var("STUN_SERVERS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.ice.stun_servers);

        let turn = env::var("TURN_SERVER_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| TurnServer {
                url,
                username: env::var("TURN_USERNAME").unwrap_or_default(),
                credential: env::var("TURN_CREDENTIAL").unwrap_or_default(),
            });

        Self {
            signaling_url: env::var("SIGNALING_URL").unwrap_or(defaults.signaling_url),
            participant_id: env::var("PARTICIPANT_ID").unwrap_or(defaults.participant_id),
            ice: IceConfig {
                stun_servers,
                turn,
                candidate_pool_size: parse_var(
                    "ICE_CANDIDATE_POOL_SIZE",
                    defaults.ice.candidate_pool_size,
                ),
            },
            retry: RetryPolicy {
                max_attempts: parse_var("RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                base_delay: Duration::from_millis(parse_var(
                    "RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay.as_millis() as u64,
                )),
            },
            timings: defaults.timings,
            video_quality: parse_var("VIDEO_QUALITY", defaults.video_quality),
            vad_threshold: parse_var("VAD_THRESHOLD", defaults.vad_threshold),
            enable_video: parse_var("ENABLE_VIDEO", defaults.enable_video),
            enable_screen_capture: parse_var(
                "ENABLE_SCREEN_CAPTURE",
                defaults.enable_screen_capture,
            ),
            track_inactivity: parse_var("TRACK_INACTIVITY", defaults.track_inactivity),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
