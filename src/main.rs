use std::sync::Arc;

use anyhow::{bail, Result};
use dotenv::dotenv;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use conference_client::audio::MicrophoneCapture;
use conference_client::capability::{CapabilityCheck, NativeCapabilities};
use conference_client::config::ClientConfig;
use conference_client::devices::NativeDevices;
use conference_client::media::QualityProfile;
use conference_client::notify::NoticeLevel;
use conference_client::optimizer::SystemResources;
use conference_client::peer::NullRenderer;
use conference_client::room::{Platform, RoomSession};
use conference_client::signaling::{OutboundMessage, SignalingClient};
use conference_client::webrtc::WebRtcConnector;

/// Runs one console command. Returns false when the user asked to leave.
async fn run_command(session: &RoomSession, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("video") => {
            session.toggle_video().await;
        }
        Some("share") => {
            if let Err(e) = session.toggle_screen_share().await {
                warn!("Screen share: {}", e);
            }
        }
        Some("quality") => match words.next().map(str::parse::<QualityProfile>) {
            Some(Ok(profile)) => {
                if let Err(e) = session.change_quality(profile).await {
                    warn!("Quality change: {}", e);
                }
            }
            _ => warn!("usage: quality hd|sd|audio-only"),
        },
        Some("stats") => info!("{:?}", session.metrics().await),
        Some("quit") | Some("leave") => return false,
        Some(other) => warn!("Unknown command '{}' (video, share, quality, stats, quit)", other),
        None => {}
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ClientConfig::from_env();
    let report = NativeCapabilities::new(&config).check();
    report.log();
    if !report.is_supported() {
        bail!("this host cannot take part in a conference");
    }
    if !config.track_inactivity {
        info!("Inactivity tracking disabled; the user always counts as active");
    }

    info!("Connecting to {} as {}", config.signaling_url, config.participant_id);
    let mut signaling = SignalingClient::connect(&config.signaling_url).await?;
    signaling.send(OutboundMessage::Join {
        participant_id: config.participant_id.clone(),
        name: None,
    })?;

    let platform = Platform {
        connector: Arc::new(WebRtcConnector::new(config.ice.clone())?),
        devices: Arc::new(NativeDevices::new(&config)),
        renderer: Arc::new(NullRenderer),
        resources: Arc::new(SystemResources::default()),
        signal: Arc::new(signaling.sender()),
    };
    let (session, mut notices) = RoomSession::new(config, platform);
    session.init().await?;

    let (pcm_tx, pcm_rx) = mpsc::channel(64);
    let microphone = match MicrophoneCapture::start(pcm_tx) {
        Ok(capture) => capture,
        Err(e) => {
            session.leave().await;
            return Err(e.into());
        }
    };
    let (mut voice_events, _levels) = match session
        .attach_microphone(pcm_rx, microphone.sample_rate())
        .await
    {
        Ok(handles) => handles,
        Err(e) => {
            microphone.pause();
            session.leave().await;
            return Err(e.into());
        }
    };

    let mut connections = session.registry().monitor().subscribe();
    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    info!("Commands: video, share, quality <hd|sd|audio-only>, stats, quit");

    loop {
        tokio::select! {
            message = signaling.receive() => match message {
                Some(message) => session.handle_message(message).await,
                None => {
                    warn!("Signaling channel closed");
                    break;
                }
            },
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    session.activity().record_input();
                    if !run_command(&session, &line).await {
                        info!("Leaving room");
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    debug!("Console closed");
                    console_open = false;
                }
            },
            Ok(()) = connections.changed() => {
                for (participant, status) in connections.borrow_and_update().iter() {
                    debug!(
                        "{}: {:?}, quality {:?}, retries {}",
                        participant, status.state, status.quality, status.retry_attempts
                    );
                }
            },
            Some(notice) = notices.recv() => match notice.level {
                NoticeLevel::Warning | NoticeLevel::Error => warn!("[{}] {}", notice.level, notice.message),
                _ => info!("[{}] {}", notice.level, notice.message),
            },
            Ok(event) = voice_events.recv() => info!("Local voice: {:?}", event),
            _ = tokio::signal::ctrl_c() => {
                info!("Leaving room");
                break;
            }
        }
    }

    microphone.pause();
    session.leave().await;
    Ok(())
}
