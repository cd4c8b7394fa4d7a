use std::thread;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use log::{debug, error, info, warn};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::media::LocalMedia;

pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_FRAME: Duration = Duration::from_millis(20);
const OPUS_FRAME_SAMPLES: usize = (OPUS_SAMPLE_RATE / 50) as usize;
const MAX_PACKET_SIZE: usize = 4000;

/// Default microphone, delivered as mono f32 frames on a channel. Feed the
/// receiver to [`spawn_uplink`] to send it.
///
/// The cpal stream is not `Send`; keep this on the thread that created it.
pub struct MicrophoneCapture {
    stream: cpal::Stream,
    sample_rate: u32,
}

impl MicrophoneCapture {
    /// Opens the default input device. Frames that do not fit in the channel
    /// are dropped rather than blocking the audio callback.
    pub fn start(frames: mpsc::Sender<Vec<f32>>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".into()))?;

        let config = device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        info!(
            "Microphone: {} ({:?})",
            device.name().unwrap_or_else(|_| "unknown".into()),
            config
        );

        let sample_rate = config.sample_rate().0;
        let stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(&device, &config.into(), frames)?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(&device, &config.into(), frames)?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(&device, &config.into(), frames)?,
            sample_format => {
                return Err(Error::Audio(format!(
                    "unsupported sample format: {:?}",
                    sample_format
                )))
            }
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Self {
            stream,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn pause(&self) {
        if let Err(e) = self.stream.pause() {
            warn!("Failed to pause microphone: {}", e);
        }
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        f32: FromSample<T>,
    {
        let channels = config.channels as usize;
        let err_fn = |err| error!("An error occurred on the input audio stream: {}", err);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let _ = frames.try_send(downmix(data, channels));
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))
    }
}

/// Averages interleaved channels into one.
pub fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
        })
        .collect()
}

/// Mono microphone PCM in, 20 ms Opus packets at 48 kHz out.
pub struct OpusPacketizer {
    encoder: opus::Encoder,
    resampler: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    output: Vec<f32>,
}

impl OpusPacketizer {
    pub fn new(input_rate: u32) -> Result<Self> {
        let encoder = opus::Encoder::new(
            OPUS_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )
        .map_err(|e| Error::Audio(format!("Failed to create Opus encoder: {}", e)))?;

        let resampler = if input_rate == OPUS_SAMPLE_RATE {
            None
        } else {
            let chunk = (input_rate / 50).max(1) as usize;
            let resampler = FftFixedIn::new(
                input_rate as usize,
                OPUS_SAMPLE_RATE as usize,
                chunk,
                2,
                1,
            )
            .map_err(|e| Error::Audio(format!("Failed to create resampler: {}", e)))?;
            Some(resampler)
        };

        Ok(Self {
            encoder,
            resampler,
            input: Vec::new(),
            output: Vec::new(),
        })
    }

    /// Buffers `pcm` and returns every packet that is now complete.
    pub fn push(&mut self, pcm: &[f32]) -> Result<Vec<Bytes>> {
        match self.resampler {
            None => self.output.extend_from_slice(pcm),
            Some(ref mut resampler) => {
                self.input.extend_from_slice(pcm);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.input.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.input.drain(..needed).collect();
                    let input = vec![chunk];
                    let resampled = resampler
                        .process(&input, None)
                        .map_err(|e| Error::Audio(format!("Resampling failed: {}", e)))?;
                    if let Some(channel) = resampled.into_iter().next() {
                        self.output.extend(channel);
                    }
                }
            }
        }

        let mut packets = Vec::new();
        while self.output.len() >= OPUS_FRAME_SAMPLES {
            let frame: Vec<f32> = self.output.drain(..OPUS_FRAME_SAMPLES).collect();
            let packet = self
                .encoder
                .encode_vec_float(&frame, MAX_PACKET_SIZE)
                .map_err(|e| Error::Audio(format!("Opus encoding failed: {}", e)))?;
            packets.push(Bytes::from(packet));
        }
        Ok(packets)
    }
}

/// Sends microphone frames out on the current local audio track and passes
/// each frame on to `detector`.
///
/// Encoding runs on its own thread; the returned task writes the packets.
/// Both stop when `pcm` closes or the task is aborted.
pub async fn spawn_uplink(
    mut pcm: mpsc::Receiver<Vec<f32>>,
    sample_rate: u32,
    media: LocalMedia,
    detector: mpsc::Sender<Vec<f32>>,
) -> Result<JoinHandle<()>> {
    let (packets_tx, mut packets_rx) = mpsc::channel::<Bytes>(32);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

    thread::Builder::new()
        .name("opus-encoder".into())
        .spawn(move || {
            let mut packetizer = match OpusPacketizer::new(sample_rate) {
                Ok(packetizer) => {
                    let _ = ready_tx.send(Ok(()));
                    packetizer
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while let Some(frame) = pcm.blocking_recv() {
                let _ = detector.try_send(frame.clone());
                match packetizer.push(&frame) {
                    Ok(packets) => {
                        for packet in packets {
                            if packets_tx.blocking_send(packet).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Dropping microphone frame: {}", e),
                }
            }
        })
        .map_err(|e| Error::Audio(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| Error::Audio("encoder thread exited".into()))??;
    info!("Microphone uplink running at {} Hz", sample_rate);

    Ok(tokio::spawn(async move {
        while let Some(data) = packets_rx.recv().await {
            let Some(track) = media.audio_track().await else {
                continue;
            };
            let sample = webrtc::media::Sample {
                data,
                duration: OPUS_FRAME,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample, Duration::ZERO).await {
                debug!("Audio sample not sent: {}", e);
            }
        }
    }))
}

/// True if the host exposes a default input device.
pub fn input_available() -> bool {
    cpal::default_host().default_input_device().is_some()
}

pub fn output_available() -> bool {
    cpal::default_host().default_output_device().is_some()
}
