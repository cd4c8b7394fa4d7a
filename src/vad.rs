//! Voice activity detection on the local microphone.
//!
//! [`EnergyMeter`] turns PCM into a 0..=100 level the same way a browser
//! analyser does: Blackman window, FFT, per-bin temporal smoothing, dB mapped
//! onto a byte range, then the mean over bins. [`VoiceActivityDetector`] turns
//! levels into speaking transitions with a hang time on the way down.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub const DEFAULT_FFT_SIZE: usize = 512;
pub const DEFAULT_SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct EnergyMeter {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    pending: Vec<f32>,
    smoothing: f32,
}

impl Default for EnergyMeter {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING)
    }
}

impl EnergyMeter {
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft,
            window,
            smoothed: vec![0.0; fft_size / 2],
            pending: Vec::with_capacity(fft_size * 2),
            smoothing: smoothing.clamp(0.0, 1.0),
        }
    }

    fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Feeds mono samples. Returns the level of the last complete frame, or
    /// `None` if no frame completed.
    pub fn process(&mut self, samples: &[f32]) -> Option<f32> {
        self.pending.extend_from_slice(samples);
        let size = self.fft_size();
        let mut level = None;
        while self.pending.len() >= size {
            let frame: Vec<f32> = self.pending.drain(..size).collect();
            level = Some(self.analyse(&frame));
        }
        level
    }

    fn analyse(&mut self, frame: &[f32]) -> f32 {
        let size = frame.len();
        let mut buffer: Vec<Complex<f32>> = frame
            .iter()
            .zip(&self.window)
            .map(|(&sample, &w)| Complex::new(sample * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let scale = 255.0 / (MAX_DECIBELS - MIN_DECIBELS);
        let mut total = 0.0;
        for (bin, value) in self.smoothed.iter_mut().zip(&buffer) {
            let magnitude = value.norm() / size as f32;
            *bin = self.smoothing * *bin + (1.0 - self.smoothing) * magnitude;
            let byte = if *bin > 0.0 {
                let db = 20.0 * bin.log10();
                (scale * (db - MIN_DECIBELS)).clamp(0.0, 255.0).floor()
            } else {
                0.0
            };
            total += byte;
        }

        let average = total / self.smoothed.len() as f32;
        average.round().min(100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceEvent {
    SpeakingStarted,
    SpeakingStopped,
}

/// Level-to-speaking state machine. Starts fire at once; stops wait for
/// `hang_time` of continuous quiet.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    hang_time: Duration,
    speaking: bool,
    stop_at: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32, hang_time: Duration) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 100.0),
            hang_time,
            speaking: false,
            stop_at: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// When a pending stop falls due.
    pub fn deadline(&self) -> Option<Instant> {
        self.stop_at
    }

    pub fn process(&mut self, level: f32, now: Instant) -> Vec<VoiceEvent> {
        let mut events: Vec<VoiceEvent> = self.poll(now).into_iter().collect();

        if level > self.threshold {
            self.stop_at = None;
            if !self.speaking {
                self.speaking = true;
                events.push(VoiceEvent::SpeakingStarted);
            }
        } else if self.speaking && self.stop_at.is_none() {
            self.stop_at = Some(now + self.hang_time);
        }
        events
    }

    /// Fires the pending stop if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<VoiceEvent> {
        match self.stop_at {
            Some(at) if at <= now => {
                self.stop_at = None;
                self.speaking = false;
                Some(VoiceEvent::SpeakingStopped)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VoiceLevel {
    pub volume: f32,
    pub speaking: bool,
}

/// Running detector fed by a PCM frame channel.
pub struct VoiceActivityMonitor {
    events: broadcast::Sender<VoiceEvent>,
    level: watch::Receiver<VoiceLevel>,
    task: JoinHandle<()>,
}

impl VoiceActivityMonitor {
    pub fn spawn(
        mut frames: mpsc::Receiver<Vec<f32>>,
        threshold: f32,
        hang_time: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let (level_tx, level) = watch::channel(VoiceLevel::default());
        let tx = events.clone();

        let task = tokio::spawn(async move {
            let mut meter = EnergyMeter::default();
            let mut detector = VoiceActivityDetector::new(threshold, hang_time);
            info!("Voice activity detector started (threshold {})", threshold);

            loop {
                let deadline = detector.deadline();
                tokio::select! {
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        let Some(volume) = meter.process(&frame) else { continue };
                        for event in detector.process(volume, Instant::now()) {
                            debug!("Voice activity: {:?}", event);
                            let _ = tx.send(event);
                        }
                        level_tx.send_replace(VoiceLevel {
                            volume,
                            speaking: detector.is_speaking(),
                        });
                    }
                    _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                        if let Some(event) = detector.poll(Instant::now()) {
                            debug!("Voice activity: {:?}", event);
                            let _ = tx.send(event);
                            level_tx.send_modify(|level| level.speaking = false);
                        }
                    }
                }
            }
            info!("Voice activity detector stopped");
        });

        Self { events, level, task }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub fn level(&self) -> watch::Receiver<VoiceLevel> {
        self.level.clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for VoiceActivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::settle;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn noise(len: usize, amplitude: f32, rng: &mut StdRng) -> Vec<f32> {
        (0..len).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
    }

    #[test]
    fn silence_reads_zero() {
        let mut meter = EnergyMeter::default();
        assert_eq!(meter.process(&[0.0; 512]), Some(0.0));
    }

    #[test]
    fn partial_frame_waits_for_more_samples() {
        let mut meter = EnergyMeter::default();
        assert_eq!(meter.process(&[0.0; 300]), None);
        assert_eq!(meter.process(&[0.0; 300]), Some(0.0));
    }

    #[test]
    fn loud_noise_saturates_and_decays() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut meter = EnergyMeter::default();
        let loud = meter.process(&noise(512, 1.0, &mut rng)).unwrap();
        assert!(loud > 30.0, "level {}", loud);

        let mut level = loud;
        for _ in 0..60 {
            level = meter.process(&[0.0; 512]).unwrap();
        }
        assert!(level < loud);
        assert_eq!(level, 0.0);
    }

    #[test]
    fn speech_start_is_immediate_and_stop_waits_for_hang_time() {
        let start = Instant::now();
        let mut vad = VoiceActivityDetector::new(30.0, Duration::from_millis(500));
        let step = Duration::from_millis(50);
        let mut started_at = Vec::new();
        let mut stopped = 0;

        for (i, level) in [10.0, 10.0, 10.0, 40.0, 10.0, 10.0].into_iter().enumerate() {
            for event in vad.process(level, start + step * i as u32) {
                match event {
                    VoiceEvent::SpeakingStarted => started_at.push(i + 1),
                    VoiceEvent::SpeakingStopped => stopped += 1,
                }
            }
        }
        assert_eq!(started_at, vec![4]);
        assert_eq!(stopped, 0);

        // the first quiet sample came at 200ms
        let quiet_since = start + step * 4;
        assert_eq!(vad.poll(quiet_since + Duration::from_millis(499)), None);
        assert_eq!(
            vad.poll(quiet_since + Duration::from_millis(500)),
            Some(VoiceEvent::SpeakingStopped)
        );
        assert!(!vad.is_speaking());
    }

    #[test]
    fn speech_inside_hang_time_cancels_stop() {
        let start = Instant::now();
        let mut vad = VoiceActivityDetector::new(30.0, Duration::from_millis(500));
        vad.process(50.0, start);
        vad.process(5.0, start + Duration::from_millis(100));
        assert!(vad
            .process(50.0, start + Duration::from_millis(300))
            .is_empty());
        assert_eq!(vad.deadline(), None);
        assert_eq!(vad.poll(start + Duration::from_secs(5)), None);
        assert!(vad.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_events_and_levels() {
        let (frames, rx) = mpsc::channel(128);
        let monitor = VoiceActivityMonitor::spawn(rx, 30.0, Duration::from_millis(500));
        let mut events = monitor.subscribe();
        let mut rng = StdRng::seed_from_u64(11);

        frames.send(noise(512, 1.0, &mut rng)).await.unwrap();
        settle().await;
        assert_eq!(events.try_recv().unwrap(), VoiceEvent::SpeakingStarted);
        assert!(monitor.level().borrow().speaking);

        for _ in 0..60 {
            frames.send(vec![0.0; 512]).await.unwrap();
        }
        settle().await;
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(events.try_recv().unwrap(), VoiceEvent::SpeakingStopped);
        let level = *monitor.level().borrow();
        assert!(!level.speaking);
        assert_eq!(level.volume, 0.0);
    }
}
