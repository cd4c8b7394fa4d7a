//! Adaptive outbound bitrate.
//!
//! Every period the controller reads encoder cost, memory pressure, outbound
//! frame rate and user activity, then picks an [`OptimizationMode`]. Moving
//! back to `Normal` needs every metric comfortably inside its limit, so the
//! mode does not flap around a threshold.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::Timings;
use crate::media::{EncodingParameters, LocalMedia, OutboundVideoStats};
use crate::notify::Notifier;
use crate::registry::PeerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizationMode {
    Normal,
    Economy,
    UltraEconomy,
}

impl OptimizationMode {
    pub fn encoding(self) -> EncodingParameters {
        match self {
            OptimizationMode::Normal => EncodingParameters {
                max_bitrate: 2_500_000,
                scale_resolution_down_by: 1.0,
                max_framerate: 30.0,
            },
            OptimizationMode::Economy => EncodingParameters {
                max_bitrate: 1_000_000,
                scale_resolution_down_by: 2.0,
                max_framerate: 24.0,
            },
            OptimizationMode::UltraEconomy => EncodingParameters {
                max_bitrate: 500_000,
                scale_resolution_down_by: 4.0,
                max_framerate: 15.0,
            },
        }
    }

    fn notice(self) -> &'static str {
        match self {
            OptimizationMode::Normal => "Normal mode restored",
            OptimizationMode::Economy => "Economy mode enabled (high CPU)",
            OptimizationMode::UltraEconomy => "Ultra-economy mode (maximum optimization)",
        }
    }
}

impl fmt::Display for OptimizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationMode::Normal => write!(f, "normal"),
            OptimizationMode::Economy => write!(f, "economy"),
            OptimizationMode::UltraEconomy => write!(f, "ultra-economy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_high: f64,
    pub cpu_critical: f64,
    pub memory_high: f64,
    pub frame_rate_low: f64,
    /// Fraction of the CPU/memory limits that must be undercut to relax.
    pub relax_factor: f64,
    /// Multiple of the frame-rate floor that must be exceeded to relax.
    pub frame_rate_relax_factor: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_high: 70.0,
            cpu_critical: 85.0,
            memory_high: 70.0,
            frame_rate_low: 15.0,
            relax_factor: 0.7,
            frame_rate_relax_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub frame_rate: f64,
    pub user_active: bool,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            frame_rate: 30.0,
            user_active: true,
        }
    }
}

/// Mode state machine with hysteresis. No I/O.
#[derive(Debug, Clone)]
pub struct ModePolicy {
    thresholds: Thresholds,
    mode: OptimizationMode,
}

impl Default for ModePolicy {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl ModePolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            mode: OptimizationMode::Normal,
        }
    }

    pub fn mode(&self) -> OptimizationMode {
        self.mode
    }

    pub fn should_tighten(&self, s: &ResourceSnapshot) -> bool {
        let t = &self.thresholds;
        s.cpu_percent > t.cpu_high
            || s.memory_percent > t.memory_high
            || s.frame_rate < t.frame_rate_low
            || !s.user_active
    }

    pub fn can_relax(&self, s: &ResourceSnapshot) -> bool {
        let t = &self.thresholds;
        s.cpu_percent < t.cpu_high * t.relax_factor
            && s.memory_percent < t.memory_high * t.relax_factor
            && s.frame_rate > t.frame_rate_low * t.frame_rate_relax_factor
            && s.user_active
    }

    fn tightened_mode(&self, s: &ResourceSnapshot) -> OptimizationMode {
        let t = &self.thresholds;
        if s.cpu_percent > t.cpu_critical || (!s.user_active && s.cpu_percent > t.cpu_high) {
            OptimizationMode::UltraEconomy
        } else {
            OptimizationMode::Economy
        }
    }

    /// Feeds one snapshot. Returns the new mode when it changed.
    pub fn evaluate(&mut self, s: &ResourceSnapshot) -> Option<OptimizationMode> {
        let next = if self.should_tighten(s) {
            self.tightened_mode(s)
        } else if self.mode != OptimizationMode::Normal && self.can_relax(s) {
            OptimizationMode::Normal
        } else {
            self.mode
        };

        if next == self.mode {
            return None;
        }
        self.mode = next;
        Some(next)
    }
}

/// Records user input; the user counts as inactive after a quiet period.
#[derive(Clone)]
pub struct ActivityTracker {
    last_input: Arc<SyncMutex<Instant>>,
    timeout: Option<Duration>,
    resumed: Arc<Notify>,
}

impl ActivityTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_input: Arc::new(SyncMutex::new(Instant::now())),
            timeout: Some(timeout),
            resumed: Arc::new(Notify::new()),
        }
    }

    /// A tracker that never reports the user as inactive.
    pub fn always_active() -> Self {
        Self {
            timeout: None,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Call on any keyboard, pointer or touch event.
    pub fn record_input(&self) {
        let was_active = self.is_active();
        *self.last_input.lock() = Instant::now();
        if !was_active {
            self.resumed.notify_one();
        }
    }

    pub fn is_active(&self) -> bool {
        match self.timeout {
            Some(timeout) => self.last_input.lock().elapsed() < timeout,
            None => true,
        }
    }

    /// Resolves when input arrives after a period of inactivity.
    pub async fn resumed(&self) {
        self.resumed.notified().await;
    }
}

/// Memory pressure source.
pub trait ResourceSource: Send + Sync {
    /// Used/total as a percentage, if the platform reports it.
    fn memory_percent(&self) -> Option<f64>;
}

pub struct SystemResources {
    system: SyncMutex<System>,
}

impl Default for SystemResources {
    fn default() -> Self {
        Self {
            system: SyncMutex::new(System::new()),
        }
    }
}

impl ResourceSource for SystemResources {
    fn memory_percent(&self) -> Option<f64> {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        Some((sys.used_memory() as f64 / total as f64 * 100.0).min(100.0))
    }
}

/// Encoder cost as a share of the per-frame time budget.
pub fn cpu_percent_from(stats: &OutboundVideoStats) -> Option<f64> {
    let average = stats.average_encode_time()?;
    let fps = stats.frames_per_second.filter(|fps| *fps > 0.0).unwrap_or(30.0);
    let budget = 1.0 / fps;
    Some((average.as_secs_f64() / budget * 100.0).min(100.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub frame_rate: f64,
    pub mode: OptimizationMode,
    pub user_active: bool,
}

pub struct BitrateController {
    registry: Arc<PeerRegistry>,
    media: LocalMedia,
    notifier: Notifier,
    activity: ActivityTracker,
    resources: Arc<dyn ResourceSource>,
    period: Duration,
    policy: Mutex<ModePolicy>,
    latest: SyncMutex<ResourceSnapshot>,
    running: AtomicBool,
}

impl BitrateController {
    pub fn new(
        registry: Arc<PeerRegistry>,
        media: LocalMedia,
        notifier: Notifier,
        activity: ActivityTracker,
        resources: Arc<dyn ResourceSource>,
        timings: &Timings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            media,
            notifier,
            activity,
            resources,
            period: timings.optimizer_period,
            policy: Mutex::new(ModePolicy::default()),
            latest: SyncMutex::new(ResourceSnapshot::default()),
            running: AtomicBool::new(false),
        })
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub async fn mode(&self) -> OptimizationMode {
        self.policy.lock().await.mode()
    }

    pub async fn metrics(&self) -> PerformanceMetrics {
        let latest = *self.latest.lock();
        PerformanceMetrics {
            cpu_percent: latest.cpu_percent,
            memory_percent: latest.memory_percent,
            frame_rate: latest.frame_rate,
            mode: self.mode().await,
            user_active: latest.user_active,
        }
    }

    pub fn start_monitoring(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + controller.period, controller.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.run_pass().await,
                    _ = controller.activity.resumed() => {
                        if controller.mode().await == OptimizationMode::UltraEconomy {
                            controller.run_pass().await;
                        }
                    }
                }
            }
        })
    }

    /// One sample-and-apply pass. Skipped if the previous one is still running.
    pub async fn run_pass(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Optimizer pass still running, skipping");
            return;
        }
        let snapshot = self.sample().await;
        self.apply(snapshot).await;
        self.running.store(false, Ordering::Release);
    }

    async fn sample(&self) -> ResourceSnapshot {
        let handles = self.registry.handles().await;
        let reads = handles.iter().map(|handle| async move {
            match handle.link().stats().await {
                Ok(stats) => stats.outbound_video,
                Err(e) => {
                    debug!("Performance stats for {} unavailable: {}", handle.participant(), e);
                    None
                }
            }
        });

        let mut snapshot = ResourceSnapshot {
            user_active: self.activity.is_active(),
            memory_percent: self.resources.memory_percent().unwrap_or(0.0),
            ..Default::default()
        };
        let mut frame_rate: Option<f64> = None;
        for video in join_all(reads).await.into_iter().flatten() {
            if let Some(cpu) = cpu_percent_from(&video) {
                snapshot.cpu_percent = snapshot.cpu_percent.max(cpu);
            }
            if let Some(fps) = video.frames_per_second {
                frame_rate = Some(frame_rate.map_or(fps, |f: f64| f.min(fps)));
            }
        }
        if let Some(fps) = frame_rate {
            snapshot.frame_rate = fps;
        }
        snapshot
    }

    /// Runs the policy on `snapshot` and pushes any change to every sender.
    pub async fn apply(&self, snapshot: ResourceSnapshot) -> OptimizationMode {
        *self.latest.lock() = snapshot;
        let mut policy = self.policy.lock().await;
        let changed = policy.evaluate(&snapshot);
        let mode = policy.mode();

        if let Some(mode) = changed {
            info!(
                "Optimization: switching to {} (CPU {:.1}%, memory {:.1}%, FPS {:.1}, active {})",
                mode,
                snapshot.cpu_percent,
                snapshot.memory_percent,
                snapshot.frame_rate,
                snapshot.user_active
            );
            self.registry.apply_encoding(mode.encoding()).await;
            self.notifier.info(mode.notice());
        }

        let suspend = mode == OptimizationMode::UltraEconomy && !snapshot.user_active;
        self.media.set_power_save(suspend).await;
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::media::QualityProfile;
    use crate::peer::{NullRenderer, TransportStats};
    use crate::testing::{settle, FakeConnector, FakeDevices, RecordingSignals};

    struct FixedResources(Option<f64>);

    impl ResourceSource for FixedResources {
        fn memory_percent(&self) -> Option<f64> {
            self.0
        }
    }

    fn snap(cpu: f64, memory: f64, fps: f64, active: bool) -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            frame_rate: fps,
            user_active: active,
        }
    }

    async fn controller() -> (Arc<BitrateController>, Arc<FakeConnector>, Arc<PeerRegistry>, LocalMedia) {
        let (notifier, _notices) = Notifier::channel();
        let media = LocalMedia::new(notifier.clone());
        media
            .acquire(&FakeDevices::new(), QualityProfile::Hd)
            .await
            .unwrap();
        let connector = Arc::new(FakeConnector::default());
        let registry = PeerRegistry::new(
            connector.clone(),
            media.clone(),
            Arc::new(RecordingSignals::default()),
            Arc::new(NullRenderer),
            notifier.clone(),
            RetryPolicy::default(),
        );
        let timings = Timings::default();
        let controller = BitrateController::new(
            registry.clone(),
            media.clone(),
            notifier,
            ActivityTracker::new(timings.inactivity_timeout),
            Arc::new(FixedResources(Some(40.0))),
            &timings,
        );
        (controller, connector, registry, media)
    }

    #[test]
    fn tightening_picks_economy_or_ultra() {
        let mut policy = ModePolicy::default();
        assert_eq!(policy.evaluate(&snap(75.0, 10.0, 30.0, true)), Some(OptimizationMode::Economy));
        assert_eq!(
            policy.evaluate(&snap(90.0, 10.0, 30.0, true)),
            Some(OptimizationMode::UltraEconomy)
        );

        let mut policy = ModePolicy::default();
        assert_eq!(policy.evaluate(&snap(10.0, 80.0, 30.0, true)), Some(OptimizationMode::Economy));

        let mut policy = ModePolicy::default();
        assert_eq!(policy.evaluate(&snap(10.0, 10.0, 10.0, true)), Some(OptimizationMode::Economy));

        let mut policy = ModePolicy::default();
        assert_eq!(policy.evaluate(&snap(10.0, 10.0, 30.0, false)), Some(OptimizationMode::Economy));
        assert_eq!(
            policy.evaluate(&snap(75.0, 10.0, 30.0, false)),
            Some(OptimizationMode::UltraEconomy)
        );
    }

    #[test]
    fn relaxation_needs_every_metric_inside_the_margin() {
        let mut policy = ModePolicy::default();
        policy.evaluate(&snap(75.0, 10.0, 30.0, true));
        assert_eq!(policy.mode(), OptimizationMode::Economy);

        // back under the tightening line but not under the relax line
        assert_eq!(policy.evaluate(&snap(60.0, 10.0, 30.0, true)), None);
        assert_eq!(policy.evaluate(&snap(40.0, 60.0, 30.0, true)), None);
        assert_eq!(policy.evaluate(&snap(40.0, 10.0, 20.0, true)), None);
        assert_eq!(policy.mode(), OptimizationMode::Economy);

        assert_eq!(
            policy.evaluate(&snap(40.0, 40.0, 25.0, true)),
            Some(OptimizationMode::Normal)
        );
    }

    #[test]
    fn steady_normal_reports_no_change() {
        let mut policy = ModePolicy::default();
        assert_eq!(policy.evaluate(&snap(20.0, 20.0, 30.0, true)), None);
        assert_eq!(policy.mode(), OptimizationMode::Normal);
    }

    #[test]
    fn cpu_cost_is_share_of_frame_budget() {
        let stats = OutboundVideoStats {
            frames_encoded: 100,
            total_encode_time: Duration::from_secs(3),
            frames_per_second: Some(30.0),
        };
        let cpu = cpu_percent_from(&stats).unwrap();
        assert!((cpu - 90.0).abs() < 1e-6);
        assert_eq!(cpu_percent_from(&OutboundVideoStats::default()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_high_cpu_moves_every_sender_to_ultra_economy() {
        let (controller, connector, registry, _media) = controller().await;
        registry.open("a").await.unwrap();
        registry.open("b").await.unwrap();
        for link in connector.links() {
            link.set_stats(TransportStats {
                outbound_video: Some(OutboundVideoStats {
                    frames_encoded: 100,
                    total_encode_time: Duration::from_secs(3),
                    frames_per_second: Some(30.0),
                }),
                ..Default::default()
            });
        }

        for _ in 0..3 {
            controller.activity().record_input();
            controller.run_pass().await;
        }

        assert_eq!(controller.mode().await, OptimizationMode::UltraEconomy);
        for link in connector.links() {
            let encoding = link.encoding().unwrap();
            assert_eq!(encoding.max_bitrate, 500_000);
            assert_eq!(encoding.scale_resolution_down_by, 4.0);
            assert_eq!(encoding.max_framerate, 15.0);
        }
        let metrics = controller.metrics().await;
        assert!(metrics.user_active);
        assert!((metrics.memory_percent - 40.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_ultra_economy_pauses_video_until_input() {
        let (controller, _connector, _registry, media) = controller().await;
        let camera = media.video_track().await.unwrap();
        let audio = media.audio_track().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        controller.apply(snap(80.0, 10.0, 30.0, false)).await;
        assert_eq!(controller.mode().await, OptimizationMode::UltraEconomy);
        assert!(!camera.is_enabled());
        assert!(audio.is_enabled());

        controller.activity().record_input();
        controller.apply(snap(80.0, 10.0, 30.0, true)).await;
        assert_eq!(controller.mode().await, OptimizationMode::Economy);
        assert!(camera.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_goes_stale_after_timeout() {
        let activity = ActivityTracker::new(Duration::from_secs(10));
        assert!(activity.is_active());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!activity.is_active());

        let waiter = {
            let activity = activity.clone();
            tokio::spawn(async move { activity.resumed().await })
        };
        settle().await;
        activity.record_input();
        tokio_test::assert_ok!(waiter.await);
        assert!(activity.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_loop_applies_mode() {
        let (controller, connector, registry, _media) = controller().await;
        registry.open("a").await.unwrap();
        connector.links()[0].set_stats(TransportStats {
            outbound_video: Some(OutboundVideoStats {
                frames_encoded: 10,
                total_encode_time: Duration::from_millis(250),
                frames_per_second: Some(30.0),
            }),
            ..Default::default()
        });

        let task = controller.start_monitoring();
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        task.abort();

        assert_eq!(controller.mode().await, OptimizationMode::Economy);
        assert_eq!(connector.links()[0].encoding().unwrap().max_bitrate, 1_000_000);
    }
}
