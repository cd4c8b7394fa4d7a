use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::Timings;
use crate::notify::Notifier;
use crate::peer::PeerState;
use crate::registry::{PeerHandle, PeerRegistry};

/// Link health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    /// Loss and round trip are graded separately; the worse grade wins.
    pub fn classify(packet_loss_percent: f64, round_trip_ms: f64) -> Self {
        let by_loss = if packet_loss_percent <= 0.5 {
            ConnectionQuality::Excellent
        } else if packet_loss_percent <= 2.0 {
            ConnectionQuality::Good
        } else if packet_loss_percent <= 5.0 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        };

        let by_rtt = if round_trip_ms <= 100.0 {
            ConnectionQuality::Excellent
        } else if round_trip_ms <= 150.0 {
            ConnectionQuality::Good
        } else if round_trip_ms <= 300.0 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        };

        by_loss.max(by_rtt)
    }
}

/// Samples every open entry on a fixed period and classifies its link.
pub struct QualityMonitor {
    registry: Arc<PeerRegistry>,
    notifier: Notifier,
    period: Duration,
    debounce: Duration,
    last_warning: Mutex<Option<Instant>>,
}

impl QualityMonitor {
    pub fn new(registry: Arc<PeerRegistry>, notifier: Notifier, timings: &Timings) -> Arc<Self> {
        Arc::new(Self {
            registry,
            notifier,
            period: timings.quality_period,
            debounce: timings.warning_debounce,
            last_warning: Mutex::new(None),
        })
    }

    pub fn start_monitoring(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + monitor.period, monitor.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.sweep().await;
            }
        })
    }

    /// Starts one sampling pass per entry. Entries whose previous pass has
    /// not finished are skipped this round.
    pub async fn sweep(self: &Arc<Self>) {
        for handle in self.registry.handles().await {
            let Some(guard) = handle.try_begin_sampling() else {
                debug!("Quality pass for {} still running, skipping", handle.participant());
                continue;
            };
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                let _guard = guard;
                monitor.sample(handle).await;
            });
        }
    }

    async fn sample(&self, handle: PeerHandle) {
        let stats = match handle.link().stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Quality check failed for {}: {}", handle.participant(), e);
                return;
            }
        };

        let loss = stats.packet_loss_percent();
        let rtt = stats.round_trip_ms();
        let quality = ConnectionQuality::classify(loss, rtt);
        if !self.registry.record_quality(handle.tag(), quality).await {
            return;
        }

        if quality == ConnectionQuality::Poor {
            self.network_warning(loss, rtt);
        }
        if matches!(handle.state(), PeerState::Failed | PeerState::Disconnected) {
            self.notifier
                .error("Connection lost with a participant. Attempting to reconnect...");
        }
    }

    fn network_warning(&self, loss: f64, rtt: f64) {
        let now = Instant::now();
        let mut last = self.last_warning.lock();
        if let Some(at) = *last {
            if now.duration_since(at) < self.debounce {
                return;
            }
        }
        *last = Some(now);
        drop(last);

        self.notifier.warning(format!(
            "Unstable connection detected\nPacket loss: {:.1}%\nLatency: {:.0}ms",
            loss, rtt
        ));
    }
}
