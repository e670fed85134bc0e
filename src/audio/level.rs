//! Per-source audio level meter
//!
//! Each monitor runs on its own task, drains the source's audio at a fixed
//! cadence and publishes the RMS of what arrived as a 0-100 level. Only the
//! latest value is kept.

use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::media::{AudioChunk, CaptureSource};

/// Shortest sampling interval accepted
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between level updates
    pub sample_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(100),
        }
    }
}

impl MonitorConfig {
    /// Set the sampling interval, at least [`MIN_SAMPLE_INTERVAL`]
    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval.max(MIN_SAMPLE_INTERVAL);
        self
    }
}

/// RMS of `samples` scaled to 0-100 (0 for no samples)
pub fn rms_level(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum / samples.len() as f64).sqrt();
    let level = (rms / i16::MAX as f64 * 100.0).round();
    level.clamp(0.0, 100.0) as u8
}

/// Live audio level of one capture source
pub struct AudioLevelMonitor {
    source_id: String,
    level: watch::Receiver<u8>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AudioLevelMonitor {
    /// Start metering `source`
    pub fn start(source: &CaptureSource, config: MonitorConfig) -> Self {
        let (level_tx, level_rx) = watch::channel(0);
        let (stop_tx, stop_rx) = oneshot::channel();
        let rx = source.subscribe_audio();
        let task = tokio::spawn(sample_loop(source.clone(), rx, level_tx, config, stop_rx));

        tracing::debug!(source = source.id(), kind = %source.kind(), "Audio monitor started");

        Self {
            source_id: source.id().to_string(),
            level: level_rx,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Latest level, 0-100
    pub fn level(&self) -> u8 {
        *self.level.borrow()
    }

    /// Follow level updates
    pub fn watch(&self) -> watch::Receiver<u8> {
        self.level.clone()
    }

    /// Whether the monitor is still sampling
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop sampling; the level drops to 0. Later calls do nothing.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AudioLevelMonitor {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn sample_loop(
    source: CaptureSource,
    mut rx: broadcast::Receiver<AudioChunk>,
    level: watch::Sender<u8>,
    config: MonitorConfig,
    mut stop: oneshot::Receiver<()>,
) {
    // The field may have been set without the builder
    let mut ticker = tokio::time::interval(config.sample_interval.max(MIN_SAMPLE_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    let mut window: Vec<i16> = Vec::new();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = source.ended() => break,
            _ = ticker.tick() => {
                loop {
                    match rx.try_recv() {
                        Ok(chunk) => window.extend_from_slice(&chunk.samples),
                        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                level.send_replace(rms_level(&window));
                window.clear();
            }
        }
    }

    level.send_replace(0);
    tracing::debug!(source = source.id(), "Audio monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{capture_channel, SourceKind};

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0);
        assert_eq!(rms_level(&[0, 0, 0]), 0);
        assert_eq!(rms_level(&[i16::MAX, i16::MAX]), 100);
        assert_eq!(rms_level(&[i16::MIN]), 100);
        // Half-scale square wave
        let half = i16::MAX / 2;
        assert_eq!(rms_level(&[half, -half, half, -half]), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_follows_source() {
        let (feed, source) = capture_channel(SourceKind::Camera);
        let monitor = AudioLevelMonitor::start(&source, MonitorConfig::default());
        let mut level = monitor.watch();
        tokio::task::yield_now().await;

        feed.push_audio(AudioChunk::new(0, vec![i16::MAX / 2; 441]));
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(monitor.level(), 50);

        // Nothing arrives during the next interval
        tokio::time::sleep(Duration::from_millis(100)).await;
        level.wait_for(|l| *l == 0).await.unwrap();
        assert!(monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_source_ends() {
        let (feed, source) = capture_channel(SourceKind::Screen);
        let monitor = AudioLevelMonitor::start(&source, MonitorConfig::default());

        drop(feed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!monitor.is_running());
        assert_eq!(monitor.level(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_monitors_and_stop() {
        let (loud_feed, loud) = capture_channel(SourceKind::Camera);
        let (_quiet_feed, quiet) = capture_channel(SourceKind::Screen);
        let mut a = AudioLevelMonitor::start(&loud, MonitorConfig::default());
        let b = AudioLevelMonitor::start(&quiet, MonitorConfig::default());
        tokio::task::yield_now().await;

        loud_feed.push_audio(AudioChunk::new(0, vec![i16::MAX; 100]));
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(a.level(), 100);
        assert_eq!(b.level(), 0);

        a.stop().await;
        assert!(!a.is_running());
        assert!(b.is_running());

        // Stopping again during teardown is harmless
        a.stop().await;
        assert!(!a.is_running());
        assert_eq!(a.level(), 0);
    }

    #[test]
    fn test_sample_interval_is_clamped() {
        let config = MonitorConfig::default().sample_interval(Duration::ZERO);
        assert_eq!(config.sample_interval, MIN_SAMPLE_INTERVAL);

        let config = MonitorConfig::default().sample_interval(Duration::from_millis(250));
        assert_eq!(config.sample_interval, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_samples() {
        let (feed, source) = capture_channel(SourceKind::Camera);
        let config = MonitorConfig {
            sample_interval: Duration::ZERO,
        };
        let monitor = AudioLevelMonitor::start(&source, config);
        let mut level = monitor.watch();
        tokio::task::yield_now().await;

        feed.push_audio(AudioChunk::new(0, vec![i16::MAX; 64]));
        level.wait_for(|l| *l == 100).await.unwrap();
        assert!(monitor.is_running());
    }
}
