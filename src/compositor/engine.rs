//! Compositor tick loop
//!
//! A single task ticks at the output frame rate. Each tick re-reads the
//! configuration, composes the active sources into the canvas, draws the
//! overlays and sends the result on the output stream's video track. Audio
//! received from the active sources since the previous tick is mixed and
//! sent on the audio track. Sends never block, so a stalled consumer cannot
//! slow the loop down.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::media::{
    AudioChunk, CaptureSource, MediaFrame, MediaStream, MediaTrack, Resolution, SourceKind,
};
use crate::stats::CompositorStats;

use super::canvas::{Canvas, PLACEHOLDER_RGBA};
use super::config::CompositorConfig;
use super::layout::{plan, ActiveSources, Layout};

/// Mixes capture sources into one continuously running output stream
pub struct StreamCompositor {
    config: watch::Sender<CompositorConfig>,
    output: MediaStream,
    resolution: Resolution,
    frame_rate: u32,
    stats: Arc<Mutex<CompositorStats>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StreamCompositor {
    /// Create the output stream and start ticking
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: CompositorConfig) -> Self {
        let resolution = config.output_resolution;
        let frame_rate = config.output_frame_rate.max(1);
        let output = MediaStream::new(vec![MediaTrack::video(), MediaTrack::audio()]);
        let stats = Arc::new(Mutex::new(CompositorStats::new()));

        let (config_tx, config_rx) = watch::channel(config);
        let (stop_tx, stop_rx) = oneshot::channel();

        let ticker = TickLoop {
            config: config_rx,
            canvas: Canvas::new(resolution),
            video: output.video_track().cloned().unwrap_or_else(MediaTrack::video),
            audio: output.audio_track().cloned().unwrap_or_else(MediaTrack::audio),
            camera_audio: None,
            screen_audio: None,
            stats: Arc::clone(&stats),
            started: Instant::now(),
        };
        let period = Duration::from_secs_f64(1.0 / frame_rate as f64);
        let task = tokio::spawn(ticker.run(period, stop_rx));

        tracing::info!(
            stream = output.id(),
            resolution = %resolution,
            fps = frame_rate,
            "Compositor started"
        );

        Self {
            config: config_tx,
            output,
            resolution,
            frame_rate,
            stats,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// The composite stream; the same handle for the compositor's lifetime
    pub fn output(&self) -> MediaStream {
        self.output.clone()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Current configuration
    pub fn config(&self) -> CompositorConfig {
        self.config.borrow().clone()
    }

    pub fn active_sources(&self) -> ActiveSources {
        self.config.borrow().active_sources()
    }

    pub fn set_camera(&self, source: Option<CaptureSource>) {
        tracing::debug!(enabled = source.is_some(), "Camera source changed");
        self.config.send_modify(|c| c.camera = source);
    }

    pub fn set_screen(&self, source: Option<CaptureSource>) {
        tracing::debug!(enabled = source.is_some(), "Screen source changed");
        self.config.send_modify(|c| c.screen = source);
    }

    pub fn set_layout(&self, layout: Layout) {
        tracing::debug!(layout = %layout, "Layout changed");
        self.config.send_modify(|c| c.layout = layout);
    }

    pub fn set_overlay_text(&self, text: Option<String>) {
        self.config.send_modify(|c| c.overlay_text = text);
    }

    pub fn set_watermark(&self, enabled: bool) {
        self.config.send_modify(|c| c.watermark_enabled = enabled);
    }

    pub fn stats(&self) -> CompositorStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop ticking and release the canvas
    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            tracing::info!(stream = self.output.id(), "Compositor stopped");
        }
    }
}

impl Drop for StreamCompositor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Audio subscription to one source, tied to its identity
struct AudioTap {
    source_id: Arc<str>,
    rx: broadcast::Receiver<AudioChunk>,
}

impl AudioTap {
    /// Keep the tap pointed at `source`, resubscribing when it changes
    fn sync(tap: &mut Option<AudioTap>, source: Option<&CaptureSource>) {
        match source {
            Some(source) => {
                let current = tap.as_ref().map(|t| &*t.source_id == source.id()).unwrap_or(false);
                if !current {
                    *tap = Some(AudioTap {
                        source_id: source.id().into(),
                        rx: source.subscribe_audio(),
                    });
                }
            }
            None => *tap = None,
        }
    }

    /// Samples received since the last drain
    fn drain(&mut self) -> Vec<i16> {
        let mut samples = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => samples.extend_from_slice(&chunk.samples),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        samples
    }
}

struct TickLoop {
    config: watch::Receiver<CompositorConfig>,
    canvas: Canvas,
    video: MediaTrack,
    audio: MediaTrack,
    camera_audio: Option<AudioTap>,
    screen_audio: Option<AudioTap>,
    stats: Arc<Mutex<CompositorStats>>,
    started: Instant,
}

impl TickLoop {
    async fn run(mut self, period: Duration, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    fn tick(&mut self) {
        let config = self.config.borrow_and_update().clone();
        let active = config.active_sources();
        let timestamp_ms = self.started.elapsed().as_millis() as u64;

        self.compose(&config, &active);
        let frame = self.canvas.snapshot(timestamp_ms);
        self.video.send(MediaFrame::Video(frame));

        let mixed = self.mix_audio(&active);
        let audio_sent = !mixed.is_empty();
        if audio_sent {
            self.audio
                .send(MediaFrame::Audio(AudioChunk::new(timestamp_ms, mixed)));
        }

        let mut stats = self.stats.lock();
        stats.frames_emitted += 1;
        if audio_sent {
            stats.audio_chunks_emitted += 1;
        }
        if stats.last_layout != Some(config.layout) {
            tracing::debug!(layout = %config.layout, "Composing with new layout");
        }
        stats.last_layout = Some(config.layout);
    }

    fn compose(&mut self, config: &CompositorConfig, active: &ActiveSources) {
        let resolution = self.canvas.resolution();
        self.canvas.clear(PLACEHOLDER_RGBA);

        for placement in plan(config.layout, resolution) {
            match active.get(placement.source).and_then(|s| s.latest_frame()) {
                Some(frame) => self.canvas.blit_fit(&frame, placement.rect),
                None => self.canvas.fill_rect(placement.rect, PLACEHOLDER_RGBA),
            }
        }

        if let Some(text) = config.overlay_text.as_deref().filter(|t| !t.is_empty()) {
            self.canvas.draw_label(text);
        }
        if config.watermark_enabled {
            self.canvas.draw_watermark();
        }
    }

    /// Saturating sum of everything the active sources produced since the
    /// previous tick
    fn mix_audio(&mut self, active: &ActiveSources) -> Vec<i16> {
        AudioTap::sync(&mut self.camera_audio, active.get(SourceKind::Camera));
        AudioTap::sync(&mut self.screen_audio, active.get(SourceKind::Screen));

        let camera = self.camera_audio.as_mut().map(AudioTap::drain).unwrap_or_default();
        let screen = self.screen_audio.as_mut().map(AudioTap::drain).unwrap_or_default();
        mix(&camera, &screen)
    }
}

/// Sample-wise saturating addition; the shorter input is padded with silence
pub fn mix(a: &[i16], b: &[i16]) -> Vec<i16> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            x.saturating_add(y)
        })
        .collect()
}
