//! Local capture sources
//!
//! A capture is split in two halves. The capturing component owns the
//! [`CaptureFeed`] and pushes frames into it. Everybody else (compositor,
//! level meters) holds a read-only [`CaptureSource`]. Video is exposed as
//! "latest frame wins" via `tokio::sync::watch`; audio is a broadcast so each
//! reader sees every chunk.

use std::collections::HashSet;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::frame::{AudioChunk, Resolution, VideoFrame, AUDIO_SAMPLE_RATE};

const AUDIO_CAPACITY: usize = 64;

/// What a capture source is pointed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Camera,
    Screen,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Camera => write!(f, "camera"),
            SourceKind::Screen => write!(f, "screen"),
        }
    }
}

/// Read-only handle to a live capture
#[derive(Clone)]
pub struct CaptureSource {
    id: Arc<str>,
    kind: SourceKind,
    video: watch::Receiver<Option<VideoFrame>>,
    audio: broadcast::Sender<AudioChunk>,
    live: watch::Receiver<bool>,
}

impl CaptureSource {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Most recent video frame, if the capture has produced one
    pub fn latest_frame(&self) -> Option<VideoFrame> {
        self.video.borrow().clone()
    }

    /// Subscribe to audio chunks captured after this call
    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioChunk> {
        self.audio.subscribe()
    }

    /// Whether the capture is still running
    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Resolve once the capture has ended
    pub async fn ended(&self) {
        let mut live = self.live.clone();
        // An Err means the feed was dropped, which also ends the capture
        let _ = live.wait_for(|running| !running).await;
    }
}

impl std::fmt::Debug for CaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Write half of a capture, owned by the capturing component
pub struct CaptureFeed {
    video: watch::Sender<Option<VideoFrame>>,
    audio: broadcast::Sender<AudioChunk>,
    live: watch::Sender<bool>,
}

impl CaptureFeed {
    /// Replace the latest video frame
    pub fn push_video(&self, frame: VideoFrame) {
        self.video.send_replace(Some(frame));
    }

    /// Publish an audio chunk to all current listeners
    pub fn push_audio(&self, chunk: AudioChunk) {
        let _ = self.audio.send(chunk);
    }

    /// Mark the capture as ended
    pub fn end(&self) {
        self.live.send_replace(false);
    }
}

impl Drop for CaptureFeed {
    fn drop(&mut self) {
        self.end();
    }
}

/// Create a connected feed/source pair
pub fn capture_channel(kind: SourceKind) -> (CaptureFeed, CaptureSource) {
    let (video_tx, video_rx) = watch::channel(None);
    let (audio_tx, _) = broadcast::channel(AUDIO_CAPACITY);
    let (live_tx, live_rx) = watch::channel(true);

    let source = CaptureSource {
        id: Uuid::new_v4().to_string().into(),
        kind,
        video: video_rx,
        audio: audio_tx.clone(),
        live: live_rx,
    };
    let feed = CaptureFeed {
        video: video_tx,
        audio: audio_tx,
        live: live_tx,
    };
    (feed, source)
}

/// An opened capture device
///
/// Dropping the handle or calling [`CaptureHandle::stop`] ends the capture.
pub struct CaptureHandle {
    source: CaptureSource,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn new(source: CaptureSource, task: Option<JoinHandle<()>>) -> Self {
        Self { source, task }
    }

    /// Read-only handle to hand to consumers
    pub fn source(&self) -> &CaptureSource {
        &self.source
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(source = %self.source.id(), kind = %self.source.kind(), "Capture stopped");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Platform capture facility
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open a capture of the given kind
    ///
    /// Returns [`Error::DeviceAccessDenied`] when permission is refused.
    async fn open(&self, kind: SourceKind) -> Result<CaptureHandle>;
}

/// Capture backend that generates a test pattern and a sine tone
pub struct SyntheticCapture {
    resolution: Resolution,
    frame_rate: u32,
    tone_amplitude: i16,
    denied: Mutex<HashSet<SourceKind>>,
}

impl SyntheticCapture {
    pub fn new(resolution: Resolution, frame_rate: u32) -> Self {
        Self {
            resolution,
            frame_rate: frame_rate.max(1),
            tone_amplitude: i16::MAX / 4,
            denied: Mutex::new(HashSet::new()),
        }
    }

    /// Set the peak amplitude of the generated tone (0 = silence)
    pub fn tone_amplitude(mut self, amplitude: i16) -> Self {
        self.tone_amplitude = amplitude;
        self
    }

    /// Refuse permission for a source kind
    pub fn deny(&self, kind: SourceKind) {
        self.denied.lock().insert(kind);
    }

    /// Grant permission for a source kind again
    pub fn allow(&self, kind: SourceKind) {
        self.denied.lock().remove(&kind);
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open(&self, kind: SourceKind) -> Result<CaptureHandle> {
        if self.denied.lock().contains(&kind) {
            tracing::warn!(kind = %kind, "Capture permission denied");
            return Err(Error::DeviceAccessDenied(kind.to_string()));
        }

        let (feed, source) = capture_channel(kind);
        let pattern = TestPattern {
            kind,
            resolution: self.resolution,
            frame_rate: self.frame_rate,
            amplitude: self.tone_amplitude,
        };
        let task = tokio::spawn(pattern.run(feed));

        tracing::info!(source = %source.id(), kind = %kind, resolution = %self.resolution, "Capture opened");
        Ok(CaptureHandle::new(source, Some(task)))
    }
}

struct TestPattern {
    kind: SourceKind,
    resolution: Resolution,
    frame_rate: u32,
    amplitude: i16,
}

impl TestPattern {
    async fn run(self, feed: CaptureFeed) {
        let period = Duration::from_secs_f64(1.0 / self.frame_rate as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = Instant::now();
        let samples_per_tick = (AUDIO_SAMPLE_RATE / self.frame_rate).max(1) as usize;
        let mut sample_index: u64 = 0;
        let mut frame_index: u64 = 0;

        loop {
            ticker.tick().await;
            let ts = started.elapsed().as_millis() as u64;

            feed.push_video(self.frame(frame_index, ts));
            feed.push_audio(self.tone(ts, sample_index, samples_per_tick));

            frame_index += 1;
            sample_index += samples_per_tick as u64;
        }
    }

    fn base_colour(&self) -> [u8; 3] {
        match self.kind {
            SourceKind::Camera => [0x2E, 0x8B, 0x57],
            SourceKind::Screen => [0x1E, 0x3A, 0x8A],
        }
    }

    /// Solid colour with a vertical white bar sweeping left to right
    fn frame(&self, index: u64, timestamp_ms: u64) -> VideoFrame {
        let width = self.resolution.width.max(1) as usize;
        let height = self.resolution.height as usize;
        let bar = (index as usize * 4) % width;
        let bar_width = (width / 16).max(1);
        let [r, g, b] = self.base_colour();

        let mut data = Vec::with_capacity(self.resolution.buffer_len());
        for _ in 0..height {
            for x in 0..width {
                if x >= bar && x < bar + bar_width {
                    data.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
                } else {
                    data.extend_from_slice(&[r, g, b, 0xFF]);
                }
            }
        }

        VideoFrame::new(
            self.resolution.width,
            self.resolution.height,
            timestamp_ms,
            Bytes::from(data),
        )
    }

    /// 440 Hz sine
    fn tone(&self, timestamp_ms: u64, start: u64, len: usize) -> AudioChunk {
        let amplitude = self.amplitude as f32;
        let samples = (0..len as u64)
            .map(|i| {
                let t = (start + i) as f32 / AUDIO_SAMPLE_RATE as f32;
                (amplitude * (2.0 * PI * 440.0 * t).sin()) as i16
            })
            .collect();
        AudioChunk::new(timestamp_ms, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_and_source() {
        let (feed, source) = capture_channel(SourceKind::Camera);
        assert!(source.is_live());
        assert!(source.latest_frame().is_none());

        feed.push_video(VideoFrame::solid(Resolution::new(2, 2), [9, 9, 9, 255], 5));
        assert_eq!(source.latest_frame().unwrap().timestamp_ms, 5);

        drop(feed);
        assert!(!source.is_live());
    }

    #[tokio::test]
    async fn test_audio_reaches_subscribers() {
        let (feed, source) = capture_channel(SourceKind::Screen);
        let mut rx = source.subscribe_audio();
        feed.push_audio(AudioChunk::new(0, vec![100, -100]));
        assert_eq!(rx.recv().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let backend = SyntheticCapture::new(Resolution::new(8, 8), 10);
        backend.deny(SourceKind::Camera);

        let result = backend.open(SourceKind::Camera).await;
        assert!(matches!(result, Err(Error::DeviceAccessDenied(_))));

        backend.allow(SourceKind::Camera);
        let handle = backend.open(SourceKind::Camera).await.unwrap();
        assert_eq!(handle.kind(), SourceKind::Camera);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_capture_produces_frames() {
        let backend = SyntheticCapture::new(Resolution::new(16, 8), 10);
        let mut handle = backend.open(SourceKind::Screen).await.unwrap();
        let source = handle.source().clone();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let frame = source.latest_frame().expect("frame");
        assert!(frame.is_well_formed());
        assert_eq!(frame.resolution(), Resolution::new(16, 8));

        handle.stop();
        tokio::task::yield_now().await;
        source.ended().await;
        assert!(!source.is_live());
    }
}
