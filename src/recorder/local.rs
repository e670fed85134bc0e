//! Local recording of the composite stream
//!
//! ```text
//!  Idle ──start()──► Recording ──stop()──► Stopped
//!   ▲                                          │
//!   └──────────── take_file() / discard() ─────┘
//! ```
//!
//! While recording, a capture task owns the output file and appends every
//! frame that arrives on the stream's tracks. `stop()` signals the task,
//! waits for it to drain what is already queued and only then finalizes
//! the file.

use std::path::{Path, PathBuf};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::{MediaFrame, MediaStream};

use super::config::RecorderConfig;
use super::flv::{self, FlvWriter};

/// Recorder lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

impl std::fmt::Display for RecorderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "idle"),
            RecorderState::Recording => write!(f, "recording"),
            RecorderState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of the recorder's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub state: RecorderState,
    pub duration_ms: u64,
    /// Retrievable file, only once stopped with at least one frame
    pub file: Option<PathBuf>,
}

/// Notifications emitted by the recorder
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    Started { path: PathBuf },
    Stopped { duration_ms: u64, file: Option<PathBuf> },
    Failed { reason: String },
}

struct ActiveRecording {
    path: PathBuf,
    started_at: Instant,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<FlvWriter>>,
}

/// Records a composite stream into an FLV file
pub struct LocalRecorder {
    config: RecorderConfig,
    state: RecorderState,
    active: Option<ActiveRecording>,
    duration_ms: u64,
    file: Option<PathBuf>,
    events: broadcast::Sender<RecorderEvent>,
}

impl LocalRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            state: RecorderState::Idle,
            active: None,
            duration_ms: 0,
            file: None,
            events,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Subscribe to recorder events
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    /// Elapsed time while recording, frozen once stopped
    pub fn duration_ms(&self) -> u64 {
        match &self.active {
            Some(active) => active.started_at.elapsed().as_millis() as u64,
            None => self.duration_ms,
        }
    }

    /// The finished file, if there is one to retrieve
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn artifact(&self) -> RecordingArtifact {
        RecordingArtifact {
            state: self.state,
            duration_ms: self.duration_ms(),
            file: self.file.clone(),
        }
    }

    /// Begin capturing `stream`
    ///
    /// Fails with `InvalidState` unless idle. A missing stream, a configured
    /// frame size too large for the container or an unusable output
    /// directory fails with `RecorderUnavailable`, emits one `Failed` event
    /// and leaves the recorder idle.
    pub async fn start(&mut self, stream: Option<&MediaStream>) -> Result<()> {
        if self.state != RecorderState::Idle {
            return Err(Error::InvalidState(format!(
                "recorder cannot start while {}",
                self.state
            )));
        }

        let Some(stream) = stream else {
            return Err(self.fail("no composite stream available".into()));
        };
        let Some(video) = stream.video_track() else {
            return Err(self.fail(format!("stream {} has no video track", stream.id())));
        };
        if let Some(size) = self.config.frame_size {
            if !flv::video_fits(size) {
                return Err(self.fail(format!("{} frames are too large to record", size)));
            }
        }

        // Subscribe before anything is awaited so no frame is missed
        let video_rx = video.subscribe();
        let audio_rx = stream.audio_track().map(|track| track.subscribe());

        let started_at = Instant::now();
        let path = self.config.output_dir.join(format!(
            "{}-{}.flv",
            self.config.file_prefix,
            Uuid::new_v4()
        ));
        let writer = match FlvWriter::create(&path).await {
            Ok(writer) => writer,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(self.fail(format!("{}: {}", path.display(), e)));
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(capture(writer, Some(video_rx), audio_rx, stop_rx));

        tracing::info!(path = %path.display(), stream = stream.id(), "Recording started");

        self.active = Some(ActiveRecording {
            path: path.clone(),
            started_at,
            stop: stop_tx,
            task,
        });
        self.state = RecorderState::Recording;
        self.duration_ms = 0;
        self.file = None;
        let _ = self.events.send(RecorderEvent::Started { path });
        Ok(())
    }

    /// Finish the recording
    ///
    /// Waits for the capture task to flush, then freezes the duration. With
    /// no frames captured the file is removed and nothing is retrievable.
    pub async fn stop(&mut self) -> Result<RecordingArtifact> {
        let Some(active) = self.active.take() else {
            return Err(Error::InvalidState(format!(
                "recorder cannot stop while {}",
                self.state
            )));
        };

        let elapsed_ms = active.started_at.elapsed().as_millis() as u64;
        let _ = active.stop.send(());
        self.state = RecorderState::Stopped;

        let writer = match active.task.await {
            Ok(Ok(writer)) => writer,
            Ok(Err(e)) => return Err(self.fail_stopped(&active.path, e.to_string()).await),
            Err(e) => return Err(self.fail_stopped(&active.path, e.to_string()).await),
        };

        if writer.video_frames() == 0 {
            drop(writer);
            if let Err(e) = tokio::fs::remove_file(&active.path).await {
                tracing::warn!(path = %active.path.display(), error = %e, "Failed to remove empty recording");
            }
            self.duration_ms = 0;
            self.file = None;
        } else {
            let duration_ms = elapsed_ms.max(writer.last_timestamp_ms()).max(1);
            let summary = match writer.finish(duration_ms).await {
                Ok(summary) => summary,
                Err(e) => return Err(self.fail_stopped(&active.path, e.to_string()).await),
            };
            self.duration_ms = duration_ms;
            self.file = Some(active.path.clone());

            tracing::debug!(
                video_frames = summary.video_frames,
                audio_chunks = summary.audio_chunks,
                bytes = summary.bytes_written,
                "Recording finalized"
            );
        }

        tracing::info!(
            path = %active.path.display(),
            duration_ms = self.duration_ms,
            kept = self.file.is_some(),
            "Recording stopped"
        );

        let _ = self.events.send(RecorderEvent::Stopped {
            duration_ms: self.duration_ms,
            file: self.file.clone(),
        });
        Ok(self.artifact())
    }

    /// Hand the finished file over to the caller and return to idle
    ///
    /// The recorder no longer owns the file afterwards.
    pub fn take_file(&mut self) -> Option<PathBuf> {
        if self.state != RecorderState::Stopped {
            return None;
        }
        self.state = RecorderState::Idle;
        self.duration_ms = 0;
        self.file.take()
    }

    /// Drop any recording in progress or not yet retrieved and return to idle
    pub async fn discard(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            let _ = active.task.await;
            let _ = tokio::fs::remove_file(&active.path).await;
        }
        if let Some(path) = self.file.take() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove recording");
            }
        }
        self.state = RecorderState::Idle;
        self.duration_ms = 0;
    }

    fn fail(&self, reason: String) -> Error {
        tracing::warn!(reason = %reason, "Recorder unavailable");
        let _ = self.events.send(RecorderEvent::Failed {
            reason: reason.clone(),
        });
        Error::RecorderUnavailable(reason)
    }

    async fn fail_stopped(&mut self, path: &Path, reason: String) -> Error {
        let _ = tokio::fs::remove_file(path).await;
        self.duration_ms = 0;
        self.file = None;
        self.fail(reason)
    }
}

impl Drop for LocalRecorder {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.task.abort();
        }
    }
}

async fn recv_from(
    rx: &mut Option<broadcast::Receiver<MediaFrame>>,
) -> std::result::Result<MediaFrame, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn capture(
    mut writer: FlvWriter,
    mut video: Option<broadcast::Receiver<MediaFrame>>,
    mut audio: Option<broadcast::Receiver<MediaFrame>>,
    mut stop: oneshot::Receiver<()>,
) -> Result<FlvWriter> {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = recv_from(&mut video) => match frame {
                Ok(frame) => write_frame(&mut writer, frame).await?,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Recorder lagged behind video");
                }
                Err(RecvError::Closed) => video = None,
            },
            chunk = recv_from(&mut audio) => match chunk {
                Ok(frame) => write_frame(&mut writer, frame).await?,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Recorder lagged behind audio");
                }
                Err(RecvError::Closed) => audio = None,
            },
        }
    }

    // Whatever was queued before the stop signal still belongs to the file
    for rx in [video.as_mut(), audio.as_mut()].into_iter().flatten() {
        loop {
            match rx.try_recv() {
                Ok(frame) => write_frame(&mut writer, frame).await?,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    Ok(writer)
}

async fn write_frame(writer: &mut FlvWriter, frame: MediaFrame) -> Result<()> {
    match frame {
        MediaFrame::Video(frame) => writer.write_video(&frame).await,
        MediaFrame::Audio(chunk) => writer.write_audio(&chunk).await,
    }
}
