//! Broadcaster-side orchestration
//!
//! ```text
//!  CaptureBackend ──► CaptureHandle ──► StreamCompositor ──► PeerConnectionManager
//!                          │                   │
//!                          ▼                   └──────────► LocalRecorder
//!                   AudioLevelMonitor
//! ```
//!
//! A [`BroadcastStudio`] owns one broadcaster's pipeline. The compositor runs
//! from construction to shutdown; going live only adds the peer manager on
//! top of its output, so sources can be arranged before anyone is watching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::{AudioLevelMonitor, MonitorConfig};
use crate::compositor::{CompositorConfig, StreamCompositor};
use crate::error::{Error, Result};
use crate::media::{CaptureBackend, CaptureHandle, SourceKind};
use crate::peer::{ManagerConfig, PeerConnectionManager, PeerConnector};
use crate::recorder::{LocalRecorder, RecorderConfig, RecorderState, RecordingArtifact};
use crate::signaling::SignalingChannel;

use super::registry::{SessionRegistry, StreamSession};

/// Shortest interval between viewer count updates
pub const MIN_VIEWER_COUNT_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a broadcaster's studio
#[derive(Debug, Clone)]
pub struct StudioConfig {
    /// Identity used as `fromId` on broadcaster envelopes
    pub broadcaster_id: String,

    pub compositor: CompositorConfig,
    pub manager: ManagerConfig,
    pub recorder: RecorderConfig,
    pub monitor: MonitorConfig,

    /// How often the connected-viewer count is pushed to the registry
    pub viewer_count_interval: Duration,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            broadcaster_id: "broadcaster".into(),
            compositor: CompositorConfig::default(),
            manager: ManagerConfig::default(),
            recorder: RecorderConfig::default(),
            monitor: MonitorConfig::default(),
            viewer_count_interval: Duration::from_secs(1),
        }
    }
}

impl StudioConfig {
    pub fn new(broadcaster_id: impl Into<String>) -> Self {
        Self {
            broadcaster_id: broadcaster_id.into(),
            ..Default::default()
        }
    }

    pub fn compositor(mut self, config: CompositorConfig) -> Self {
        self.compositor = config;
        self
    }

    pub fn manager(mut self, config: ManagerConfig) -> Self {
        self.manager = config;
        self
    }

    pub fn recorder(mut self, config: RecorderConfig) -> Self {
        self.recorder = config;
        self
    }

    pub fn monitor(mut self, config: MonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    /// Set the viewer count push interval, at least [`MIN_VIEWER_COUNT_INTERVAL`]
    pub fn viewer_count_interval(mut self, interval: Duration) -> Self {
        self.viewer_count_interval = interval.max(MIN_VIEWER_COUNT_INTERVAL);
        self
    }
}

/// An opened capture and its level meter
struct ActiveSource {
    handle: CaptureHandle,
    monitor: AudioLevelMonitor,
}

/// State that only exists while live
struct LiveBroadcast {
    session: StreamSession,
    manager: Arc<PeerConnectionManager>,
    viewer_count: JoinHandle<()>,
}

/// One broadcaster's capture, compositing, broadcast and recording pipeline
pub struct BroadcastStudio {
    config: StudioConfig,
    channel: SignalingChannel,
    connector: Arc<dyn PeerConnector>,
    registry: Arc<dyn SessionRegistry>,
    compositor: StreamCompositor,
    recorder: LocalRecorder,
    sources: HashMap<SourceKind, ActiveSource>,
    live: Option<LiveBroadcast>,
}

impl BroadcastStudio {
    /// Build the studio and start compositing
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: StudioConfig,
        channel: SignalingChannel,
        connector: Arc<dyn PeerConnector>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Self {
        let compositor = StreamCompositor::new(config.compositor.clone());
        let recorder = LocalRecorder::new(
            config
                .recorder
                .clone()
                .frame_size(compositor.resolution()),
        );

        Self {
            config,
            channel,
            connector,
            registry,
            compositor,
            recorder,
            sources: HashMap::new(),
            live: None,
        }
    }

    pub fn broadcaster_id(&self) -> &str {
        &self.config.broadcaster_id
    }

    /// The running compositor, for layout and overlay changes
    pub fn compositor(&self) -> &StreamCompositor {
        &self.compositor
    }

    pub fn recorder(&self) -> &LocalRecorder {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut LocalRecorder {
        &mut self.recorder
    }

    /// The live session, if broadcasting
    pub fn session(&self) -> Option<&StreamSession> {
        self.live.as_ref().map(|l| &l.session)
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// The peer manager of the live session
    pub fn manager(&self) -> Option<&PeerConnectionManager> {
        self.live.as_ref().map(|l| l.manager.as_ref())
    }

    /// Open a capture and feed it into the compositor
    ///
    /// A refused permission is returned as `DeviceAccessDenied` and is not
    /// retried; enabling again asks the backend again. Enabling a kind that
    /// is already open replaces the old capture.
    pub async fn enable_source(
        &mut self,
        backend: &dyn CaptureBackend,
        kind: SourceKind,
    ) -> Result<()> {
        let handle = backend.open(kind).await?;
        let source = handle.source().clone();
        let monitor = AudioLevelMonitor::start(&source, self.config.monitor.clone());

        match kind {
            SourceKind::Camera => self.compositor.set_camera(Some(source)),
            SourceKind::Screen => self.compositor.set_screen(Some(source)),
        }

        if let Some(mut previous) = self.sources.insert(kind, ActiveSource { handle, monitor }) {
            previous.monitor.stop().await;
            previous.handle.stop();
        }

        tracing::info!(
            broadcaster = %self.config.broadcaster_id,
            kind = %kind,
            "Source enabled"
        );
        Ok(())
    }

    /// Release a capture; the compositor keeps emitting without it
    pub async fn disable_source(&mut self, kind: SourceKind) -> bool {
        let Some(mut active) = self.sources.remove(&kind) else {
            return false;
        };

        match kind {
            SourceKind::Camera => self.compositor.set_camera(None),
            SourceKind::Screen => self.compositor.set_screen(None),
        }
        active.monitor.stop().await;
        active.handle.stop();

        tracing::info!(
            broadcaster = %self.config.broadcaster_id,
            kind = %kind,
            "Source disabled"
        );
        true
    }

    pub fn is_source_enabled(&self, kind: SourceKind) -> bool {
        self.sources.contains_key(&kind)
    }

    /// Current level of a source's audio, 0-100
    pub fn audio_level(&self, kind: SourceKind) -> Option<u8> {
        self.sources.get(&kind).map(|s| s.monitor.level())
    }

    /// Create a live session and start accepting viewers
    pub async fn go_live(&mut self, title: &str, category: &str) -> Result<StreamSession> {
        if let Some(live) = &self.live {
            return Err(Error::SessionAlreadyLive(format!(
                "{} ({})",
                self.config.broadcaster_id, live.session.id
            )));
        }

        let session = self
            .registry
            .create_live_session(&self.config.broadcaster_id, title, category)
            .await?;

        let manager = match PeerConnectionManager::start(
            &session.id,
            &self.config.broadcaster_id,
            self.channel.clone(),
            Arc::clone(&self.connector),
            self.compositor.output(),
            self.config.manager.clone(),
        )
        .await
        {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                // Do not leave a live record behind with nobody serving it
                if let Err(end_err) = self.registry.end_session(&session.id).await {
                    tracing::warn!(session = %session.id, error = %end_err, "Failed to end session");
                }
                return Err(e);
            }
        };

        let viewer_count = tokio::spawn(push_viewer_count(
            Arc::clone(&manager),
            Arc::clone(&self.registry),
            session.id.clone(),
            self.config.viewer_count_interval,
        ));

        tracing::info!(
            session = %session.id,
            broadcaster = %self.config.broadcaster_id,
            title = title,
            "Went live"
        );

        self.live = Some(LiveBroadcast {
            session: session.clone(),
            manager,
            viewer_count,
        });
        Ok(session)
    }

    /// Push the current connected-viewer count to the registry now
    pub async fn sync_viewer_count(&self) -> Result<u32> {
        let live = self
            .live
            .as_ref()
            .ok_or_else(|| Error::InvalidState("not live".into()))?;
        let count = live.manager.viewer_count().await as u32;
        self.registry
            .set_viewer_count(&live.session.id, count)
            .await?;
        Ok(count)
    }

    /// End the live session for every viewer and in the registry
    ///
    /// A recording in progress is stopped so its file stays retrievable.
    pub async fn end_broadcast(&mut self) -> Result<StreamSession> {
        let live = self
            .live
            .take()
            .ok_or_else(|| Error::InvalidState("not live".into()))?;
        live.viewer_count.abort();

        if self.recorder.state() == RecorderState::Recording {
            if let Err(e) = self.recorder.stop().await {
                tracing::warn!(session = %live.session.id, error = %e, "Recording failed at end of broadcast");
            }
        }

        let ended = live.manager.end_session().await;
        let session = self.registry.end_session(&live.session.id).await?;
        ended?;

        tracing::info!(session = %session.id, "Broadcast ended");
        Ok(session)
    }

    /// Start recording the composite stream
    pub async fn start_recording(&mut self) -> Result<()> {
        let output = self.compositor.output();
        self.recorder.start(Some(&output)).await
    }

    /// Stop recording and return what was captured
    pub async fn stop_recording(&mut self) -> Result<RecordingArtifact> {
        self.recorder.stop().await
    }

    /// End any broadcast and release every resource
    ///
    /// A recording that was not taken with [`LocalRecorder::take_file`] is
    /// deleted.
    pub async fn shutdown(&mut self) {
        if self.live.is_some() {
            if let Err(e) = self.end_broadcast().await {
                tracing::warn!(error = %e, "Failed to end broadcast during shutdown");
            }
        }
        self.recorder.discard().await;

        let kinds: Vec<SourceKind> = self.sources.keys().copied().collect();
        for kind in kinds {
            self.disable_source(kind).await;
        }
        self.compositor.shutdown().await;

        tracing::info!(broadcaster = %self.config.broadcaster_id, "Studio shut down");
    }
}

impl Drop for BroadcastStudio {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.viewer_count.abort();
        }
    }
}

async fn push_viewer_count(
    manager: Arc<PeerConnectionManager>,
    registry: Arc<dyn SessionRegistry>,
    session_id: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_VIEWER_COUNT_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = None;

    loop {
        ticker.tick().await;
        if manager.is_ended() {
            break;
        }

        let count = manager.viewer_count().await as u32;
        if last == Some(count) {
            continue;
        }
        match registry.set_viewer_count(&session_id, count).await {
            Ok(()) => {
                tracing::debug!(session = %session_id, viewers = count, "Viewer count updated");
                last = Some(count);
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Viewer count update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Resolution, SyntheticCapture};
    use crate::peer::LoopbackNetwork;
    use crate::session::MemorySessionRegistry;
    use crate::signaling::MemoryRealtime;

    fn studio(registry: Arc<MemorySessionRegistry>) -> BroadcastStudio {
        let channel = SignalingChannel::new(Arc::new(MemoryRealtime::new()));
        let config = StudioConfig::new("angler-1").compositor(
            CompositorConfig::default()
                .output_resolution(Resolution::new(64, 36))
                .output_frame_rate(10),
        );
        BroadcastStudio::new(config, channel, Arc::new(LoopbackNetwork::new()), registry)
    }

    #[tokio::test]
    async fn test_go_live_and_end() {
        let registry = Arc::new(MemorySessionRegistry::new());
        let mut studio = studio(Arc::clone(&registry));
        assert!(!studio.is_live());

        let session = studio.go_live("Dawn pike", "pike").await.unwrap();
        assert!(studio.is_live());
        assert!(registry.is_live(&session.id).await.unwrap());
        assert!(matches!(
            studio.go_live("Again", "pike").await,
            Err(Error::SessionAlreadyLive(_))
        ));

        let ended = studio.end_broadcast().await.unwrap();
        assert!(!ended.is_live);
        assert!(!registry.is_live(&session.id).await.unwrap());
        assert!(matches!(
            studio.end_broadcast().await,
            Err(Error::InvalidState(_))
        ));

        studio.shutdown().await;
        assert!(!studio.compositor().is_running());
    }

    #[test]
    fn test_viewer_count_interval_is_clamped() {
        let config = StudioConfig::new("angler-1").viewer_count_interval(Duration::ZERO);
        assert_eq!(config.viewer_count_interval, MIN_VIEWER_COUNT_INTERVAL);

        let config = StudioConfig::new("angler-1").viewer_count_interval(Duration::from_secs(5));
        assert_eq!(config.viewer_count_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_recorder_is_told_the_output_size() {
        let registry = Arc::new(MemorySessionRegistry::new());
        let mut studio = studio(registry);
        assert_eq!(
            studio.recorder().config().frame_size,
            Some(Resolution::new(64, 36))
        );
        studio.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_rejects_second_live_session() {
        let registry = Arc::new(MemorySessionRegistry::new());
        registry
            .create_live_session("angler-1", "Elsewhere", "carp")
            .await
            .unwrap();

        let mut studio = studio(registry);
        assert!(matches!(
            studio.go_live("Dawn pike", "pike").await,
            Err(Error::SessionAlreadyLive(_))
        ));
        assert!(!studio.is_live());
    }

    #[tokio::test]
    async fn test_denied_source_is_reported() {
        let registry = Arc::new(MemorySessionRegistry::new());
        let mut studio = studio(registry);
        let backend = SyntheticCapture::new(Resolution::new(32, 18), 10);
        backend.deny(SourceKind::Camera);

        let err = studio
            .enable_source(&backend, SourceKind::Camera)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceAccessDenied(_)));
        assert!(!studio.is_source_enabled(SourceKind::Camera));
        assert!(studio.compositor().active_sources().is_none());

        studio.enable_source(&backend, SourceKind::Screen).await.unwrap();
        assert!(studio.is_source_enabled(SourceKind::Screen));
        assert!(studio.audio_level(SourceKind::Screen).is_some());

        assert!(studio.disable_source(SourceKind::Screen).await);
        assert!(!studio.disable_source(SourceKind::Screen).await);
        assert!(studio.compositor().is_running());
    }
}
