//! livecast: the live-broadcast core of a community streaming app
//!
//! One broadcaster streams to many viewers over direct peer media links.
//!
//! ```text
//!   camera ─┐                                   ┌──► viewer 1
//!           ├─► StreamCompositor ─► composite ──┼──► viewer 2   (PeerConnectionManager)
//!   screen ─┘         │                         └──► viewer N
//!      │              └──────────────────────────► LocalRecorder
//!      └──► AudioLevelMonitor
//! ```
//!
//! Links are negotiated over a [`signaling::SignalingChannel`] carried by any
//! topic bus implementing [`signaling::RealtimeTransport`]. Media moves over
//! whatever [`peer::PeerConnector`] is supplied; [`peer::LoopbackNetwork`]
//! connects peers inside one process.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use livecast::media::{Resolution, SourceKind, SyntheticCapture};
//! use livecast::peer::{LoopbackNetwork, ViewerConfig, ViewerConnection, ViewerState};
//! use livecast::session::{BroadcastStudio, MemorySessionRegistry, StudioConfig};
//! use livecast::signaling::{MemoryRealtime, SignalingChannel};
//!
//! #[tokio::main]
//! async fn main() -> livecast::Result<()> {
//!     let channel = SignalingChannel::new(Arc::new(MemoryRealtime::new()));
//!     let network = Arc::new(LoopbackNetwork::new());
//!     let registry = Arc::new(MemorySessionRegistry::new());
//!
//!     let mut studio = BroadcastStudio::new(
//!         StudioConfig::new("angler-1"),
//!         channel.clone(),
//!         network.clone(),
//!         registry,
//!     );
//!     let capture = SyntheticCapture::new(Resolution::HD, 30);
//!     studio.enable_source(&capture, SourceKind::Camera).await?;
//!     let session = studio.go_live("Dawn on the river", "pike").await?;
//!
//!     let viewer = ViewerConnection::connect(
//!         &session.id,
//!         "viewer-1",
//!         channel,
//!         network,
//!         ViewerConfig::default(),
//!     )
//!     .await?;
//!     viewer.wait_for_state(ViewerState::Connected).await?;
//!
//!     studio.end_broadcast().await?;
//!     studio.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod audio;
pub mod compositor;
pub mod error;
pub mod media;
pub mod peer;
pub mod recorder;
pub mod session;
pub mod signaling;
pub mod stats;

pub use audio::{AudioLevelMonitor, MonitorConfig};
pub use compositor::{CompositorConfig, Layout, StreamCompositor};
pub use error::{Error, Result};
pub use peer::{LinkState, ManagerConfig, PeerConnectionManager, ViewerConfig, ViewerConnection, ViewerState};
pub use recorder::{LocalRecorder, RecorderConfig, RecorderEvent, RecorderState};
pub use session::{BroadcastStudio, MemorySessionRegistry, SessionRegistry, StreamSession, StudioConfig};
pub use signaling::{MemoryRealtime, RealtimeTransport, SignalingChannel, SignalingEnvelope};
