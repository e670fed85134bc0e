//! Direct media links between the broadcaster and its viewers
//!
//! The broadcaster runs one [`PeerConnectionManager`] per live session; each
//! viewer runs a [`ViewerConnection`]. Both sides negotiate over the
//! session's signaling channel and drive a [`PeerConnection`] supplied by a
//! [`PeerConnector`]. [`LoopbackNetwork`] is the in-process connector.
//!
//! Negotiation identity:
//!
//! - `instance`: one per `ViewerConnection`, stamped on every payload
//! - `epoch`: bumped each time a viewer discards its connection and re-announces
//! - `revision`: bumped each time the broadcaster sends a fresh offer to a viewer
//!
//! A viewer applies an offer only if it carries its own instance and a
//! revision newer than the last one applied. The broadcaster applies an
//! answer only for the revision it is waiting on.

pub mod config;
pub mod connection;
pub mod link;
pub mod loopback;
pub mod manager;
pub mod negotiation;
pub mod viewer;

pub use config::{ManagerConfig, ViewerConfig};
pub use connection::{PeerConnection, PeerConnector, PeerEvent, PeerEventSink, PeerRole};
pub use link::{LinkState, PeerLink};
pub use loopback::{LoopbackConnection, LoopbackNetwork};
pub use manager::PeerConnectionManager;
pub use viewer::{ViewerConnection, ViewerState};
