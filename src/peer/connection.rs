//! Direct media link abstraction
//!
//! The peer state machines drive a [`PeerConnection`] through offer/answer
//! and candidate exchange but never look inside it. Everything the
//! connection reports back (local candidates, connectivity, remote tracks)
//! arrives as a [`PeerEvent`] on the owner's queue, tagged with the
//! generation the connection was created for so events from a discarded
//! connection can be recognised and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{IceCandidate, SessionDescription};

/// Which side of the negotiation a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Broadcaster: sends media and creates offers
    Offerer,
    /// Viewer: receives media and answers
    Answerer,
}

/// Notification from a connection to its owner
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate that must be signaled to the remote side
    LocalCandidate(IceCandidate),
    /// Transport-level connectivity established
    Connected,
    /// Transport-level failure; the connection is unusable
    Failed(String),
    /// Remote media arrived (answerer only)
    Track(MediaStream),
}

/// Generation-tagged event queue handed to a connection at creation
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u32,
    tx: mpsc::UnboundedSender<(u32, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: u32, tx: mpsc::UnboundedSender<(u32, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Deliver an event; returns false if the owner has gone away
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Factory for direct media links
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Create a connection between `local_id` and `remote_id`
    async fn create(
        &self,
        local_id: &str,
        remote_id: &str,
        role: PeerRole,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// One direct media link
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach an outgoing track (before the offer is created)
    async fn add_track(&self, track: MediaTrack) -> Result<()>;

    /// Swap an outgoing track in place without renegotiating
    ///
    /// Fails with `NegotiationFailure` when no attached track is compatible.
    async fn replace_track(&self, track: MediaTrack) -> Result<()>;

    /// Create and apply the local offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create and apply the local answer (remote offer must be set)
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the remote side's description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; applying the same candidate twice is a no-op
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Release the connection
    async fn close(&self);
}
