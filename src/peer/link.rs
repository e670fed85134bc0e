//! Broadcaster-side view of one viewer link

use chrono::{DateTime, Utc};

use crate::stats::LinkStats;

/// Link lifecycle
///
/// ```text
/// New ──► OfferSent ──► Connected
///             ▲   │          │
///             └───┴──────────┴──► Failed (tombstone)
///        (fresh offer on retry)
/// any ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    OfferSent,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    /// No further transitions happen without a new join
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    /// Negotiation is in flight
    pub fn is_negotiating(&self) -> bool {
        matches!(self, LinkState::New | LinkState::OfferSent)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::New => "new",
            LinkState::OfferSent => "offer-sent",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a link, published by its task
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub session_id: String,
    pub viewer_id: String,
    pub state: LinkState,
    pub created_at: DateTime<Utc>,
    /// Viewer connection instance served by this link
    pub instance: String,
    /// Highest viewer epoch this link has answered for
    pub epoch: u32,
    /// Revision of the most recent offer
    pub revision: u32,
    /// Transport failures since the link last connected
    pub consecutive_failures: u32,
    pub stats: LinkStats,
}

impl PeerLink {
    pub fn new(session_id: &str, viewer_id: &str, instance: &str, epoch: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            viewer_id: viewer_id.to_string(),
            state: LinkState::New,
            created_at: Utc::now(),
            instance: instance.to_string(),
            epoch,
            revision: 0,
            consecutive_failures: 0,
            stats: LinkStats::new(),
        }
    }
}
