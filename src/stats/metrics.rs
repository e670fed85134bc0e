//! Statistics for peer links and the compositor

use std::time::Instant;

use crate::compositor::Layout;
use crate::peer::{LinkState, PeerLink};

/// Per-link negotiation statistics
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    /// Offers published to the viewer
    pub offers_sent: u64,
    /// Answers applied
    pub answers_applied: u64,
    /// Remote candidates applied to the connection
    pub candidates_applied: u64,
    /// Local candidates published to the viewer
    pub candidates_sent: u64,
    /// Transport failures and negotiation timeouts
    pub transport_failures: u64,
    /// Offers caused by a superseding join or an incompatible track
    pub renegotiations: u64,
    /// Last time the link reached `Connected`
    pub connected_at: Option<Instant>,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Aggregate view over all links of a manager
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Registered links, tombstones included
    pub links: usize,
    pub connected: usize,
    pub negotiating: usize,
    pub failed: usize,
    /// Offers sent across all links
    pub offers_sent: u64,
    /// Transport failures across all links
    pub transport_failures: u64,
}

impl ManagerStats {
    /// Aggregate a set of link snapshots
    pub fn from_links<'a>(links: impl IntoIterator<Item = &'a PeerLink>) -> Self {
        let mut stats = Self::default();
        for link in links {
            stats.links += 1;
            match link.state {
                LinkState::Connected => stats.connected += 1,
                LinkState::New | LinkState::OfferSent => stats.negotiating += 1,
                LinkState::Failed => stats.failed += 1,
                LinkState::Closed => {}
            }
            stats.offers_sent += link.stats.offers_sent;
            stats.transport_failures += link.stats.transport_failures;
        }
        stats
    }
}

/// Compositor output statistics
#[derive(Debug, Clone)]
pub struct CompositorStats {
    /// Start time
    pub started_at: Instant,
    /// Video frames emitted on the output track
    pub frames_emitted: u64,
    /// Mixed audio chunks emitted on the output track
    pub audio_chunks_emitted: u64,
    /// Layout used for the most recent frame
    pub last_layout: Option<Layout>,
}

impl CompositorStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames_emitted: 0,
            audio_chunks_emitted: 0,
            last_layout: None,
        }
    }
}

impl Default for CompositorStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_stats_new() {
        let stats = LinkStats::new();
        assert_eq!(stats.offers_sent, 0);
        assert_eq!(stats.transport_failures, 0);
        assert!(stats.connected_at.is_none());
    }

    #[test]
    fn test_manager_stats_from_links() {
        let mut a = PeerLink::new("s", "a", "i", 1);
        a.state = LinkState::Connected;
        a.stats.offers_sent = 2;
        a.stats.transport_failures = 1;

        let mut b = PeerLink::new("s", "b", "i", 1);
        b.state = LinkState::OfferSent;
        b.stats.offers_sent = 1;

        let mut c = PeerLink::new("s", "c", "i", 1);
        c.state = LinkState::Failed;

        let stats = ManagerStats::from_links([&a, &b, &c]);
        assert_eq!(stats.links, 3);
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.negotiating, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.offers_sent, 3);
        assert_eq!(stats.transport_failures, 1);
    }

    #[test]
    fn test_compositor_stats_framerate() {
        let stats = CompositorStats::new();
        assert_eq!(stats.frames_emitted, 0);
        assert!(stats.last_layout.is_none());
    }
}
