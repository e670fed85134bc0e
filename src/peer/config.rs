//! Peer negotiation configuration

use std::time::Duration;

/// Viewer-side configuration
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Delay between `viewer-join` announcements while waiting for an offer
    pub announce_interval: Duration,

    /// Announcements sent without an offer before giving up
    pub max_announce_attempts: u32,

    /// Automatic restarts after a transport failure
    pub max_transport_retries: u32,

    /// Broadcaster to trust before one has sent an offer
    pub broadcaster_id: Option<String>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(3),
            max_announce_attempts: 10,
            max_transport_retries: 1,
            broadcaster_id: None,
        }
    }
}

impl ViewerConfig {
    /// Set the announce interval
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Set the announce budget (at least one announcement is always sent)
    pub fn max_announce_attempts(mut self, attempts: u32) -> Self {
        self.max_announce_attempts = attempts.max(1);
        self
    }

    /// Set the transport retry budget
    pub fn max_transport_retries(mut self, retries: u32) -> Self {
        self.max_transport_retries = retries;
        self
    }

    /// Only accept offers and session end from `broadcaster_id`
    pub fn broadcaster(mut self, broadcaster_id: impl Into<String>) -> Self {
        self.broadcaster_id = Some(broadcaster_id.into());
        self
    }
}

/// Broadcaster-side configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Fresh offers sent after a transport failure before a link is failed
    pub max_transport_retries: u32,

    /// Time an offer may stay unanswered or unconnected
    pub negotiation_timeout: Duration,

    /// Maximum concurrent viewers (0 = unlimited)
    pub max_viewers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_transport_retries: 1,
            negotiation_timeout: Duration::from_secs(15),
            max_viewers: 0, // Unlimited
        }
    }
}

impl ManagerConfig {
    /// Set the transport retry budget
    pub fn max_transport_retries(mut self, retries: u32) -> Self {
        self.max_transport_retries = retries;
        self
    }

    /// Set the negotiation timeout
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the viewer limit
    pub fn max_viewers(mut self, max: usize) -> Self {
        self.max_viewers = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_defaults() {
        let config = ViewerConfig::default();

        assert_eq!(config.announce_interval, Duration::from_secs(3));
        assert_eq!(config.max_announce_attempts, 10);
        assert_eq!(config.max_transport_retries, 1);
        assert!(config.broadcaster_id.is_none());
    }

    #[test]
    fn test_viewer_builder() {
        let config = ViewerConfig::default()
            .announce_interval(Duration::from_millis(500))
            .max_announce_attempts(0)
            .max_transport_retries(3)
            .broadcaster("host");

        assert_eq!(config.announce_interval, Duration::from_millis(500));
        assert_eq!(config.max_announce_attempts, 1);
        assert_eq!(config.max_transport_retries, 3);
        assert_eq!(config.broadcaster_id.as_deref(), Some("host"));
    }

    #[test]
    fn test_manager_defaults_and_builder() {
        let config = ManagerConfig::default();
        assert_eq!(config.negotiation_timeout, Duration::from_secs(15));
        assert_eq!(config.max_viewers, 0);

        let config = config.max_viewers(2).negotiation_timeout(Duration::from_secs(5));
        assert_eq!(config.max_viewers, 2);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(5));
    }
}
