//! Live session records
//!
//! The session registry is an external collaborator: the broadcast core only
//! creates and ends sessions and reads their liveness. [`MemorySessionRegistry`]
//! keeps records in process and enforces one live session per broadcaster.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};

/// One broadcast, live or finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub id: String,
    pub broadcaster_id: String,
    pub title: String,
    pub category: String,
    pub is_live: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub viewer_count: u32,
    pub like_count: u32,
}

impl StreamSession {
    fn new(broadcaster_id: &str, title: &str, category: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            broadcaster_id: broadcaster_id.to_string(),
            title: title.to_string(),
            category: category.to_string(),
            is_live: true,
            started_at: Utc::now(),
            ended_at: None,
            viewer_count: 0,
            like_count: 0,
        }
    }
}

/// Store of stream sessions
#[async_trait]
pub trait SessionRegistry: Send + Sync + 'static {
    /// Create a live session for `broadcaster_id`
    ///
    /// Fails with `SessionAlreadyLive` if the broadcaster already has one.
    async fn create_live_session(
        &self,
        broadcaster_id: &str,
        title: &str,
        category: &str,
    ) -> Result<StreamSession>;

    /// Mark a session as ended; ending twice returns the ended record
    async fn end_session(&self, session_id: &str) -> Result<StreamSession>;

    async fn is_live(&self, session_id: &str) -> Result<bool>;

    /// Record the current number of connected viewers
    async fn set_viewer_count(&self, session_id: &str, count: u32) -> Result<()>;
}

/// In-process session registry
#[derive(Default)]
pub struct MemorySessionRegistry {
    sessions: RwLock<HashMap<String, StreamSession>>,
}

impl MemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session record
    pub async fn session(&self, session_id: &str) -> Option<StreamSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// The broadcaster's live session, if any
    pub async fn live_session_of(&self, broadcaster_id: &str) -> Option<StreamSession> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .find(|s| s.is_live && s.broadcaster_id == broadcaster_id)
            .cloned()
    }
}

#[async_trait]
impl SessionRegistry for MemorySessionRegistry {
    async fn create_live_session(
        &self,
        broadcaster_id: &str,
        title: &str,
        category: &str,
    ) -> Result<StreamSession> {
        let mut sessions = self.sessions.write().await;

        if sessions
            .values()
            .any(|s| s.is_live && s.broadcaster_id == broadcaster_id)
        {
            return Err(Error::SessionAlreadyLive(broadcaster_id.to_string()));
        }

        let session = StreamSession::new(broadcaster_id, title, category);
        sessions.insert(session.id.clone(), session.clone());

        tracing::info!(
            session = %session.id,
            broadcaster = broadcaster_id,
            category = category,
            "Live session created"
        );
        Ok(session)
    }

    async fn end_session(&self, session_id: &str) -> Result<StreamSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        if session.is_live {
            session.is_live = false;
            session.ended_at = Some(Utc::now());
            session.viewer_count = 0;
            tracing::info!(session = session_id, "Live session ended");
        }
        Ok(session.clone())
    }

    async fn is_live(&self, session_id: &str) -> Result<bool> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.is_live)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    async fn set_viewer_count(&self, session_id: &str, count: u32) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        if !session.is_live {
            return Err(Error::InvalidState(format!(
                "session {} is not live",
                session_id
            )));
        }
        session.viewer_count = count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_live_session_per_broadcaster() {
        let registry = MemorySessionRegistry::new();

        let first = registry
            .create_live_session("angler-1", "Evening carp", "carp")
            .await
            .unwrap();
        assert!(first.is_live);
        assert!(registry.is_live(&first.id).await.unwrap());

        let err = registry
            .create_live_session("angler-1", "Second", "carp")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyLive(_)));

        // Another broadcaster is unaffected
        registry
            .create_live_session("angler-2", "Fly tying", "fly")
            .await
            .unwrap();

        let ended = registry.end_session(&first.id).await.unwrap();
        assert!(!ended.is_live);
        assert!(ended.ended_at.is_some());
        assert!(!registry.is_live(&first.id).await.unwrap());

        // Free to go live again
        registry
            .create_live_session("angler-1", "Night session", "carp")
            .await
            .unwrap();
        assert!(registry.live_session_of("angler-1").await.is_some());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let registry = MemorySessionRegistry::new();
        let session = registry.create_live_session("a", "t", "c").await.unwrap();

        let first = registry.end_session(&session.id).await.unwrap();
        let second = registry.end_session(&session.id).await.unwrap();
        assert_eq!(first.ended_at, second.ended_at);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = MemorySessionRegistry::new();

        assert!(matches!(
            registry.end_session("nope").await,
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.is_live("nope").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_viewer_count() {
        let registry = MemorySessionRegistry::new();
        let session = registry.create_live_session("a", "t", "c").await.unwrap();

        registry.set_viewer_count(&session.id, 3).await.unwrap();
        assert_eq!(registry.session(&session.id).await.unwrap().viewer_count, 3);

        registry.end_session(&session.id).await.unwrap();
        assert!(matches!(
            registry.set_viewer_count(&session.id, 4).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_json_shape() {
        let session = StreamSession::new("angler-1", "Pike", "pike");
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["broadcasterId"], "angler-1");
        assert_eq!(json["isLive"], true);
        assert!(json["endedAt"].is_null());
        assert_eq!(json["viewerCount"], 0);
    }
}
