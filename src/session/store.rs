//! # Session Storage
//!
//! Session records are kept behind the [`SessionStore`] trait so a database
//! backend can replace the in-memory store without touching lifecycle logic.
//! Records are never physically deleted; ending a session only flips
//! `is_active` and stamps `end_time`.

use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} already exists")]
    Duplicate(String),
}

/// In-place edit applied under the store's lock. Returns whether anything changed.
pub type SessionMutation = Box<dyn FnOnce(&mut Session) -> bool + Send>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Every known session, active or not, oldest first.
    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    async fn active(&self) -> Result<Vec<Session>, StoreError>;

    /// Apply `mutation` to one session and return the resulting record.
    async fn modify(
        &self,
        session_id: &str,
        mutation: SessionMutation,
    ) -> Result<Session, StoreError>;

    /// Compare-and-set deactivation: only an active session is changed.
    ///
    /// Returns `true` when this call performed the transition.
    async fn deactivate(
        &self,
        session_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(StoreError::Duplicate(session.session_id));
        }
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let mut all: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.start_time);
        Ok(all)
    }

    async fn active(&self) -> Result<Vec<Session>, StoreError> {
        let mut active: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.start_time);
        Ok(active)
    }

    async fn modify(
        &self,
        session_id: &str,
        mutation: SessionMutation,
    ) -> Result<Session, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        mutation(session);
        Ok(session.clone())
    }

    async fn deactivate(
        &self,
        session_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        if !session.is_active {
            return Ok(false);
        }

        session.is_active = false;
        session.end_time = Some(at);
        session.quality_reason = Some(reason.to_string());
        session.grace_started_at = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deactivate_is_compare_and_set() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store.insert(Session::new("s1", "en", now)).await.unwrap();

        assert!(store.deactivate("s1", "manual", now).await.unwrap());
        assert!(!store.deactivate("s1", "again", now).await.unwrap());

        let session = store.get("s1").await.unwrap().unwrap();
        assert_eq!(session.quality_reason.as_deref(), Some("manual"));
        assert!(store.active().await.unwrap().is_empty());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_is_an_error() {
        let store = InMemorySessionStore::new();
        let result = store.modify("nope", Box::new(|_: &mut Session| true)).await;
        assert_eq!(result.unwrap_err(), StoreError::NotFound("nope".to_string()));
    }
}
