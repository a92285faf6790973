//! Connection registry: best-known role, language and session per connection.

use crate::delivery::ListenerSettings;
use crate::realtime::messages::Role;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEntry {
    pub connection_id: String,
    pub role: Role,
    pub language_code: Option<String>,
    pub session_id: Option<String>,
    pub settings: ListenerSettings,
    pub peer: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionEntry {
    fn new(connection_id: &str, peer: Option<String>) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            role: Role::Unknown,
            language_code: None,
            session_id: None,
            settings: ListenerSettings::default(),
            peer,
            connected_at: Utc::now(),
        }
    }
}

/// Registration fields written by the `register` message.
#[derive(Debug, Clone)]
pub struct Registration {
    pub role: Role,
    pub language_code: String,
    pub session_id: Option<String>,
    pub settings: ListenerSettings,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RoleCounts {
    pub teachers: usize,
    pub students: usize,
    pub unregistered: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, connection_id: &str, peer: Option<String>) {
        self.entries
            .write()
            .await
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionEntry::new(connection_id, peer));
    }

    /// Apply a registration and return the entry as it was before.
    pub async fn register(
        &self,
        connection_id: &str,
        registration: Registration,
    ) -> Option<ConnectionEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionEntry::new(connection_id, None));
        let previous = entry.clone();

        entry.role = registration.role;
        entry.language_code = Some(registration.language_code);
        entry.session_id = registration.session_id;
        entry.settings = registration.settings;

        (previous.role != Role::Unknown).then_some(previous)
    }

    pub async fn get(&self, connection_id: &str) -> Option<ConnectionEntry> {
        self.entries.read().await.get(connection_id).cloned()
    }

    pub async fn remove(&self, connection_id: &str) -> Option<ConnectionEntry> {
        self.entries.write().await.remove(connection_id)
    }

    /// Every connection currently associated with a session.
    pub async fn in_session(&self, session_id: &str) -> Vec<ConnectionEntry> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }

    pub async fn students_in_session(&self, session_id: &str) -> Vec<ConnectionEntry> {
        self.in_session(session_id)
            .await
            .into_iter()
            .filter(|e| e.role == Role::Student)
            .collect()
    }

    /// Detach every connection from a session that has ended.
    pub async fn clear_session(&self, session_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let mut cleared = 0;
        for entry in entries.values_mut() {
            if entry.session_id.as_deref() == Some(session_id) {
                entry.session_id = None;
                cleared += 1;
            }
        }
        cleared
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn role_counts(&self) -> RoleCounts {
        let entries = self.entries.read().await;
        entries.values().fold(RoleCounts::default(), |mut counts, e| {
            match e.role {
                Role::Teacher => counts.teachers += 1,
                Role::Student => counts.students += 1,
                Role::Unknown => counts.unregistered += 1,
            }
            counts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(language: &str, session: &str) -> Registration {
        Registration {
            role: Role::Student,
            language_code: language.to_string(),
            session_id: Some(session.to_string()),
            settings: ListenerSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_register_reports_previous_registration() {
        let registry = ConnectionRegistry::new();
        registry.connect("c1", None).await;

        assert!(registry.register("c1", student("es", "s1")).await.is_none());
        let previous = registry.register("c1", student("fr", "s1")).await.unwrap();
        assert_eq!(previous.language_code.as_deref(), Some("es"));

        let current = registry.get("c1").await.unwrap();
        assert_eq!(current.language_code.as_deref(), Some("fr"));
    }

    #[tokio::test]
    async fn test_session_membership() {
        let registry = ConnectionRegistry::new();
        for (id, session) in [("a", "s1"), ("b", "s1"), ("c", "s2")] {
            registry.connect(id, None).await;
            registry.register(id, student("es", session)).await;
        }
        registry
            .register(
                "t",
                Registration {
                    role: Role::Teacher,
                    language_code: "en".to_string(),
                    session_id: Some("s1".to_string()),
                    settings: ListenerSettings::default(),
                },
            )
            .await;

        assert_eq!(registry.in_session("s1").await.len(), 3);
        assert_eq!(registry.students_in_session("s1").await.len(), 2);
        assert_eq!(registry.clear_session("s1").await, 3);
        assert!(registry.in_session("s1").await.is_empty());

        let counts = registry.role_counts().await;
        assert_eq!((counts.teachers, counts.students), (1, 3));
    }
}
