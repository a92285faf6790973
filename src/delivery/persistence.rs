//! Best-effort record of delivered translations.
//!
//! Storage is an external collaborator. The shipped store forwards records
//! over a channel to a background task that logs them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationRecord {
    pub session_id: String,
    pub source_language: String,
    pub target_language: String,
    pub original_text: String,
    pub translated_text: String,
    pub recipients: usize,
    pub degraded: bool,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("translation store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TranslationStore: Send + Sync {
    async fn record(&self, record: TranslationRecord) -> Result<(), PersistenceError>;
}

/// Sends records to a [`TranslationLogActor`].
#[derive(Debug, Clone)]
pub struct ChannelTranslationStore {
    tx: mpsc::Sender<TranslationRecord>,
}

impl ChannelTranslationStore {
    /// Create the store and the actor that drains it.
    pub fn channel(capacity: usize) -> (Self, TranslationLogActor) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, TranslationLogActor { rx })
    }
}

#[async_trait]
impl TranslationStore for ChannelTranslationStore {
    async fn record(&self, record: TranslationRecord) -> Result<(), PersistenceError> {
        self.tx
            .try_send(record)
            .map_err(|err| PersistenceError::Unavailable(err.to_string()))
    }
}

pub struct TranslationLogActor {
    rx: mpsc::Receiver<TranslationRecord>,
}

impl TranslationLogActor {
    pub async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            info!(
                target: "persistence",
                session_id = %record.session_id,
                target_language = %record.target_language,
                recipients = record.recipients,
                degraded = record.degraded,
                "Translation recorded"
            );
        }
    }
}
