//! # Transport Capability
//!
//! A transport moves opaque frames between the relay and connected clients.
//! The dispatcher only sees [`TransportEvent`]s and sends serialized text, so
//! WebSocket and any peer-to-peer transport plug in the same way.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Text(String),
    Binary(Vec<u8>),
    /// Already-parsed payload from an in-process transport
    Structured(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected {
        connection_id: String,
        peer: Option<String>,
    },
    Message {
        connection_id: String,
        payload: RawPayload,
    },
    Disconnected {
        connection_id: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection {0} is not open")]
    UnknownConnection(String),
    #[error("connection {0} mailbox is closed or full")]
    Closed(String),
    #[error("transport already has a subscriber")]
    AlreadySubscribed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving connect/message/disconnect events. One subscriber at a time.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Stop delivering events; the subscriber's stream ends.
    fn unsubscribe(&self);

    async fn send(&self, connection_id: &str, text: String) -> Result<(), TransportError>;
}

/// Single-subscriber event fan-in shared by transport implementations.
#[derive(Debug, Default)]
pub struct EventHub {
    subscriber: RwLock<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut subscriber = self.subscriber.write().unwrap_or_else(PoisonError::into_inner);
        if subscriber.as_ref().map_or(false, |tx| !tx.is_closed()) {
            return Err(TransportError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *subscriber = Some(tx);
        Ok(rx)
    }

    pub fn unsubscribe(&self) {
        self.subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Forward an event; dropped when nobody is subscribed.
    pub fn emit(&self, event: TransportEvent) {
        let subscriber = self.subscriber.read().unwrap_or_else(PoisonError::into_inner);
        match subscriber.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Transport subscriber went away, event dropped");
                }
            }
            None => debug!("No transport subscriber, event dropped"),
        }
    }
}
