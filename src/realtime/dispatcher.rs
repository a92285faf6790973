//! # Realtime Dispatcher
//!
//! Routes transport events to message handlers and exposes the outward
//! [`MessageSender`].
//!
//! ## Guarantees:
//! - **Ordering**: one worker queue per connection, so a speaker's messages are
//!   handled in arrival order while connections proceed concurrently
//! - **Isolation**: each handler call runs in its own task; an error or panic
//!   is logged and reported to the `error` handler, and dispatch continues
//! - **Closed types**: handlers only ever see a validated [`InboundMessage`]
//!
//! ## Error routing:
//! Parse failures, unhandled types and handler failures are turned into a
//! synthetic `error` message for the registered `error` handler. Without an
//! error handler they are only logged.

use crate::realtime::messages::{parse_inbound, InboundMessage, MessageKind, OutboundMessage, Role};
use crate::realtime::registry::{ConnectionEntry, ConnectionRegistry};
use crate::realtime::transport::{RawPayload, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Best-known facts about the sender of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    pub connection_id: String,
    pub role: Role,
    pub language_code: Option<String>,
    pub session_id: Option<String>,
}

impl MessageContext {
    fn from_entry(connection_id: &str, entry: Option<ConnectionEntry>) -> Self {
        match entry {
            Some(entry) => Self {
                connection_id: connection_id.to_string(),
                role: entry.role,
                language_code: entry.language_code,
                session_id: entry.session_id,
            },
            None => Self {
                connection_id: connection_id.to_string(),
                role: Role::Unknown,
                language_code: None,
                session_id: None,
            },
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> anyhow::Result<()>;
}

/// Told when a connection closes, after its queued messages were handled.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn connection_closed(&self, entry: &ConnectionEntry);
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
}

/// The only outward channel for every downstream component.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, connection_id: &str, message: &OutboundMessage) -> Result<(), SendError>;

    async fn broadcast_to_session(
        &self,
        session_id: &str,
        message: &OutboundMessage,
    ) -> BroadcastOutcome;
}

struct TransportSender {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
}

#[async_trait]
impl MessageSender for TransportSender {
    async fn send(&self, connection_id: &str, message: &OutboundMessage) -> Result<(), SendError> {
        let text = serde_json::to_string(message)?;
        self.transport.send(connection_id, text).await?;
        Ok(())
    }

    async fn broadcast_to_session(
        &self,
        session_id: &str,
        message: &OutboundMessage,
    ) -> BroadcastOutcome {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "Failed to serialize broadcast");
                return BroadcastOutcome::default();
            }
        };

        let mut outcome = BroadcastOutcome::default();
        for entry in self.registry.in_session(session_id).await {
            match self.transport.send(&entry.connection_id, text.clone()).await {
                Ok(()) => outcome.sent += 1,
                Err(err) => {
                    outcome.failed += 1;
                    warn!(
                        session_id = %session_id,
                        connection_id = %entry.connection_id,
                        error = %err,
                        "Broadcast send failed"
                    );
                }
            }
        }
        outcome
    }
}

enum WorkItem {
    Payload(RawPayload),
    Closed,
}

struct DispatcherCore {
    registry: Arc<ConnectionRegistry>,
    handlers: RwLock<HashMap<MessageKind, Arc<dyn MessageHandler>>>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
}

impl DispatcherCore {
    fn handler(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    async fn dispatch(&self, connection_id: &str, payload: RawPayload) {
        let ctx = MessageContext::from_entry(connection_id, self.registry.get(connection_id).await);

        let message = match parse_inbound(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(connection_id = %connection_id, error = %err, "Inbound parse failed");
                self.report_error(ctx, err.to_string()).await;
                return;
            }
        };

        let kind = message.kind();
        let Some(handler) = self.handler(kind) else {
            self.report_error(ctx, format!("no handler for message type '{}'", kind))
                .await;
            return;
        };

        if let Err(reason) = run_isolated(handler, ctx.clone(), message).await {
            warn!(
                connection_id = %connection_id,
                message_type = %kind,
                error = %reason,
                "Message handler failed"
            );
            if kind != MessageKind::Error {
                self.report_error(ctx, reason).await;
            }
        }
    }

    async fn report_error(&self, ctx: MessageContext, message: String) {
        let Some(handler) = self.handler(MessageKind::Error) else {
            debug!(connection_id = %ctx.connection_id, error = %message, "No error handler registered");
            return;
        };

        let connection_id = ctx.connection_id.clone();
        if let Err(reason) = run_isolated(handler, ctx, InboundMessage::Error { message }).await {
            error!(connection_id = %connection_id, error = %reason, "Error handler failed");
        }
    }

    async fn close(&self, connection_id: &str) {
        let Some(entry) = self.registry.remove(connection_id).await else {
            return;
        };
        info!(connection_id = %connection_id, role = %entry.role, "Connection closed");

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.connection_closed(&entry).await;
        }
    }
}

/// Run one handler call in its own task so a panic cannot take down the worker.
async fn run_isolated(
    handler: Arc<dyn MessageHandler>,
    ctx: MessageContext,
    message: InboundMessage,
) -> Result<(), String> {
    match tokio::spawn(async move { handler.handle(ctx, message).await }).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(join_error) if join_error.is_panic() => Err("handler panicked".to_string()),
        Err(join_error) => Err(join_error.to_string()),
    }
}

pub struct RealtimeDispatcher {
    transport: Arc<dyn Transport>,
    core: Arc<DispatcherCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeDispatcher {
    pub fn new(transport: Arc<dyn Transport>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            transport,
            core: Arc::new(DispatcherCore {
                registry,
                handlers: RwLock::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.core.registry
    }

    /// Associate a handler with a message type, replacing any earlier one.
    pub fn register_handler(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.core
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.core
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn message_sender(&self) -> Arc<dyn MessageSender> {
        Arc::new(TransportSender {
            transport: self.transport.clone(),
            registry: self.core.registry.clone(),
        })
    }

    /// Subscribe to the transport and start routing events.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }

        let events = self.transport.subscribe()?;
        let core = self.core.clone();
        *task = Some(tokio::spawn(route_events(core, events)));
        info!(transport = self.transport.name(), "Realtime dispatcher started");
        Ok(())
    }

    /// Unsubscribe from the transport and stop routing.
    pub fn stop(&self) {
        self.transport.unsubscribe();
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            info!(transport = self.transport.name(), "Realtime dispatcher stopped");
        }
    }
}

async fn route_events(
    core: Arc<DispatcherCore>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut workers: HashMap<String, mpsc::UnboundedSender<WorkItem>> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected { connection_id, peer } => {
                core.registry.connect(&connection_id, peer).await;
                workers
                    .entry(connection_id.clone())
                    .or_insert_with(|| spawn_worker(core.clone(), connection_id));
            }
            TransportEvent::Message { connection_id, payload } => {
                let worker = workers
                    .entry(connection_id.clone())
                    .or_insert_with(|| spawn_worker(core.clone(), connection_id.clone()));
                if worker.send(WorkItem::Payload(payload)).is_err() {
                    warn!(connection_id = %connection_id, "Connection worker gone, message dropped");
                }
            }
            TransportEvent::Disconnected { connection_id } => {
                if let Some(worker) = workers.remove(&connection_id) {
                    let _ = worker.send(WorkItem::Closed);
                } else {
                    core.close(&connection_id).await;
                }
            }
        }
    }

    for (_, worker) in workers.drain() {
        let _ = worker.send(WorkItem::Closed);
    }
    debug!("Transport event stream ended");
}

fn spawn_worker(core: Arc<DispatcherCore>, connection_id: String) -> mpsc::UnboundedSender<WorkItem> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                WorkItem::Payload(payload) => core.dispatch(&connection_id, payload).await,
                WorkItem::Closed => break,
            }
        }
        core.close(&connection_id).await;
    });
    tx
}
