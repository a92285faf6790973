//! # WebSocket Transport
//!
//! The shipped [`Transport`]: one actix actor per client connection.
//!
//! ## Connection Protocol:
//! 1. **Handshake**: `GET /ws`, already admitted by the connection gate
//! 2. **Attach**: the actor registers its mailbox and a `Connected` event is emitted
//! 3. **Frames**: text frames carry JSON envelopes; binary frames carry raw
//!    teacher audio. Both are forwarded untouched as `Message` events
//! 4. **Outbound**: the dispatcher's sends arrive as [`OutboundFrame`]s
//! 5. **Heartbeat**: WebSocket pings every 30s, closed after 60s of silence
//! 6. **Detach**: a `Disconnected` event once the actor stops

use crate::realtime::transport::{EventHub, RawPayload, Transport, TransportError, TransportEvent};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Serialized envelope to write to one client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundFrame(pub String);

/// Open WebSocket connections keyed by connection id.
#[derive(Default)]
pub struct WebSocketTransport {
    hub: EventHub,
    connections: RwLock<HashMap<String, Recipient<OutboundFrame>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, connection_id: &str, mailbox: Recipient<OutboundFrame>, peer: Option<String>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id.to_string(), mailbox);
        self.hub.emit(TransportEvent::Connected {
            connection_id: connection_id.to_string(),
            peer,
        });
    }

    pub fn detach(&self, connection_id: &str) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id);
        if removed.is_some() {
            self.hub.emit(TransportEvent::Disconnected {
                connection_id: connection_id.to_string(),
            });
        }
    }

    pub fn forward(&self, connection_id: &str, payload: RawPayload) {
        self.hub.emit(TransportEvent::Message {
            connection_id: connection_id.to_string(),
            payload,
        });
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.hub.subscribe()
    }

    fn unsubscribe(&self) {
        self.hub.unsubscribe();
    }

    async fn send(&self, connection_id: &str, text: String) -> Result<(), TransportError> {
        let mailbox = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownConnection(connection_id.to_string()))?;

        mailbox
            .try_send(OutboundFrame(text))
            .map_err(|_| TransportError::Closed(connection_id.to_string()))
    }
}

/// Actor owning one client WebSocket.
pub struct ClientConnection {
    connection_id: String,
    peer: Option<String>,
    transport: Arc<WebSocketTransport>,
    last_heartbeat: Instant,
}

impl ClientConnection {
    pub fn new(connection_id: String, peer: Option<String>, transport: Arc<WebSocketTransport>) -> Self {
        Self {
            connection_id,
            peer,
            transport,
            last_heartbeat: Instant::now(),
        }
    }
}

impl Actor for ClientConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, peer = ?self.peer, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        self.transport
            .attach(&self.connection_id, ctx.address().recipient(), self.peer.clone());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
        self.transport.detach(&self.connection_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientConnection {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.transport
                    .forward(&self.connection_id, RawPayload::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.transport
                    .forward(&self.connection_id, RawPayload::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, reason = ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Continuation frames are not supported");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundFrame> for ClientConnection {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint: upgrades the request and starts a [`ClientConnection`].
pub async fn websocket_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req
        .connection_info()
        .realip_remote_addr()
        .map(str::to_string);
    let connection_id = Uuid::new_v4().to_string();
    debug!(connection_id = %connection_id, peer = ?peer, "WebSocket upgrade requested");

    ws::start(
        ClientConnection::new(connection_id, peer, app_state.transport.clone()),
        &req,
        stream,
    )
}
