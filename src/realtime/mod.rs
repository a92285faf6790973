//! # Realtime Messaging
//!
//! Transport-agnostic routing of the relay's JSON envelopes.
//!
//! ## Key Components:
//! - **Transport**: capability trait and event stream; WebSocket is the shipped transport
//! - **Messages**: closed inbound/outbound envelope types and parsing
//! - **Dispatcher**: per-connection ordered routing to handlers, plus the outward sender
//! - **Registry**: best-known role, language and session per connection
//! - **Handlers**: the relay behaviour for each message type
//! - **Signaling**: remembered WebRTC negotiation per session

pub mod dispatcher;
pub mod handlers;
pub mod messages;
pub mod registry;
pub mod signaling;
pub mod transport;
pub mod websocket;

pub use dispatcher::{MessageSender, RealtimeDispatcher};
pub use handlers::RelayServices;
pub use registry::ConnectionRegistry;
pub use signaling::SignalingStore;
pub use transport::Transport;
pub use websocket::{websocket_endpoint, WebSocketTransport};
