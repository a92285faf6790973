//! # Wire Messages
//!
//! Envelope: `{ "type": "...", ...payload }` with camelCase payload fields.
//!
//! ## Parsing:
//! - Text frames are decoded as JSON
//! - Already-structured payloads (from in-process transports) pass through
//! - A `data` field holding an encoded JSON object is decoded transparently
//! - Binary frames are raw teacher audio
//!
//! Every inbound payload is validated into the closed [`InboundMessage`] enum
//! before a handler sees it.

use crate::audio::{decode_audio_payload, DecodeError};
use crate::delivery::ListenerSettings;
use crate::realtime::signaling::SignalingSnapshot;
use crate::realtime::transport::RawPayload;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    #[default]
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Message types a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Audio,
    Translate,
    TtsRequest,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIceCandidate,
    WebrtcSync,
    Ping,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Register,
        MessageKind::Audio,
        MessageKind::Translate,
        MessageKind::TtsRequest,
        MessageKind::WebrtcOffer,
        MessageKind::WebrtcAnswer,
        MessageKind::WebrtcIceCandidate,
        MessageKind::WebrtcSync,
        MessageKind::Ping,
        MessageKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Audio => "audio",
            MessageKind::Translate => "translate",
            MessageKind::TtsRequest => "tts_request",
            MessageKind::WebrtcOffer => "webrtc_offer",
            MessageKind::WebrtcAnswer => "webrtc_answer",
            MessageKind::WebrtcIceCandidate => "webrtc_ice_candidate",
            MessageKind::WebrtcSync => "webrtc_sync",
            MessageKind::Ping => "ping",
            MessageKind::Error => "error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio bytes as they arrived: base64 text or a raw binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    Encoded(String),
    Raw(Vec<u8>),
}

impl<'de> Deserialize<'de> for AudioPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(AudioPayload::Encoded)
    }
}

impl AudioPayload {
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        match self {
            AudioPayload::Encoded(text) => decode_audio_payload(text),
            AudioPayload::Raw(bytes) if bytes.is_empty() => Err(DecodeError::Empty),
            AudioPayload::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        role: Role,
        language_code: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        settings: ListenerSettings,
    },
    #[serde(rename_all = "camelCase")]
    Audio {
        data: AudioPayload,
        #[serde(default)]
        is_first_chunk: bool,
        #[serde(default)]
        is_final_chunk: bool,
        #[serde(default)]
        language: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Translate {
        text: String,
        target_language: String,
        #[serde(default)]
        source_language: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TtsRequest {
        text: String,
        language_code: String,
        #[serde(default)]
        tier: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        #[serde(default)]
        session_id: Option<String>,
        sdp: Value,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        #[serde(default)]
        session_id: Option<String>,
        sdp: Value,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        #[serde(default)]
        session_id: Option<String>,
        candidate: Value,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcSync {
        #[serde(default)]
        session_id: Option<String>,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::Register { .. } => MessageKind::Register,
            InboundMessage::Audio { .. } => MessageKind::Audio,
            InboundMessage::Translate { .. } => MessageKind::Translate,
            InboundMessage::TtsRequest { .. } => MessageKind::TtsRequest,
            InboundMessage::WebrtcOffer { .. } => MessageKind::WebrtcOffer,
            InboundMessage::WebrtcAnswer { .. } => MessageKind::WebrtcAnswer,
            InboundMessage::WebrtcIceCandidate { .. } => MessageKind::WebrtcIceCandidate,
            InboundMessage::WebrtcSync { .. } => MessageKind::WebrtcSync,
            InboundMessage::Ping { .. } => MessageKind::Ping,
            InboundMessage::Error { .. } => MessageKind::Error,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("message must be a JSON object")]
    NotAnObject,
    #[error("message has no type")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} message: {reason}")]
    InvalidPayload { kind: MessageKind, reason: String },
}

/// Parse one transport payload into a validated message.
pub fn parse_inbound(payload: RawPayload) -> Result<InboundMessage, ParseError> {
    let value = match payload {
        RawPayload::Binary(bytes) => {
            return Ok(InboundMessage::Audio {
                data: AudioPayload::Raw(bytes),
                is_first_chunk: false,
                is_final_chunk: false,
                language: None,
            });
        }
        RawPayload::Text(text) => serde_json::from_str::<Value>(&text)
            .map_err(|err| ParseError::InvalidJson(err.to_string()))?,
        RawPayload::Structured(value) => value,
    };

    let value = unwrap_encoded_data(value)?;
    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingType)?;
    let kind =
        MessageKind::parse(type_name).ok_or_else(|| ParseError::UnknownType(type_name.to_string()))?;

    serde_json::from_value(value).map_err(|err| ParseError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}

/// Decode a `data` field that carries a JSON object as a string.
///
/// Without an outer `type` the decoded object is the message itself;
/// otherwise it replaces the `data` field. Any other string is left alone
/// (base64 audio, for instance).
fn unwrap_encoded_data(value: Value) -> Result<Value, ParseError> {
    let Value::Object(mut outer) = value else {
        return Err(ParseError::NotAnObject);
    };

    let decoded = match outer.get("data") {
        Some(Value::String(encoded)) if encoded.trim_start().starts_with('{') => {
            serde_json::from_str::<Value>(encoded).ok().filter(Value::is_object)
        }
        _ => None,
    };

    match decoded {
        Some(inner) if !outer.contains_key("type") => Ok(inner),
        Some(inner) => {
            outer.insert("data".to_string(), inner);
            Ok(Value::Object(outer))
        }
        None => Ok(Value::Object(outer)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        connection_id: String,
        role: Role,
        language_code: String,
        session_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Transcription {
        session_id: String,
        text: String,
        source_language: String,
        is_final: bool,
    },
    #[serde(rename_all = "camelCase")]
    Translation {
        text: String,
        target_language: String,
        source_language: String,
        original_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_data: Option<String>,
        use_client_speech: bool,
        degraded: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TtsResponse {
        audio_buffer: String,
        language_code: String,
        provider: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        session_id: String,
        from: String,
        sdp: Value,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        session_id: String,
        from: String,
        sdp: Value,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        session_id: String,
        from: String,
        candidate: Value,
    },
    #[serde(rename_all = "camelCase")]
    WebrtcSync {
        session_id: String,
        state: SignalingSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    Pong {
        timestamp: Option<Value>,
        server_time: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        session_id: String,
        reason: String,
    },
    Error {
        message: String,
    },
}
