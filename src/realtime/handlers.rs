//! # Relay Message Handlers
//!
//! Handler implementations for every inbound message type, plus the
//! connection and session hooks that keep the lifecycle manager in step with
//! who is connected.
//!
//! ## Message Flow:
//! 1. **register**: teacher creates/resumes a session, student joins one
//! 2. **audio**: teacher fragments feed the ingestion buffer; a flush is queued
//!    on the session's round worker, which transcribes it, broadcasts the
//!    `transcription` and fans it out per language
//! 3. **translate** / **tts_request**: on-demand single operations
//! 4. **webrtc_***: remembered per session and relayed to the other members
//! 5. **ping**: `pong` with the server time
//! 6. **error**: reported back to the originating connection
//!
//! Every activity-bearing event refreshes the session's activity clock.

use crate::audio::{AudioIngestionBuffer, IngestOutcome};
use crate::delivery::{
    shape_for_listener, BroadcastDeliveryEngine, RoundScheduler, TermGlossary, Utterance,
};
use crate::pipeline::TieredFallbackPipeline;
use crate::realtime::dispatcher::{
    ConnectionObserver, MessageContext, MessageHandler, MessageSender, RealtimeDispatcher,
};
use crate::realtime::messages::{InboundMessage, MessageKind, OutboundMessage, Role};
use crate::realtime::registry::{ConnectionEntry, ConnectionRegistry, Registration};
use crate::realtime::signaling::SignalingStore;
use crate::session::lifecycle::SessionEndNotifier;
use crate::session::{Session, SessionLifecycleManager};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Language assumed when neither the message nor the registration names one.
pub const DEFAULT_SOURCE_LANGUAGE: &str = "en";

/// Everything the handlers share.
#[derive(Clone)]
pub struct RelayServices {
    pub registry: Arc<ConnectionRegistry>,
    pub sender: Arc<dyn MessageSender>,
    pub lifecycle: Arc<SessionLifecycleManager>,
    pub pipeline: Arc<TieredFallbackPipeline>,
    pub delivery: Arc<BroadcastDeliveryEngine>,
    pub audio: Arc<AudioIngestionBuffer>,
    pub rounds: Arc<RoundScheduler>,
    pub signaling: Arc<SignalingStore>,
    pub glossary: Arc<TermGlossary>,
}

/// Register every handler and hook on the dispatcher.
pub fn install(dispatcher: &RealtimeDispatcher, services: &RelayServices) {
    let signaling: Arc<dyn MessageHandler> = Arc::new(SignalingHandler(services.clone()));

    dispatcher.register_handler(MessageKind::Register, Arc::new(RegisterHandler(services.clone())));
    dispatcher.register_handler(MessageKind::Audio, Arc::new(AudioHandler(services.clone())));
    dispatcher.register_handler(MessageKind::Translate, Arc::new(TranslateHandler(services.clone())));
    dispatcher.register_handler(MessageKind::TtsRequest, Arc::new(TtsRequestHandler(services.clone())));
    for kind in [
        MessageKind::WebrtcOffer,
        MessageKind::WebrtcAnswer,
        MessageKind::WebrtcIceCandidate,
        MessageKind::WebrtcSync,
    ] {
        dispatcher.register_handler(kind, signaling.clone());
    }
    dispatcher.register_handler(MessageKind::Ping, Arc::new(PingHandler(services.clone())));
    dispatcher.register_handler(MessageKind::Error, Arc::new(ErrorHandler(services.clone())));

    dispatcher.add_observer(Arc::new(SessionPresenceObserver(services.clone())));
    services
        .lifecycle
        .set_end_notifier(Arc::new(SessionEndBroadcaster(services.clone())));
}

pub struct RegisterHandler(RelayServices);

impl RegisterHandler {
    async fn register_teacher(
        &self,
        ctx: &MessageContext,
        language_code: &str,
        requested: Option<String>,
        registration: Registration,
    ) -> Result<Session> {
        let services = &self.0;
        let previous = services.registry.get(&ctx.connection_id).await;

        // A teacher re-registering without an id keeps its current session
        let requested = requested.or_else(|| {
            previous
                .as_ref()
                .filter(|p| p.role == Role::Teacher)
                .and_then(|p| p.session_id.clone())
        });

        let session = services
            .lifecycle
            .register_teacher(language_code, requested.as_deref(), Utc::now())
            .await?;

        let previous = services
            .registry
            .register(
                &ctx.connection_id,
                Registration {
                    session_id: Some(session.session_id.clone()),
                    ..registration
                },
            )
            .await;
        self.leave_previous_as_student(previous, &session.session_id).await;
        Ok(session)
    }

    async fn register_student(
        &self,
        ctx: &MessageContext,
        language_code: &str,
        requested: Option<String>,
        registration: Registration,
    ) -> Result<Option<Session>> {
        let services = &self.0;
        let Some(session) = self.resolve_student_session(requested.as_deref()).await? else {
            let previous = services.registry.register(&ctx.connection_id, registration).await;
            self.leave_previous_as_student(previous, "").await;
            warn!(connection_id = %ctx.connection_id, "Student registered with no active session");
            return Ok(None);
        };

        let previous = services
            .registry
            .register(
                &ctx.connection_id,
                Registration {
                    session_id: Some(session.session_id.clone()),
                    ..registration
                },
            )
            .await;

        let already_counted = previous.as_ref().map_or(false, |p| {
            p.role == Role::Student && p.session_id.as_deref() == Some(session.session_id.as_str())
        });
        if already_counted {
            services
                .lifecycle
                .update_session_activity(&session.session_id, Utc::now())
                .await?;
            return Ok(Some(session));
        }

        self.leave_previous_as_student(previous, &session.session_id).await;
        let session = services
            .lifecycle
            .student_joined(&session.session_id, language_code, Utc::now())
            .await?;
        Ok(Some(session))
    }

    /// The requested session if it is active, otherwise the newest active one.
    async fn resolve_student_session(&self, requested: Option<&str>) -> Result<Option<Session>> {
        let store = self.0.lifecycle.store();
        if let Some(id) = requested {
            if let Some(session) = store.get(id).await?.filter(|s| s.is_active) {
                return Ok(Some(session));
            }
            debug!(session_id = %id, "Requested session is not active, using the latest");
        }
        Ok(store
            .active()
            .await?
            .into_iter()
            .max_by_key(|s| s.start_time))
    }

    async fn leave_previous_as_student(&self, previous: Option<ConnectionEntry>, joined: &str) {
        let Some(previous) = previous else {
            return;
        };
        match (previous.role, previous.session_id) {
            (Role::Student, Some(old)) if old != joined => {
                if let Err(err) = self.0.lifecycle.student_left(&old, Utc::now()).await {
                    warn!(session_id = %old, error = %err, "Failed to record student leaving");
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl MessageHandler for RegisterHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let InboundMessage::Register { role, language_code, session_id, settings } = message else {
            bail!("unexpected message for the register handler");
        };
        let language_code = language_code.trim().to_string();
        if language_code.is_empty() {
            bail!("languageCode is required");
        }

        let registration = Registration {
            role,
            language_code: language_code.clone(),
            session_id: None,
            settings,
        };
        let session_id = match role {
            Role::Teacher => Some(
                self.register_teacher(&ctx, &language_code, session_id, registration)
                    .await?
                    .session_id,
            ),
            Role::Student => self
                .register_student(&ctx, &language_code, session_id, registration)
                .await?
                .map(|s| s.session_id),
            Role::Unknown => bail!("role must be teacher or student"),
        };

        info!(
            connection_id = %ctx.connection_id,
            role = %role,
            language = %language_code,
            session_id = ?session_id,
            "Connection registered"
        );

        self.0
            .sender
            .send(
                &ctx.connection_id,
                &OutboundMessage::Registered {
                    connection_id: ctx.connection_id.clone(),
                    role,
                    language_code,
                    session_id,
                },
            )
            .await?;
        Ok(())
    }
}

pub struct AudioHandler(RelayServices);

#[async_trait]
impl MessageHandler for AudioHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let InboundMessage::Audio { data, is_first_chunk, is_final_chunk, language } = message else {
            bail!("unexpected message for the audio handler");
        };
        if ctx.role != Role::Teacher {
            bail!("only a registered teacher may send audio");
        }
        let session_id = ctx
            .session_id
            .clone()
            .ok_or_else(|| anyhow!("teacher has no active session"))?;

        let bytes = data.decode()?;
        let source_language = language
            .or(ctx.language_code.clone())
            .unwrap_or_else(|| DEFAULT_SOURCE_LANGUAGE.to_string());

        if is_first_chunk {
            let dropped = self.0.audio.start_recording(&ctx.connection_id);
            if dropped > 0 {
                debug!(connection_id = %ctx.connection_id, dropped, "New recording, dropped leftover chunks");
            }
        }

        let outcome = self
            .0
            .audio
            .push(&ctx.connection_id, bytes, is_final_chunk, Instant::now());

        if let Err(err) = self
            .0
            .lifecycle
            .update_session_activity(&session_id, Utc::now())
            .await
        {
            warn!(session_id = %session_id, error = %err, "Failed to refresh session activity");
        }

        match outcome {
            IngestOutcome::Buffered { chunks, total_bytes } => {
                debug!(connection_id = %ctx.connection_id, chunks, total_bytes, "Audio buffered");
                Ok(())
            }
            IngestOutcome::Rejected(_) => Ok(()),
            IngestOutcome::Flushed(flushed) => {
                self.0.rounds.submit(Utterance {
                    session_id,
                    source_language,
                    audio: flushed.bytes,
                });
                Ok(())
            }
        }
    }
}

pub struct TranslateHandler(RelayServices);

#[async_trait]
impl MessageHandler for TranslateHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let InboundMessage::Translate { text, target_language, source_language } = message else {
            bail!("unexpected message for the translate handler");
        };
        let services = &self.0;
        let source_language = source_language
            .or(ctx.language_code.clone())
            .unwrap_or_else(|| DEFAULT_SOURCE_LANGUAGE.to_string());
        let settings = services
            .registry
            .get(&ctx.connection_id)
            .await
            .map(|entry| entry.settings)
            .unwrap_or_default();

        let reply = match services
            .pipeline
            .translate(&text, &source_language, &target_language)
            .await
        {
            Ok(output) => OutboundMessage::Translation {
                text: shape_for_listener(&output.value, &target_language, &settings, &services.glossary),
                target_language,
                source_language,
                original_text: text,
                audio_data: None,
                use_client_speech: settings.use_client_speech,
                degraded: false,
                error: None,
            },
            Err(err) => {
                warn!(connection_id = %ctx.connection_id, error = %err, "On-demand translation failed");
                OutboundMessage::Translation {
                    text: text.clone(),
                    target_language,
                    source_language,
                    original_text: text,
                    audio_data: None,
                    use_client_speech: settings.use_client_speech,
                    degraded: true,
                    error: Some(err.to_string()),
                }
            }
        };

        services.sender.send(&ctx.connection_id, &reply).await?;
        Ok(())
    }
}

pub struct TtsRequestHandler(RelayServices);

#[async_trait]
impl MessageHandler for TtsRequestHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let InboundMessage::TtsRequest { text, language_code, tier } = message else {
            bail!("unexpected message for the tts_request handler");
        };
        if text.trim().is_empty() {
            bail!("text is required");
        }

        let sequence: Vec<String> = tier.into_iter().collect();
        let speech = self.0.pipeline.synthesize(&text, &language_code, &sequence).await;

        self.0
            .sender
            .send(
                &ctx.connection_id,
                &OutboundMessage::TtsResponse {
                    audio_buffer: STANDARD.encode(&speech.value),
                    language_code,
                    provider: speech.timing.provider,
                },
            )
            .await?;
        Ok(())
    }
}

/// Remembers and relays WebRTC negotiation within a session.
pub struct SignalingHandler(RelayServices);

impl SignalingHandler {
    async fn relay(&self, ctx: &MessageContext, session_id: &str, message: OutboundMessage) {
        for member in self.0.registry.in_session(session_id).await {
            if member.connection_id == ctx.connection_id {
                continue;
            }
            if let Err(err) = self.0.sender.send(&member.connection_id, &message).await {
                warn!(
                    session_id = %session_id,
                    connection_id = %member.connection_id,
                    error = %err,
                    "Signaling relay failed"
                );
            }
        }
    }
}

#[async_trait]
impl MessageHandler for SignalingHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let signaling = &self.0.signaling;
        let from = ctx.connection_id.clone();
        let resolve = |requested: Option<String>| -> Result<String> {
            requested
                .or_else(|| ctx.session_id.clone())
                .ok_or_else(|| anyhow!("signaling requires a sessionId"))
        };

        match message {
            InboundMessage::WebrtcOffer { session_id, sdp } => {
                let session_id = resolve(session_id)?;
                signaling.record_offer(&session_id, &from, sdp.clone());
                let relayed = OutboundMessage::WebrtcOffer { session_id: session_id.clone(), from, sdp };
                self.relay(&ctx, &session_id, relayed).await;
            }
            InboundMessage::WebrtcAnswer { session_id, sdp } => {
                let session_id = resolve(session_id)?;
                signaling.record_answer(&session_id, &from, sdp.clone());
                let relayed = OutboundMessage::WebrtcAnswer { session_id: session_id.clone(), from, sdp };
                self.relay(&ctx, &session_id, relayed).await;
            }
            InboundMessage::WebrtcIceCandidate { session_id, candidate } => {
                let session_id = resolve(session_id)?;
                signaling.record_ice_candidate(&session_id, &from, candidate.clone());
                let relayed = OutboundMessage::WebrtcIceCandidate {
                    session_id: session_id.clone(),
                    from,
                    candidate,
                };
                self.relay(&ctx, &session_id, relayed).await;
            }
            InboundMessage::WebrtcSync { session_id } => {
                let session_id = resolve(session_id)?;
                let state = signaling.snapshot(&session_id);
                self.0
                    .sender
                    .send(&ctx.connection_id, &OutboundMessage::WebrtcSync { session_id, state })
                    .await?;
            }
            other => bail!("signaling handler received {}", other.kind()),
        }
        Ok(())
    }
}

pub struct PingHandler(RelayServices);

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let timestamp: Option<Value> = match message {
            InboundMessage::Ping { timestamp } => timestamp,
            other => bail!("ping handler received {}", other.kind()),
        };
        self.0
            .sender
            .send(
                &ctx.connection_id,
                &OutboundMessage::Pong {
                    timestamp,
                    server_time: Utc::now().to_rfc3339(),
                },
            )
            .await?;
        Ok(())
    }
}

/// Reports malformed input and handler failures back to the sender.
pub struct ErrorHandler(RelayServices);

#[async_trait]
impl MessageHandler for ErrorHandler {
    async fn handle(&self, ctx: MessageContext, message: InboundMessage) -> Result<()> {
        let InboundMessage::Error { message } = message else {
            bail!("unexpected message for the error handler");
        };
        warn!(connection_id = %ctx.connection_id, error = %message, "Reporting error to client");
        if let Err(err) = self
            .0
            .sender
            .send(&ctx.connection_id, &OutboundMessage::Error { message })
            .await
        {
            debug!(connection_id = %ctx.connection_id, error = %err, "Error report not delivered");
        }
        Ok(())
    }
}

/// Keeps student counts and audio buffers in step with disconnects.
pub struct SessionPresenceObserver(RelayServices);

#[async_trait]
impl ConnectionObserver for SessionPresenceObserver {
    async fn connection_closed(&self, entry: &ConnectionEntry) {
        match (entry.role, entry.session_id.as_deref()) {
            (Role::Student, Some(session_id)) => {
                if let Err(err) = self.0.lifecycle.student_left(session_id, Utc::now()).await {
                    warn!(session_id = %session_id, error = %err, "Failed to record student leaving");
                }
            }
            (Role::Teacher, _) => self.0.audio.discard(&entry.connection_id),
            _ => {}
        }
    }
}

/// Tells a session's members it ended and detaches them from it.
pub struct SessionEndBroadcaster(RelayServices);

#[async_trait]
impl SessionEndNotifier for SessionEndBroadcaster {
    async fn session_ended(&self, session_id: &str, reason: &str) {
        let outcome = self
            .0
            .sender
            .broadcast_to_session(
                session_id,
                &OutboundMessage::SessionEnded {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await;
        let detached = self.0.registry.clear_session(session_id).await;
        self.0.signaling.clear(session_id);
        self.0.rounds.close(session_id);
        debug!(
            session_id = %session_id,
            notified = outcome.sent,
            detached,
            "Session members released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::InputScreen;
    use crate::config::AppConfig;
    use crate::pipeline::error::SttError;
    use crate::pipeline::tiered::tests::{policy, FlakySpeech, TaggingTranslator};
    use crate::pipeline::{ProviderTiers, SpeechToText, TextToSpeech, Translator};
    use crate::realtime::transport::tests::MemoryTransport;
    use crate::session::{InMemorySessionStore, SessionState};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct FixedStt(&'static str);

    #[async_trait]
    impl SpeechToText for FixedStt {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn transcribe(&self, _audio: &[u8], _language: &str) -> Result<String, SttError> {
            Ok(self.0.to_string())
        }
    }

    struct Relay {
        transport: Arc<MemoryTransport>,
        dispatcher: RealtimeDispatcher,
        services: RelayServices,
        translator: Arc<TaggingTranslator>,
    }

    fn relay_with(translator: TaggingTranslator) -> Relay {
        let config = AppConfig::default();
        let transport = Arc::new(MemoryTransport::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = RealtimeDispatcher::new(transport.clone(), registry.clone());
        let sender = dispatcher.message_sender();

        let translator = Arc::new(translator);
        let stt: Arc<dyn SpeechToText> = Arc::new(FixedStt("good morning class"));
        let tts: Arc<dyn TextToSpeech> = Arc::new(FlakySpeech::new("openai", 0));
        let pipeline = Arc::new(TieredFallbackPipeline::with_collaborators(
            ProviderTiers::new(vec![("fixed".to_string(), stt)]),
            ProviderTiers::new(vec![(
                "premium".to_string(),
                translator.clone() as Arc<dyn Translator>,
            )]),
            ProviderTiers::new(vec![("openai".to_string(), tts)]),
            policy(),
        ));

        let lifecycle = Arc::new(SessionLifecycleManager::new(
            Arc::new(InMemorySessionStore::new()),
            &config.lifecycle,
        ));
        let glossary = Arc::new(TermGlossary::new());
        let mut delivery_config = config.delivery.clone();
        delivery_config.send_retry_backoff_ms = 0;
        let delivery = Arc::new(
            BroadcastDeliveryEngine::new(pipeline.clone(), registry.clone(), sender.clone(), &delivery_config)
                .with_glossary(glossary.clone())
                .with_lifecycle(lifecycle.clone()),
        );

        let services = RelayServices {
            rounds: Arc::new(RoundScheduler::new(pipeline.clone(), sender.clone(), delivery.clone())),
            registry,
            sender,
            lifecycle,
            pipeline,
            delivery,
            audio: Arc::new(AudioIngestionBuffer::with_screen(&config.audio, InputScreen::disabled())),
            signaling: Arc::new(SignalingStore::new()),
            glossary,
        };
        install(&dispatcher, &services);
        dispatcher.start().unwrap();

        Relay { transport, dispatcher, services, translator }
    }

    fn relay() -> Relay {
        relay_with(TaggingTranslator::new("premium"))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    impl Relay {
        async fn register(&self, id: &str, role: &str, language: &str) -> Option<String> {
            self.transport.connect(id);
            self.transport.text(
                id,
                json!({ "type": "register", "role": role, "languageCode": language }),
            );
            settle().await;
            let acks = self.transport.sent_of_type(id, "registered");
            acks.last().and_then(|ack| ack["sessionId"].as_str().map(str::to_string))
        }

        async fn session(&self, id: &str) -> Session {
            self.services.lifecycle.store().get(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_teacher_audio_reaches_every_language_group() {
        let relay = relay();
        let session_id = relay.register("teacher", "teacher", "en").await.unwrap();
        for (id, lang) in [("s1", "es"), ("s2", "es"), ("s3", "fr")] {
            assert_eq!(relay.register(id, "student", lang).await.as_deref(), Some(session_id.as_str()));
        }

        let chunk: Vec<u8> = (0..40_000u32).map(|i| (i * 7 % 251) as u8).collect();
        relay.transport.text(
            "teacher",
            json!({ "type": "audio", "data": STANDARD.encode(&chunk), "isFirstChunk": true }),
        );
        settle().await;

        assert_eq!(relay.translator.calls.load(Ordering::SeqCst), 2);
        let transcription = relay.transport.sent_of_type("s1", "transcription");
        assert_eq!(transcription[0]["text"], "good morning class");

        let translation = relay.transport.sent_of_type("s3", "translation");
        assert_eq!(translation.len(), 1);
        assert_eq!(translation[0]["text"], "[fr] good morning class");
        assert!(translation[0]["audioData"].is_string());
        assert_eq!(relay.session(&session_id).await.total_translations, 3);
        assert_eq!(relay.services.rounds.snapshot().active_sessions, 1);

        relay
            .services
            .lifecycle
            .end_session(&session_id, "class over", Utc::now())
            .await
            .unwrap();
        assert_eq!(relay.services.rounds.snapshot().active_sessions, 0);
    }

    #[tokio::test]
    async fn test_small_chunks_buffer_until_threshold() {
        let relay = relay();
        relay.register("teacher", "teacher", "en").await.unwrap();
        relay.register("s1", "student", "es").await;

        let chunk: Vec<u8> = (0..2_000u32).map(|i| (i * 13 % 241) as u8).collect();
        for _ in 0..3 {
            relay.transport.text("teacher", json!({ "type": "audio", "data": STANDARD.encode(&chunk) }));
        }
        settle().await;

        // 3 x (2000 + 44) crosses the 5000 byte threshold once
        assert_eq!(relay.translator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(relay.transport.sent_of_type("s1", "translation").len(), 1);
    }

    #[tokio::test]
    async fn test_first_chunk_starts_a_new_recording() {
        let relay = relay();
        relay.register("teacher", "teacher", "en").await.unwrap();
        relay.register("s1", "student", "es").await;

        let chunk: Vec<u8> = (0..2_000u32).map(|i| (i * 13 % 241) as u8).collect();
        relay.transport.text("teacher", json!({ "type": "audio", "data": STANDARD.encode(&chunk) }));
        relay.transport.text(
            "teacher",
            json!({ "type": "audio", "data": STANDARD.encode(&chunk), "isFirstChunk": true }),
        );
        relay.transport.text("teacher", json!({ "type": "audio", "data": STANDARD.encode(&chunk) }));
        settle().await;

        // the leftover chunk was dropped, 2 x 2044 stays under the threshold
        assert_eq!(relay.services.audio.buffered_chunks("teacher"), 2);
        assert_eq!(relay.translator.calls.load(Ordering::SeqCst), 0);
        assert!(relay.transport.sent_of_type("s1", "transcription").is_empty());
    }

    #[tokio::test]
    async fn test_student_audio_is_rejected_with_error() {
        let relay = relay();
        relay.register("teacher", "teacher", "en").await;
        relay.register("s1", "student", "es").await;

        relay.transport.text("s1", json!({ "type": "audio", "data": STANDARD.encode([1u8; 64]) }));
        relay.transport.text("s1", json!({ "type": "audio" }));
        settle().await;

        let errors = relay.transport.sent_of_type("s1", "error");
        assert_eq!(errors.len(), 2);
        assert!(errors[0]["message"].as_str().unwrap().contains("teacher"));
    }

    #[tokio::test]
    async fn test_student_presence_drives_grace_period() {
        let relay = relay();
        let session_id = relay.register("teacher", "teacher", "en").await.unwrap();
        relay.register("s1", "student", "es").await;
        // re-registering in the same session is not a second student
        relay.register("s1", "student", "fr").await;
        assert_eq!(relay.session(&session_id).await.students_count, 1);

        relay.transport.disconnect("s1");
        settle().await;
        let session = relay.session(&session_id).await;
        assert_eq!(session.students_count, 0);
        assert_eq!(session.state(), SessionState::GracePeriod);

        relay.register("s2", "student", "es").await;
        assert_eq!(relay.session(&session_id).await.state(), SessionState::ActiveWithStudents);
    }

    #[tokio::test]
    async fn test_teacher_reconnect_supersedes_and_notifies() {
        let relay = relay();
        let first = relay.register("teacher-a", "teacher", "en").await.unwrap();
        relay.register("s1", "student", "es").await;

        let second = relay.register("teacher-b", "teacher", "en").await.unwrap();
        assert_ne!(first, second);

        let ended = relay.transport.sent_of_type("s1", "session_ended");
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0]["reason"], "superseded");
        assert!(!relay.session(&first).await.is_active);
        assert_eq!(relay.services.registry.get("s1").await.unwrap().session_id, None);
    }

    #[tokio::test]
    async fn test_on_demand_translate_degrades_on_failure() {
        let relay = relay_with(TaggingTranslator::failing_for("premium", vec!["de"]));
        relay.transport.connect("c1");
        relay.transport.text("c1", json!({ "type": "translate", "text": "Hello", "targetLanguage": "es" }));
        relay.transport.text("c1", json!({ "type": "translate", "text": "Hello", "targetLanguage": "de" }));
        relay.transport.text("c1", json!({ "type": "translate", "text": "Hello", "targetLanguage": "EN" }));
        relay.transport.text("c1", json!({ "type": "translate", "text": "Hello", "targetLanguage": "en-GB" }));
        settle().await;

        let replies = relay.transport.sent_of_type("c1", "translation");
        assert_eq!(replies[0]["text"], "[es] Hello");
        assert_eq!(replies[1]["text"], "Hello");
        assert_eq!(replies[1]["degraded"], true);
        assert!(replies[1]["error"].is_string());
        assert_eq!(replies[2]["text"], "Hello");
        assert_eq!(replies[2]["degraded"], false);
        assert_eq!(replies[3]["text"], "[en-GB] Hello");
    }

    #[tokio::test]
    async fn test_tts_request_and_ping() {
        let relay = relay();
        relay.transport.connect("c1");
        relay.transport.text("c1", json!({ "type": "tts_request", "text": "Hola", "languageCode": "es" }));
        relay.transport.text("c1", json!({ "type": "ping", "timestamp": 7 }));
        settle().await;

        let tts = relay.transport.sent_of_type("c1", "tts_response");
        assert_eq!(tts[0]["audioBuffer"], STANDARD.encode("Hola"));
        assert_eq!(tts[0]["provider"], "openai");

        let pong = relay.transport.sent_of_type("c1", "pong");
        assert_eq!(pong[0]["timestamp"], 7);
        assert!(pong[0]["serverTime"].is_string());
    }

    #[tokio::test]
    async fn test_signaling_is_relayed_and_synced() {
        let relay = relay();
        let session_id = relay.register("teacher", "teacher", "en").await.unwrap();
        relay.register("s1", "student", "es").await;

        relay.transport.text("teacher", json!({ "type": "webrtc_offer", "sdp": { "sdp": "v=0" } }));
        relay.transport.text("s1", json!({ "type": "webrtc_answer", "sdp": "answer" }));
        settle().await;

        let offers = relay.transport.sent_of_type("s1", "webrtc_offer");
        assert_eq!(offers[0]["from"], "teacher");
        assert!(relay.transport.sent_of_type("teacher", "webrtc_offer").is_empty());
        assert_eq!(relay.transport.sent_of_type("teacher", "webrtc_answer").len(), 1);

        relay.register("late", "student", "fr").await;
        relay
            .transport
            .text("late", json!({ "type": "webrtc_sync", "sessionId": session_id }));
        settle().await;
        let sync = relay.transport.sent_of_type("late", "webrtc_sync");
        assert_eq!(sync[0]["state"]["offer"]["from"], "teacher");
        assert_eq!(sync[0]["state"]["answers"].as_array().unwrap().len(), 1);

        relay.dispatcher.stop();
    }
}
