//! # Application State
//!
//! Shared handles for the HTTP handlers and the realtime relay. Every field is
//! an `Arc`, so cloning the state per actix worker is cheap and all workers see
//! the same sessions, connections and counters.
//!
//! ## Components:
//! - **config**: runtime-tunable configuration behind `Arc<RwLock<_>>`
//! - **transport**: open WebSocket connections
//! - **dispatcher**: routes transport events to the relay handlers
//! - **lifecycle**: session creation, grace periods and expiry
//! - **audio**: per-connection ingestion buffers and flush thresholds
//! - **delivery**: per-language fan-out of transcripts
//! - **rounds**: per-session transcription and delivery queues

use crate::audio::AudioIngestionBuffer;
use crate::config::AppConfig;
use crate::delivery::{BroadcastDeliveryEngine, RoundScheduler, TermGlossary, TranslationStore};
use crate::pipeline::{BasicProviderFactory, TieredFallbackPipeline};
use crate::realtime::handlers::{self, RelayServices};
use crate::realtime::{ConnectionRegistry, RealtimeDispatcher, SignalingStore, WebSocketTransport};
use crate::session::{InMemorySessionStore, SessionLifecycleManager, SessionStore};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub start_time: Instant,
    pub transport: Arc<WebSocketTransport>,
    pub dispatcher: Arc<RealtimeDispatcher>,
    pub registry: Arc<ConnectionRegistry>,
    pub lifecycle: Arc<SessionLifecycleManager>,
    pub pipeline: Arc<TieredFallbackPipeline>,
    pub audio: Arc<AudioIngestionBuffer>,
    pub delivery: Arc<BroadcastDeliveryEngine>,
    pub rounds: Arc<RoundScheduler>,
}

impl AppState {
    /// Wire the relay with the in-memory session store.
    pub fn new(config: AppConfig, translations: Arc<dyn TranslationStore>) -> anyhow::Result<Self> {
        Self::with_session_store(config, Arc::new(InMemorySessionStore::new()), translations)
    }

    /// Wire the relay: pipeline, delivery engine and handlers on a fresh
    /// dispatcher. The dispatcher is not started.
    pub fn with_session_store(
        config: AppConfig,
        sessions: Arc<dyn SessionStore>,
        translations: Arc<dyn TranslationStore>,
    ) -> anyhow::Result<Self> {
        let factory = BasicProviderFactory::new(config.audio.sample_rate);
        let pipeline = Arc::new(TieredFallbackPipeline::from_config(&config.providers, &factory)?);

        let transport = Arc::new(WebSocketTransport::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(RealtimeDispatcher::new(transport.clone(), registry.clone()));
        let sender = dispatcher.message_sender();

        let lifecycle = Arc::new(SessionLifecycleManager::new(sessions, &config.lifecycle));
        let glossary = Arc::new(TermGlossary::new());

        // persist_translations is checked per round, so the store is always attached
        let delivery = Arc::new(
            BroadcastDeliveryEngine::new(pipeline.clone(), registry.clone(), sender.clone(), &config.delivery)
                .with_glossary(glossary.clone())
                .with_lifecycle(lifecycle.clone())
                .with_store(translations),
        );
        let audio = Arc::new(AudioIngestionBuffer::new(&config.audio));
        let rounds = Arc::new(RoundScheduler::new(pipeline.clone(), sender.clone(), delivery.clone()));

        let services = RelayServices {
            registry: registry.clone(),
            sender,
            lifecycle: lifecycle.clone(),
            pipeline: pipeline.clone(),
            delivery: delivery.clone(),
            audio: audio.clone(),
            rounds: rounds.clone(),
            signaling: Arc::new(SignalingStore::new()),
            glossary,
        };
        handlers::install(&dispatcher, &services);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            start_time: Instant::now(),
            transport,
            dispatcher,
            registry,
            lifecycle,
            pipeline,
            audio,
            delivery,
            rounds,
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration.
    ///
    /// Lifecycle timeouts apply to the next sweep, audio thresholds to the next
    /// fragment and the delivery policy to the next round. Provider tiers and
    /// the bind address stay as they were at startup.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.lifecycle.set_timeouts(&new_config.lifecycle);
        self.audio.apply_config(&new_config.audio);
        self.delivery.apply_config(&new_config.delivery);

        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        *config = new_config;
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
