//! # Broadcast Delivery Engine
//!
//! Fans one teacher utterance out to every student of a session.
//!
//! ## Delivery Round:
//! 1. Partition the session's students by registered target language
//!    (absent or disallowed languages are excluded)
//! 2. Translate once per distinct language; groups run concurrently
//! 3. Shape the group text per student, then deliver server audio or a
//!    client-side speech instruction
//! 4. Unicast with bounded retries; a failed send never aborts the round
//! 5. A failed translation delivers the original text with an error marker
//! 6. Best-effort persistence, then session activity is refreshed
//!
//! Cost is proportional to the number of distinct languages, not students.
//! Each group yields a [`PipelineResult`] whose stage timings are logged with
//! the round. The fan-out policy can be replaced at runtime with `apply_config`.

use crate::config::DeliveryConfig;
use crate::delivery::persistence::{TranslationRecord, TranslationStore};
use crate::delivery::shaping::{shape_for_listener, TermGlossary};
use crate::pipeline::{
    normalize_language, primary_language, same_language, PipelineResult, Stage, StageTiming,
    TieredFallbackPipeline, AUTO_TIER,
};
use crate::realtime::dispatcher::MessageSender;
use crate::realtime::messages::OutboundMessage;
use crate::realtime::registry::{ConnectionEntry, ConnectionRegistry};
use crate::session::SessionLifecycleManager;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Marker sent alongside the original text when translation failed.
pub const TRANSLATION_UNAVAILABLE: &str = "translation_unavailable";

/// One utterance to fan out.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub session_id: String,
    pub source_text: String,
    pub source_language: String,
    /// Timing of the transcription that produced `source_text`, if any
    pub transcription: Option<StageTiming>,
}

/// Per-(session, target language) unit of work for one round.
#[derive(Debug, Clone)]
pub struct TranslationDeliveryJob {
    pub session_id: String,
    pub source_text: String,
    pub source_language: String,
    pub target_language: String,
    pub recipients: Vec<ConnectionEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LanguageOutcome {
    pub target_language: String,
    pub recipients: usize,
    pub delivered: usize,
    pub failed_sends: usize,
    pub degraded: bool,
    pub provider: Option<String>,
    pub duration_ms: u64,
    pub result: PipelineResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub session_id: String,
    pub languages: Vec<LanguageOutcome>,
    pub excluded: usize,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.languages.iter().map(|l| l.delivered).sum()
    }

    pub fn failed_sends(&self) -> usize {
        self.languages.iter().map(|l| l.failed_sends).sum()
    }
}

/// Cumulative counters since startup.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    rounds: AtomicU64,
    language_groups: AtomicU64,
    messages_delivered: AtomicU64,
    send_failures: AtomicU64,
    degraded_groups: AtomicU64,
    persistence_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStatsSnapshot {
    pub rounds: u64,
    pub language_groups: u64,
    pub messages_delivered: u64,
    pub send_failures: u64,
    pub degraded_groups: u64,
    pub persistence_failures: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            language_groups: self.language_groups.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            degraded_groups: self.degraded_groups.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct DeliveryPolicy {
    allowed_languages: Vec<String>,
    send_attempts: u32,
    send_backoff: Duration,
    persist: bool,
}

impl DeliveryPolicy {
    fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            allowed_languages: config.allowed_target_languages.clone(),
            send_attempts: config.send_retries.saturating_add(1),
            send_backoff: Duration::from_millis(config.send_retry_backoff_ms),
            persist: config.persist_translations,
        }
    }

    /// An entry without subtags (`"es"`) admits its regional variants too.
    fn allows(&self, language: &str) -> bool {
        self.allowed_languages.is_empty()
            || self.allowed_languages.iter().any(|allowed| {
                same_language(allowed, language)
                    || (!normalize_language(allowed).contains('-')
                        && primary_language(allowed) == primary_language(language))
            })
    }
}

pub struct BroadcastDeliveryEngine {
    pipeline: Arc<TieredFallbackPipeline>,
    registry: Arc<ConnectionRegistry>,
    sender: Arc<dyn MessageSender>,
    glossary: Arc<TermGlossary>,
    store: Option<Arc<dyn TranslationStore>>,
    lifecycle: Option<Arc<SessionLifecycleManager>>,
    policy: RwLock<DeliveryPolicy>,
    stats: DeliveryStats,
}

impl BroadcastDeliveryEngine {
    pub fn new(
        pipeline: Arc<TieredFallbackPipeline>,
        registry: Arc<ConnectionRegistry>,
        sender: Arc<dyn MessageSender>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            pipeline,
            registry,
            sender,
            glossary: Arc::new(TermGlossary::new()),
            store: None,
            lifecycle: None,
            policy: RwLock::new(DeliveryPolicy::from_config(config)),
            stats: DeliveryStats::default(),
        }
    }

    pub fn with_glossary(mut self, glossary: Arc<TermGlossary>) -> Self {
        self.glossary = glossary;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TranslationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<SessionLifecycleManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Replace the fan-out policy; rounds already running keep the old one.
    pub fn apply_config(&self, config: &DeliveryConfig) {
        let policy = DeliveryPolicy::from_config(config);
        info!(
            allowed_languages = ?policy.allowed_languages,
            send_attempts = policy.send_attempts,
            persist = policy.persist,
            "Delivery policy updated"
        );
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    fn policy(&self) -> DeliveryPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Split the session's students into per-language jobs.
    async fn plan(
        &self,
        request: &DeliveryRequest,
        policy: &DeliveryPolicy,
    ) -> (Vec<TranslationDeliveryJob>, usize) {
        let students = self.registry.students_in_session(&request.session_id).await;
        let mut groups: BTreeMap<String, Vec<ConnectionEntry>> = BTreeMap::new();
        let mut excluded = 0;

        for student in students {
            let language = student
                .language_code
                .as_deref()
                .map(normalize_language)
                .filter(|code| !code.is_empty());

            match language {
                Some(language) if policy.allows(&language) => {
                    groups.entry(language).or_default().push(student);
                }
                _ => {
                    excluded += 1;
                    debug!(
                        connection_id = %student.connection_id,
                        language = ?student.language_code,
                        "Student excluded from delivery"
                    );
                }
            }
        }

        let jobs = groups
            .into_iter()
            .map(|(target_language, recipients)| TranslationDeliveryJob {
                session_id: request.session_id.clone(),
                source_text: request.source_text.clone(),
                source_language: request.source_language.clone(),
                target_language,
                recipients,
            })
            .collect();
        (jobs, excluded)
    }

    /// Run one full delivery round and wait for every language group to settle.
    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryReport {
        let policy = self.policy();
        let (jobs, excluded) = self.plan(&request, &policy).await;
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);

        let languages = join_all(
            jobs.into_iter()
                .map(|job| self.deliver_group(job, request.transcription.as_ref(), &policy)),
        )
        .await;
        let report = DeliveryReport {
            session_id: request.session_id.clone(),
            languages,
            excluded,
        };

        if let Some(lifecycle) = &self.lifecycle {
            if let Err(err) = lifecycle
                .record_translations(&request.session_id, report.delivered() as u64, Utc::now())
                .await
            {
                warn!(session_id = %request.session_id, error = %err, "Failed to record session activity");
            }
        }

        info!(
            session_id = %report.session_id,
            languages = report.languages.len(),
            delivered = report.delivered(),
            failed_sends = report.failed_sends(),
            "Delivery round complete"
        );
        report
    }

    async fn deliver_group(
        &self,
        job: TranslationDeliveryJob,
        transcription: Option<&StageTiming>,
        policy: &DeliveryPolicy,
    ) -> LanguageOutcome {
        let started = Instant::now();
        self.stats.language_groups.fetch_add(1, Ordering::Relaxed);

        let mut outcome = LanguageOutcome {
            target_language: job.target_language.clone(),
            recipients: job.recipients.len(),
            result: PipelineResult {
                transcript: job.source_text.clone(),
                stages: transcription.cloned().into_iter().collect(),
                ..PipelineResult::default()
            },
            ..LanguageOutcome::default()
        };

        let translation_started = Instant::now();
        let translated = match self
            .pipeline
            .translate(&job.source_text, &job.source_language, &job.target_language)
            .await
        {
            Ok(output) => {
                outcome.provider = output.timing.provider.clone();
                outcome.result.stages.push(output.timing);
                Some(output.value)
            }
            Err(err) => {
                outcome.result.stages.push(StageTiming {
                    stage: Stage::Translation,
                    provider: None,
                    duration_ms: elapsed_ms(translation_started),
                    succeeded: false,
                });
                warn!(
                    session_id = %job.session_id,
                    target_language = %job.target_language,
                    error = %err,
                    "Translation failed, delivering original text"
                );
                outcome.degraded = true;
                self.stats.degraded_groups.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        let mut audio_cache: HashMap<(String, Vec<String>), Option<String>> = HashMap::new();
        for recipient in &job.recipients {
            let message = match &translated {
                Some(text) => {
                    self.translated_message(&job, recipient, text, &mut audio_cache, &mut outcome.result)
                        .await
                }
                None => degraded_message(&job, recipient),
            };

            if self.send_with_retry(&recipient.connection_id, &message, policy).await {
                outcome.delivered += 1;
            } else {
                outcome.failed_sends += 1;
            }
        }

        self.stats
            .messages_delivered
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .send_failures
            .fetch_add(outcome.failed_sends as u64, Ordering::Relaxed);

        outcome.result.translated_text = translated.unwrap_or_else(|| job.source_text.clone());
        if policy.persist {
            self.persist(&job, &outcome).await;
        }

        outcome.duration_ms = elapsed_ms(started);
        debug!(
            session_id = %job.session_id,
            target_language = %job.target_language,
            delivered = outcome.delivered,
            degraded = outcome.degraded,
            translation_ms = ?outcome.result.stage(Stage::Translation).map(|t| t.duration_ms),
            synthesis_ms = ?outcome.result.stage(Stage::Synthesis).map(|t| t.duration_ms),
            "Language group delivered"
        );
        outcome
    }

    async fn translated_message(
        &self,
        job: &TranslationDeliveryJob,
        recipient: &ConnectionEntry,
        text: &str,
        audio_cache: &mut HashMap<(String, Vec<String>), Option<String>>,
        result: &mut PipelineResult,
    ) -> OutboundMessage {
        let shaped = shape_for_listener(
            text,
            &job.target_language,
            &recipient.settings,
            &self.glossary,
        );

        let audio_data = if recipient.settings.use_client_speech {
            None
        } else {
            let sequence = self.tts_sequence_for(recipient);
            let key = (shaped.clone(), sequence);
            match audio_cache.get(&key) {
                Some(cached) => cached.clone(),
                None => {
                    let speech = self
                        .pipeline
                        .synthesize(&shaped, &job.target_language, &key.1)
                        .await;
                    let encoded = (!speech.value.is_empty()).then(|| STANDARD.encode(&speech.value));
                    if result.audio.is_empty() {
                        result.audio = speech.value;
                    }
                    result.stages.push(speech.timing);
                    audio_cache.insert(key, encoded.clone());
                    encoded
                }
            }
        };

        OutboundMessage::Translation {
            text: shaped,
            target_language: job.target_language.clone(),
            source_language: job.source_language.clone(),
            original_text: job.source_text.clone(),
            audio_data,
            use_client_speech: recipient.settings.use_client_speech,
            degraded: false,
            error: None,
        }
    }

    fn tts_sequence_for(&self, recipient: &ConnectionEntry) -> Vec<String> {
        let mut sequence = Vec::new();
        if let Some(tier) = &recipient.settings.tts_tier {
            sequence.push(tier.clone());
        }
        for tier in self.pipeline.tts_sequence() {
            if !sequence.contains(tier) {
                sequence.push(tier.clone());
            }
        }
        if sequence.is_empty() {
            sequence.push(AUTO_TIER.to_string());
        }
        sequence
    }

    async fn send_with_retry(
        &self,
        connection_id: &str,
        message: &OutboundMessage,
        policy: &DeliveryPolicy,
    ) -> bool {
        for attempt in 1..=policy.send_attempts {
            match self.sender.send(connection_id, message).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        connection_id = %connection_id,
                        attempt,
                        error = %err,
                        "Delivery send failed"
                    );
                    if attempt < policy.send_attempts && !policy.send_backoff.is_zero() {
                        tokio::time::sleep(policy.send_backoff).await;
                    }
                }
            }
        }
        false
    }

    async fn persist(&self, job: &TranslationDeliveryJob, outcome: &LanguageOutcome) {
        let Some(store) = &self.store else {
            return;
        };

        let record = TranslationRecord {
            session_id: job.session_id.clone(),
            source_language: job.source_language.clone(),
            target_language: job.target_language.clone(),
            original_text: job.source_text.clone(),
            translated_text: outcome.result.translated_text.clone(),
            recipients: outcome.delivered,
            degraded: outcome.degraded,
            provider: outcome.provider.clone(),
            created_at: Utc::now(),
        };

        if let Err(err) = store.record(record).await {
            self.stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                session_id = %job.session_id,
                target_language = %job.target_language,
                error = %err,
                "Failed to persist translation"
            );
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn degraded_message(job: &TranslationDeliveryJob, recipient: &ConnectionEntry) -> OutboundMessage {
    OutboundMessage::Translation {
        text: job.source_text.clone(),
        target_language: job.target_language.clone(),
        source_language: job.source_language.clone(),
        original_text: job.source_text.clone(),
        audio_data: None,
        use_client_speech: recipient.settings.use_client_speech,
        degraded: true,
        error: Some(TRANSLATION_UNAVAILABLE.to_string()),
    }
}
