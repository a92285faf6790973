//! # Tiered Fallback Pipeline
//!
//! Runs STT → Translation → TTS over ranked provider tiers
//! (e.g. Premium → High-Quality-Free → Enhanced-Free → Basic-Free/Silent).
//!
//! ## Degradation rules:
//! - **STT**: walk the ranked tiers; all failed → empty transcript
//! - **Translation**: walk the ranked tiers; all failed → `AllTiersFailed`
//!   (callers fall back to the original text)
//! - **TTS**: for each tier in the caller's sequence retry up to `tts_retries`
//!   times, then move on; all failed → empty audio so text delivery is never
//!   blocked by audio
//! - **Same language**: translation short-circuits to the input text without
//!   touching a provider
//!
//! Each stage records its wall-clock duration and the provider that resolved it;
//! per-stage latency aggregates are kept for the health endpoint.

use crate::config::ProvidersConfig;
use crate::pipeline::error::{PipelineError, Stage, TtsError};
use crate::pipeline::providers::{
    same_language, ProviderFactory, SpeechToText, TextToSpeech, Translator,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tier name that resolves to the highest-ranked TTS provider.
pub const AUTO_TIER: &str = "auto";

/// Ranked providers for one capability, highest rank first.
pub struct ProviderTiers<P: ?Sized> {
    entries: Vec<(String, Arc<P>)>,
}

impl<P: ?Sized> ProviderTiers<P> {
    pub fn new(entries: Vec<(String, Arc<P>)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    fn ranked(&self) -> impl Iterator<Item = &(String, Arc<P>)> {
        self.entries.iter()
    }

    /// Resolve a tier by name; `auto` is the highest-ranked entry.
    fn resolve(&self, tier: &str) -> Option<&(String, Arc<P>)> {
        if tier == AUTO_TIER {
            return self.entries.first();
        }
        self.entries.iter().find(|(name, _)| name == tier)
    }
}

impl<P: ?Sized> Default for ProviderTiers<P> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

/// Retry policy for synthesis.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    pub tts_retries: u32,
    pub tts_sequence: Vec<String>,
    pub retry_backoff: Duration,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            tts_retries: 3,
            tts_sequence: vec![AUTO_TIER.to_string()],
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Timing and provider identity for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub provider: Option<String>,
    pub duration_ms: u64,
    pub succeeded: bool,
}

/// Value produced by a stage plus its timing record.
#[derive(Debug, Clone)]
pub struct StageOutput<T> {
    pub value: T,
    pub timing: StageTiming,
}

/// STT → Translation → TTS result for one utterance and target language.
///
/// Assembled by the delivery round: the transcription stage comes from the
/// audio flush, translation and synthesis from the language group.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineResult {
    pub transcript: String,
    pub translated_text: String,
    #[serde(skip)]
    pub audio: Vec<u8>,
    pub stages: Vec<StageTiming>,
}

impl PipelineResult {
    pub fn stage(&self, stage: Stage) -> Option<&StageTiming> {
        self.stages.iter().find(|timing| timing.stage == stage)
    }
}

/// Latency aggregate for one stage since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageLatency {
    pub calls: u64,
    pub failures: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl StageLatency {
    pub fn mean_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_ms / self.calls
        }
    }
}

/// Success/failure counters per tier, surfaced on the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierCounters {
    pub successes: u64,
    pub failures: u64,
}

pub struct TieredFallbackPipeline {
    stt: ProviderTiers<dyn SpeechToText>,
    translation: ProviderTiers<dyn Translator>,
    tts: ProviderTiers<dyn TextToSpeech>,
    policy: PipelinePolicy,
    counters: Mutex<HashMap<(Stage, String), TierCounters>>,
    latency: Mutex<HashMap<Stage, StageLatency>>,
}

impl TieredFallbackPipeline {
    /// Build the pipeline from pre-constructed collaborators.
    pub fn with_collaborators(
        stt: ProviderTiers<dyn SpeechToText>,
        translation: ProviderTiers<dyn Translator>,
        tts: ProviderTiers<dyn TextToSpeech>,
        policy: PipelinePolicy,
    ) -> Self {
        Self {
            stt,
            translation,
            tts,
            policy,
            counters: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
        }
    }

    /// Build the pipeline from configured tier names.
    ///
    /// Tier names the factory does not know are skipped with a warning; a
    /// capability left with no tier at all is a configuration error.
    pub fn from_config(
        config: &ProvidersConfig,
        factory: &dyn ProviderFactory,
    ) -> anyhow::Result<Self> {
        let stt = collect_tiers(&config.stt_tiers, "stt", |t| factory.speech_to_text(t));
        let translation =
            collect_tiers(&config.translation_tiers, "translation", |t| factory.translator(t));
        let tts = collect_tiers(&config.tts_tiers, "tts", |t| factory.text_to_speech(t));

        for (stage, empty) in [
            (Stage::Transcription, stt.is_empty()),
            (Stage::Translation, translation.is_empty()),
            (Stage::Synthesis, tts.is_empty()),
        ] {
            if empty {
                return Err(PipelineError::NoProviders(stage).into());
            }
        }

        info!(
            stt = ?stt.names(),
            translation = ?translation.names(),
            tts = ?tts.names(),
            "Provider tiers resolved"
        );

        let policy = PipelinePolicy {
            tts_retries: config.tts_retries.max(1),
            tts_sequence: if config.tts_sequence.is_empty() {
                vec![AUTO_TIER.to_string()]
            } else {
                config.tts_sequence.clone()
            },
            retry_backoff: Duration::from_millis(config.tts_retry_backoff_ms),
        };

        Ok(Self::with_collaborators(stt, translation, tts, policy))
    }

    /// Default synthesis tier sequence.
    pub fn tts_sequence(&self) -> &[String] {
        &self.policy.tts_sequence
    }

    /// Transcribe audio, walking the ranked STT tiers.
    ///
    /// Never fails: when every tier fails the transcript is empty.
    pub async fn transcribe(&self, audio: &[u8], language: &str) -> StageOutput<String> {
        let started = Instant::now();

        for (tier, provider) in self.stt.ranked() {
            match provider.transcribe(audio, language).await {
                Ok(text) => {
                    self.record(Stage::Transcription, tier, true);
                    return StageOutput {
                        value: text.trim().to_string(),
                        timing: self.finish(Stage::Transcription, Some(provider.name()), started, true),
                    };
                }
                Err(err) => {
                    self.record(Stage::Transcription, tier, false);
                    warn!(tier = %tier, provider = provider.name(), error = %err, "STT tier failed");
                }
            }
        }

        warn!(language = %language, "All STT tiers failed, returning empty transcript");
        StageOutput {
            value: String::new(),
            timing: self.finish(Stage::Transcription, None, started, false),
        }
    }

    /// Translate text, walking the ranked translation tiers.
    ///
    /// Same-language requests return the input unchanged without calling a
    /// provider. Exhausting every tier yields `AllTiersFailed`.
    pub async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<StageOutput<String>, PipelineError> {
        let started = Instant::now();

        if same_language(source_language, target_language) {
            return Ok(StageOutput {
                value: text.to_string(),
                timing: self.finish(Stage::Translation, None, started, true),
            });
        }

        if self.translation.is_empty() {
            return Err(PipelineError::NoProviders(Stage::Translation));
        }

        let mut attempts = 0;
        let mut last_error = String::new();
        for (tier, provider) in self.translation.ranked() {
            attempts += 1;
            match provider.translate(text, source_language, target_language).await {
                Ok(translated) => {
                    self.record(Stage::Translation, tier, true);
                    debug!(
                        tier = %tier,
                        provider = provider.name(),
                        target = %target_language,
                        "Translation resolved"
                    );
                    return Ok(StageOutput {
                        value: translated,
                        timing: self.finish(Stage::Translation, Some(provider.name()), started, true),
                    });
                }
                Err(err) => {
                    self.record(Stage::Translation, tier, false);
                    warn!(
                        tier = %tier,
                        provider = provider.name(),
                        target = %target_language,
                        error = %err,
                        "Translation tier failed"
                    );
                    last_error = err.to_string();
                }
            }
        }

        self.finish(Stage::Translation, None, started, false);
        Err(PipelineError::AllTiersFailed {
            stage: Stage::Translation,
            attempts,
            last_error,
        })
    }

    /// Synthesize speech over a tier sequence with bounded retries per tier.
    ///
    /// Never fails: when every tier is exhausted the audio is empty.
    pub async fn synthesize(
        &self,
        text: &str,
        language: &str,
        sequence: &[String],
    ) -> StageOutput<Vec<u8>> {
        let started = Instant::now();
        let sequence = if sequence.is_empty() {
            self.policy.tts_sequence.as_slice()
        } else {
            sequence
        };

        for requested in sequence {
            let Some((tier, provider)) = self.tts.resolve(requested) else {
                warn!(tier = %requested, "Unknown TTS tier in sequence, skipping");
                continue;
            };

            for attempt in 1..=self.policy.tts_retries {
                let synthesized = match provider.synthesize(text, language).await {
                    Ok(audio) if audio.is_empty() => Err(TtsError::EmptyAudio),
                    other => other,
                };
                match synthesized {
                    Ok(audio) => {
                        self.record(Stage::Synthesis, tier, true);
                        return StageOutput {
                            value: audio,
                            timing: self.finish(Stage::Synthesis, Some(provider.name()), started, true),
                        };
                    }
                    Err(err) => {
                        self.record(Stage::Synthesis, tier, false);
                        warn!(tier = %tier, attempt, error = %err, "TTS attempt failed");
                    }
                }

                if attempt < self.policy.tts_retries && !self.policy.retry_backoff.is_zero() {
                    tokio::time::sleep(self.policy.retry_backoff).await;
                }
            }
        }

        warn!(language = %language, "All TTS tiers exhausted, delivering without audio");
        StageOutput {
            value: Vec::new(),
            timing: self.finish(Stage::Synthesis, None, started, false),
        }
    }

    /// Snapshot of per-tier counters.
    pub fn tier_counters(&self) -> Vec<(Stage, String, TierCounters)> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshot: Vec<_> = counters
            .iter()
            .map(|((stage, tier), c)| (*stage, tier.clone(), c.clone()))
            .collect();
        snapshot.sort_by(|a, b| (a.0 as u8, &a.1).cmp(&(b.0 as u8, &b.1)));
        snapshot
    }

    /// Snapshot of per-stage latency, in pipeline order.
    pub fn stage_latency(&self) -> Vec<(Stage, StageLatency)> {
        let latency = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        [Stage::Transcription, Stage::Translation, Stage::Synthesis]
            .into_iter()
            .filter_map(|stage| latency.get(&stage).map(|l| (stage, l.clone())))
            .collect()
    }

    fn finish(
        &self,
        stage: Stage,
        provider: Option<&str>,
        started: Instant,
        succeeded: bool,
    ) -> StageTiming {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut latency = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = latency.entry(stage).or_default();
        entry.calls += 1;
        entry.total_ms = entry.total_ms.saturating_add(duration_ms);
        entry.max_ms = entry.max_ms.max(duration_ms);
        if !succeeded {
            entry.failures += 1;
        }

        StageTiming {
            stage,
            provider: provider.map(str::to_string),
            duration_ms,
            succeeded,
        }
    }

    fn record(&self, stage: Stage, tier: &str, succeeded: bool) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = counters.entry((stage, tier.to_string())).or_default();
        if succeeded {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }
}

fn collect_tiers<P: ?Sized>(
    names: &[String],
    capability: &str,
    build: impl Fn(&str) -> Option<Arc<P>>,
) -> ProviderTiers<P> {
    let entries = names
        .iter()
        .filter_map(|name| match build(name) {
            Some(provider) => Some((name.clone(), provider)),
            None => {
                warn!(capability, tier = %name, "No provider available for tier, skipping");
                None
            }
        })
        .collect();
    ProviderTiers::new(entries)
}
