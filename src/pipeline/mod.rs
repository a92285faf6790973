//! # Translation Pipeline
//!
//! STT → Translation → TTS over ranked provider tiers.
//!
//! ## Key Components:
//! - **Providers**: capability traits and the built-in basic tier
//! - **Tiered**: fallback orchestration, retries and stage timing
//! - **Error**: capability-specific error types

pub mod error;
pub mod providers;
pub mod tiered;

pub use error::{PipelineError, Stage, SttError, TranslationError, TtsError};
pub use providers::{
    normalize_language, primary_language, same_language, BasicProviderFactory, ProviderFactory,
    SpeechToText, TextToSpeech, Translator,
};
pub use tiered::{
    PipelinePolicy, PipelineResult, ProviderTiers, StageLatency, StageOutput, StageTiming, TierCounters,
    TieredFallbackPipeline, AUTO_TIER,
};
