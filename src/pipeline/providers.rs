//! # Provider Capabilities
//!
//! Uniform interfaces for the three upstream capabilities. Vendor adapters
//! (premium STT, hosted translation, neural TTS, ...) live outside this crate
//! and plug in through a [`ProviderFactory`]; the relay only ships the
//! "basic free" tier so it can boot without any vendor credentials.
//!
//! ## Contract:
//! Every provider exposes one async operation and fails with a
//! capability-specific error instead of returning empty output.

use crate::audio::container;
use crate::pipeline::error::{SttError, TranslationError, TtsError};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String, SttError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslationError>;
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn name(&self) -> &str;
    async fn synthesize(&self, text: &str, language: &str) -> Result<Vec<u8>, TtsError>;
}

/// Builds providers for named tiers. Unknown tier names yield `None`.
pub trait ProviderFactory: Send + Sync {
    fn speech_to_text(&self, tier: &str) -> Option<Arc<dyn SpeechToText>>;
    fn translator(&self, tier: &str) -> Option<Arc<dyn Translator>>;
    fn text_to_speech(&self, tier: &str) -> Option<Arc<dyn TextToSpeech>>;
}

/// Primary language subtag, lowercased (`"en-US"` → `"en"`).
pub fn primary_language(code: &str) -> String {
    code.split(|c| c == '-' || c == '_')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Full language tag, lowercased with `-` separators (`"pt_BR"` → `"pt-br"`).
pub fn normalize_language(code: &str) -> String {
    code.trim().replace('_', "-").to_ascii_lowercase()
}

/// Two codes name the same language when their normalized tags are equal.
///
/// Script and region count: `zh-Hans`/`zh-Hant` and `pt-BR`/`pt-PT` differ.
pub fn same_language(a: &str, b: &str) -> bool {
    normalize_language(a) == normalize_language(b)
}

/// Precondition for translation providers: the language pair must differ.
pub fn ensure_distinct_languages(source: &str, target: &str) -> Result<(), TranslationError> {
    if same_language(source, target) {
        return Err(TranslationError::SameLanguage(normalize_language(source)));
    }
    Ok(())
}

/// Stand-in for when no speech recognition tier is configured.
#[derive(Debug, Default)]
pub struct UnavailableSpeechToText;

#[async_trait]
impl SpeechToText for UnavailableSpeechToText {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn transcribe(&self, _audio: &[u8], _language: &str) -> Result<String, SttError> {
        Err(SttError::Unavailable("no speech recognition tier configured".to_string()))
    }
}

/// Returns the source text; the last resort translation tier.
#[derive(Debug, Default)]
pub struct PassthroughTranslator;

#[async_trait]
impl Translator for PassthroughTranslator {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslationError> {
        ensure_distinct_languages(source_language, target_language)?;
        Ok(text.to_string())
    }
}

/// Produces an empty, well-formed WAV container.
#[derive(Debug)]
pub struct SilentSpeech {
    sample_rate: u32,
}

impl SilentSpeech {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl TextToSpeech for SilentSpeech {
    fn name(&self) -> &str {
        "silent"
    }

    async fn synthesize(&self, _text: &str, _language: &str) -> Result<Vec<u8>, TtsError> {
        Ok(container::pcm_header(0, self.sample_rate).to_vec())
    }
}

/// Factory for the built-in basic tiers: `unavailable`, `passthrough`, `silent`.
#[derive(Debug)]
pub struct BasicProviderFactory {
    sample_rate: u32,
}

impl BasicProviderFactory {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl ProviderFactory for BasicProviderFactory {
    fn speech_to_text(&self, tier: &str) -> Option<Arc<dyn SpeechToText>> {
        match tier {
            "unavailable" => Some(Arc::new(UnavailableSpeechToText)),
            _ => None,
        }
    }

    fn translator(&self, tier: &str) -> Option<Arc<dyn Translator>> {
        match tier {
            "passthrough" => Some(Arc::new(PassthroughTranslator)),
            _ => None,
        }
    }

    fn text_to_speech(&self, tier: &str) -> Option<Arc<dyn TextToSpeech>> {
        match tier {
            "silent" => Some(Arc::new(SilentSpeech::new(self.sample_rate))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_comparison_uses_full_tag() {
        assert!(same_language("en-US", "en_us"));
        assert!(same_language(" EN ", "en"));
        assert!(!same_language("pt_BR", "pt-PT"));
        assert!(!same_language("zh-Hans", "zh-Hant"));
        assert!(!same_language("en", "en-GB"));
        assert!(!same_language("es", "en"));
        assert_eq!(primary_language("zh-Hant"), "zh");
        assert_eq!(normalize_language("pt_BR"), "pt-br");
    }

    #[tokio::test]
    async fn test_passthrough_rejects_same_language_pair() {
        let translator = PassthroughTranslator;
        assert_eq!(
            translator.translate("hola", "es_MX", "es-mx").await,
            Err(TranslationError::SameLanguage("es-mx".to_string()))
        );
        assert_eq!(translator.translate("hola", "es", "es-MX").await.unwrap(), "hola");
        assert_eq!(translator.translate("hola", "es", "en").await.unwrap(), "hola");
    }

    #[tokio::test]
    async fn test_silent_speech_is_a_valid_container() {
        let audio = SilentSpeech::new(16000).synthesize("hi", "en").await.unwrap();
        assert_eq!(container::declared_sizes(&audio), Some((36, 0)));
    }

    #[test]
    fn test_basic_factory_knows_only_basic_tiers() {
        let factory = BasicProviderFactory::new(16000);
        assert!(factory.translator("passthrough").is_some());
        assert!(factory.translator("deepl").is_none());
        assert!(factory.text_to_speech("silent").is_some());
        assert!(factory.speech_to_text("unavailable").is_some());
    }
}
