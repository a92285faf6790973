use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stage, used for timing records and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Translation,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Transcription => "transcription",
            Stage::Translation => "translation",
            Stage::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SttError {
    #[error("speech-to-text provider unavailable: {0}")]
    Unavailable(String),
    #[error("speech-to-text request failed: {0}")]
    Request(String),
    #[error("speech-to-text rate limited")]
    RateLimited,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("translation provider unavailable: {0}")]
    Unavailable(String),
    #[error("translation request failed: {0}")]
    Request(String),
    #[error("translation rate limited")]
    RateLimited,
    #[error("source and target language are both '{0}'")]
    SameLanguage(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TtsError {
    #[error("speech synthesis provider unavailable: {0}")]
    Unavailable(String),
    #[error("speech synthesis request failed: {0}")]
    Request(String),
    #[error("speech synthesis rate limited")]
    RateLimited,
    #[error("speech synthesis returned no audio")]
    EmptyAudio,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no {0} providers configured")]
    NoProviders(Stage),
    #[error("all {stage} tiers failed after {attempts} attempts: {last_error}")]
    AllTiersFailed {
        stage: Stage,
        attempts: usize,
        last_error: String,
    },
}
