//! # Audio Payload Decoding and Screening
//!
//! Turns the encoded `data` field of an `audio` message into raw bytes and
//! screens flushed buffers before they reach a transcription provider.
//!
//! ## Screening rules:
//! Automated browser tests feed the relay synthetic fixtures (fixed sizes,
//! generated silence, repeated patterns). Outside production these are dropped
//! so they are never transcribed as speech:
//! 1. **Fixture sizes**: payload length equals one of a configured set
//! 2. **Round payloads**: very large payloads that are an exact multiple of a round unit
//! 3. **Repeating samples**: more than two identical sample pairs among five
//!    evenly spaced sample points
//!
//! The thresholds come from [`AudioConfig`]; none of them is load-bearing for
//! real classroom audio and all can be disabled.

use crate::audio::container;
use crate::config::AudioConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use thiserror::Error;

/// Number of evenly spaced sample positions used by the repetition check.
const SAMPLE_POINTS: usize = 5;

/// Bytes per sampled value (16-bit PCM).
const SAMPLE_BYTES: usize = 2;

/// More identical sample pairs than this marks the payload as synthetic.
const MAX_IDENTICAL_PAIRS: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("audio payload is empty")]
    Empty,
    #[error("audio payload is not valid base64: {0}")]
    InvalidEncoding(String),
}

/// Decode an encoded audio payload.
///
/// Accepts plain base64 or a `data:audio/...;base64,` URL as produced by
/// `FileReader.readAsDataURL` in the browser.
pub fn decode_audio_payload(data: &str) -> Result<Vec<u8>, DecodeError> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(DecodeError::Empty);
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(bytes)
}

/// Why a payload was considered synthetic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspicion {
    FixtureSize(usize),
    RoundLargePayload(usize),
    RepeatingSamples { identical_pairs: usize },
}

impl fmt::Display for Suspicion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspicion::FixtureSize(len) => write!(f, "payload length {} matches a fixture size", len),
            Suspicion::RoundLargePayload(len) => {
                write!(f, "payload length {} is a large round multiple", len)
            }
            Suspicion::RepeatingSamples { identical_pairs } => {
                write!(f, "{} identical sample pairs", identical_pairs)
            }
        }
    }
}

/// Suspicious-input heuristic applied to flushed buffers.
#[derive(Debug, Clone)]
pub struct InputScreen {
    enabled: bool,
    fixture_sizes: Vec<usize>,
    large_payload_bytes: usize,
    round_unit_bytes: usize,
}

impl InputScreen {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            enabled: config.screen_suspicious_input,
            fixture_sizes: config.suspicious_sizes.clone(),
            large_payload_bytes: config.large_payload_bytes,
            round_unit_bytes: config.round_unit_bytes.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            fixture_sizes: Vec::new(),
            large_payload_bytes: usize::MAX,
            round_unit_bytes: 1,
        }
    }

    /// Inspect a container (or bare PCM) and report why it looks synthetic.
    pub fn inspect(&self, bytes: &[u8]) -> Option<Suspicion> {
        if !self.enabled {
            return None;
        }

        let samples = container::payload(bytes);
        let len = samples.len();

        if self.fixture_sizes.contains(&len) {
            return Some(Suspicion::FixtureSize(len));
        }

        if len >= self.large_payload_bytes && len % self.round_unit_bytes == 0 {
            return Some(Suspicion::RoundLargePayload(len));
        }

        let identical_pairs = identical_sample_pairs(samples);
        if identical_pairs > MAX_IDENTICAL_PAIRS {
            return Some(Suspicion::RepeatingSamples { identical_pairs });
        }

        None
    }
}

/// Count identical pairs among samples read at five evenly spaced offsets.
fn identical_sample_pairs(samples: &[u8]) -> usize {
    if samples.len() < SAMPLE_POINTS * SAMPLE_BYTES {
        return 0;
    }

    let last_start = samples.len() - SAMPLE_BYTES;
    let points: Vec<&[u8]> = (0..SAMPLE_POINTS)
        .map(|i| {
            // Aligned to a sample boundary
            let offset = (last_start * i / (SAMPLE_POINTS - 1)) & !1;
            &samples[offset..offset + SAMPLE_BYTES]
        })
        .collect();

    let mut pairs = 0;
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            if points[i] == points[j] {
                pairs += 1;
            }
        }
    }
    pairs
}
