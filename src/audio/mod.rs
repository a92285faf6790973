//! # Audio Ingestion
//!
//! Turns the teacher's stream of encoded audio fragments into discrete WAV
//! containers suitable for transcription.
//!
//! ## Key Components:
//! - **Container**: WAV header synthesis, concatenation and size repair
//! - **Processor**: payload decoding and suspicious-input screening
//! - **Buffer**: per-connection accumulation and flush decisions
//!
//! ## Audio Format:
//! Bare PCM is assumed to be 16-bit little-endian mono at the configured
//! sample rate (16kHz by default).

pub mod buffer;
pub mod container;
pub mod processor;

pub use buffer::{AudioIngestionBuffer, FlushedAudio, IngestOutcome};
pub use processor::{decode_audio_payload, DecodeError, InputScreen, Suspicion};
