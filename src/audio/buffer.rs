//! # Audio Ingestion Buffer
//!
//! Accumulates audio fragments per speaking connection and decides when the
//! accumulated audio is worth a transcription call.
//!
//! ## Key Features:
//! - **Lazy per-connection buffers**: created on the first chunk, removed on flush
//! - **Bounded memory**: only the most recent `max_buffered_chunks` chunks are kept
//! - **Flush rules**: chunk size, cumulative size, or a silence gap between chunks
//! - **Reassembly**: chunks are merged into one WAV container with correct sizes
//! - **Live thresholds**: `apply_config` takes effect on the next fragment
//!
//! Each connection has a single accumulator, so flushes for one speaker come
//! out in arrival order.

use crate::audio::container;
use crate::audio::processor::{InputScreen, Suspicion};
use crate::config::AudioConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Accumulated chunks for one speaking connection.
#[derive(Debug, Default)]
struct ChunkBuffer {
    chunks: VecDeque<Vec<u8>>,
    last_chunk_at: Option<Instant>,
    total_bytes: usize,
}

impl ChunkBuffer {
    fn append(&mut self, chunk: Vec<u8>, max_chunks: usize, now: Instant) {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        self.last_chunk_at = Some(now);

        while self.chunks.len() > max_chunks {
            if let Some(dropped) = self.chunks.pop_front() {
                self.total_bytes -= dropped.len();
            }
        }
    }
}

/// Thresholds in force for the next fragment.
#[derive(Debug, Clone)]
struct FlushPolicy {
    sample_rate: u32,
    min_flush_bytes: usize,
    silence_gap: Duration,
    max_chunks: usize,
    screen: InputScreen,
}

impl FlushPolicy {
    fn new(config: &AudioConfig, screen: InputScreen) -> Self {
        Self {
            sample_rate: config.sample_rate,
            min_flush_bytes: config.min_flush_bytes,
            silence_gap: Duration::from_millis(config.silence_gap_ms),
            max_chunks: config.max_buffered_chunks.max(1),
            screen,
        }
    }
}

/// Audio ready for transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedAudio {
    /// One WAV container with rewritten size fields
    pub bytes: Vec<u8>,
    /// How many chunks were merged
    pub chunk_count: usize,
}

/// Result of feeding one fragment into the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Fragment stored, nothing to transcribe yet
    Buffered { chunks: usize, total_bytes: usize },
    /// Buffer flushed and cleared
    Flushed(FlushedAudio),
    /// Buffer flushed but dropped by the screening heuristic
    Rejected(Suspicion),
}

/// Per-connection audio accumulator.
pub struct AudioIngestionBuffer {
    buffers: Mutex<HashMap<String, ChunkBuffer>>,
    policy: RwLock<FlushPolicy>,
}

impl AudioIngestionBuffer {
    pub fn new(config: &AudioConfig) -> Self {
        Self::with_screen(config, InputScreen::from_config(config))
    }

    pub fn with_screen(config: &AudioConfig, screen: InputScreen) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            policy: RwLock::new(FlushPolicy::new(config, screen)),
        }
    }

    /// Replace thresholds and screening. Already buffered chunks are kept and
    /// judged against the new thresholds when the next fragment arrives.
    pub fn apply_config(&self, config: &AudioConfig) {
        let policy = FlushPolicy::new(config, InputScreen::from_config(config));
        info!(
            min_flush_bytes = policy.min_flush_bytes,
            silence_gap_ms = config.silence_gap_ms,
            screen = config.screen_suspicious_input,
            "Audio flush thresholds updated"
        );
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Feed one decoded fragment.
    ///
    /// ## Flush decision (any of):
    /// - this chunk alone exceeds the minimum size
    /// - more than one chunk is buffered and the gap since the previous chunk
    ///   exceeds the silence threshold
    /// - the cumulative buffered size exceeds the minimum size
    /// - `force_flush` (client marked the chunk final) with anything buffered
    pub fn push(
        &self,
        connection_id: &str,
        raw: Vec<u8>,
        force_flush: bool,
        now: Instant,
    ) -> IngestOutcome {
        let policy = self
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let chunk = container::ensure_container(raw, policy.sample_rate);
        let chunk_len = chunk.len();

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = buffers.entry(connection_id.to_string()).or_default();

        let gap = buffer
            .last_chunk_at
            .map(|previous| now.saturating_duration_since(previous));
        buffer.append(chunk, policy.max_chunks, now);

        let chunk_is_large = chunk_len > policy.min_flush_bytes;
        let silence_elapsed =
            buffer.chunks.len() > 1 && gap.map_or(false, |gap| gap > policy.silence_gap);
        let cumulative_is_large = buffer.total_bytes > policy.min_flush_bytes;

        if !(chunk_is_large || silence_elapsed || cumulative_is_large || force_flush) {
            return IngestOutcome::Buffered {
                chunks: buffer.chunks.len(),
                total_bytes: buffer.total_bytes,
            };
        }

        let drained = buffers.remove(connection_id).unwrap_or_default();
        drop(buffers);

        let chunk_count = drained.chunks.len();
        let chunks: Vec<Vec<u8>> = drained.chunks.into_iter().collect();
        let bytes = if chunk_count == 1 {
            let mut single = chunks.into_iter().next().unwrap_or_default();
            container::rewrite_sizes(&mut single);
            single
        } else {
            container::concatenate(&chunks)
        };

        if let Some(suspicion) = policy.screen.inspect(&bytes) {
            warn!(
                connection_id = %connection_id,
                bytes = bytes.len(),
                reason = %suspicion,
                "Dropping suspicious audio flush"
            );
            return IngestOutcome::Rejected(suspicion);
        }

        debug!(
            connection_id = %connection_id,
            chunks = chunk_count,
            bytes = bytes.len(),
            "Audio buffer flushed"
        );
        IngestOutcome::Flushed(FlushedAudio { bytes, chunk_count })
    }

    /// A client marked a fragment as the start of a new recording: leftovers
    /// of the previous one can no longer be merged with it and are dropped.
    ///
    /// Returns the number of chunks discarded.
    pub fn start_recording(&self, connection_id: &str) -> usize {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.remove(connection_id).map_or(0, |b| b.chunks.len())
    }

    /// Drop anything buffered for a connection (disconnect).
    pub fn discard(&self, connection_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.remove(connection_id);
    }

    /// Number of chunks currently buffered for a connection.
    pub fn buffered_chunks(&self, connection_id: &str) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.get(connection_id).map_or(0, |b| b.chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn speech_like(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    fn buffer() -> AudioIngestionBuffer {
        AudioIngestionBuffer::new(&AppConfig::default().audio)
    }

    fn assert_sizes_consistent(bytes: &[u8]) {
        let (riff, data) = container::declared_sizes(bytes).expect("container");
        assert_eq!(riff as usize, bytes.len() - 8);
        assert_eq!(data as usize, bytes.len() - container::WAV_HEADER_LEN);
    }

    #[test]
    fn test_large_chunk_flushes_immediately() {
        let buffer = buffer();
        let outcome = buffer.push("teacher", speech_like(40_000, 1), false, Instant::now());

        match outcome {
            IngestOutcome::Flushed(flushed) => {
                assert_eq!(flushed.chunk_count, 1);
                assert_eq!(flushed.bytes.len(), 40_000 + container::WAV_HEADER_LEN);
                assert_sizes_consistent(&flushed.bytes);
            }
            other => panic!("expected flush, got {:?}", other),
        }
        assert_eq!(buffer.buffered_chunks("teacher"), 0);
    }

    #[test]
    fn test_small_chunks_accumulate_into_one_flush() {
        let buffer = buffer();
        let start = Instant::now();
        let mut flushes = Vec::new();

        for i in 0..3u32 {
            let at = start + Duration::from_millis(200 * u64::from(i));
            if let IngestOutcome::Flushed(flushed) =
                buffer.push("teacher", speech_like(2000, i + 10), false, at)
            {
                flushes.push(flushed);
            }
        }

        assert_eq!(flushes.len(), 1);
        let flushed = &flushes[0];
        assert_eq!(flushed.chunk_count, 3);
        assert_eq!(flushed.bytes.len(), container::WAV_HEADER_LEN + 6000);
        assert_sizes_consistent(&flushed.bytes);
    }

    #[test]
    fn test_chunks_below_threshold_are_only_acknowledged() {
        let buffer = buffer();
        let start = Instant::now();

        let outcome = buffer.push("teacher", speech_like(1500, 3), false, start);
        assert_eq!(
            outcome,
            IngestOutcome::Buffered { chunks: 1, total_bytes: 1544 }
        );
        assert_eq!(buffer.buffered_chunks("teacher"), 1);
    }

    #[test]
    fn test_silence_gap_flushes_multi_chunk_buffer() {
        let buffer = buffer();
        let start = Instant::now();

        buffer.push("teacher", speech_like(1500, 4), false, start);
        let outcome = buffer.push(
            "teacher",
            speech_like(1500, 5),
            false,
            start + Duration::from_millis(2500),
        );

        match outcome {
            IngestOutcome::Flushed(flushed) => {
                assert_eq!(flushed.chunk_count, 2);
                assert_sizes_consistent(&flushed.bytes);
            }
            other => panic!("expected flush, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_exactly_at_threshold_does_not_flush() {
        let buffer = buffer();
        let start = Instant::now();

        buffer.push("teacher", speech_like(1000, 6), false, start);
        let outcome = buffer.push(
            "teacher",
            speech_like(1000, 7),
            false,
            start + Duration::from_millis(2000),
        );
        assert!(matches!(outcome, IngestOutcome::Buffered { chunks: 2, .. }));
    }

    #[test]
    fn test_final_chunk_forces_flush() {
        let buffer = buffer();
        let outcome = buffer.push("teacher", speech_like(900, 8), true, Instant::now());
        assert!(matches!(outcome, IngestOutcome::Flushed(_)));
    }

    #[test]
    fn test_buffer_is_bounded_to_most_recent_chunks() {
        let mut config = AppConfig::default().audio;
        config.max_buffered_chunks = 3;
        config.min_flush_bytes = 1_000_000;
        let buffer = AudioIngestionBuffer::new(&config);
        let start = Instant::now();

        let mut last = None;
        for i in 0..5u32 {
            last = Some(buffer.push("teacher", speech_like(500, i), false, start));
        }
        assert_eq!(buffer.buffered_chunks("teacher"), 3);
        assert_eq!(
            last,
            Some(IngestOutcome::Buffered { chunks: 3, total_bytes: 3 * 544 })
        );
    }

    #[test]
    fn test_connections_are_isolated() {
        let buffer = buffer();
        let now = Instant::now();

        buffer.push("a", speech_like(1000, 1), false, now);
        buffer.push("b", speech_like(1000, 2), false, now);
        buffer.discard("a");

        assert_eq!(buffer.buffered_chunks("a"), 0);
        assert_eq!(buffer.buffered_chunks("b"), 1);
    }

    #[test]
    fn test_suspicious_flush_is_rejected_and_cleared() {
        let buffer = buffer();
        let outcome = buffer.push("teacher", vec![0u8; 6000], false, Instant::now());

        assert!(matches!(outcome, IngestOutcome::Rejected(_)));
        assert_eq!(buffer.buffered_chunks("teacher"), 0);
    }

    #[test]
    fn test_applied_config_changes_flush_threshold() {
        let buffer = buffer();
        let start = Instant::now();
        assert!(matches!(
            buffer.push("teacher", speech_like(6000, 20), false, start),
            IngestOutcome::Flushed(_)
        ));

        let mut config = AppConfig::default().audio;
        config.min_flush_bytes = 1_000_000;
        buffer.apply_config(&config);

        assert_eq!(
            buffer.push("teacher", speech_like(6000, 21), false, start),
            IngestOutcome::Buffered { chunks: 1, total_bytes: 6044 }
        );

        config.min_flush_bytes = 5000;
        buffer.apply_config(&config);
        assert!(matches!(
            buffer.push("teacher", speech_like(100, 22), false, start),
            IngestOutcome::Flushed(FlushedAudio { chunk_count: 2, .. })
        ));
    }

    #[test]
    fn test_applied_config_toggles_screening() {
        let buffer = buffer();
        let mut config = AppConfig::default().audio;
        config.screen_suspicious_input = false;
        buffer.apply_config(&config);

        let outcome = buffer.push("teacher", vec![0u8; 6000], false, Instant::now());
        assert!(matches!(outcome, IngestOutcome::Flushed(_)));
    }

    #[test]
    fn test_new_recording_drops_leftover_chunks() {
        let buffer = buffer();
        let start = Instant::now();
        buffer.push("teacher", speech_like(1000, 30), false, start);
        buffer.push("teacher", speech_like(1000, 31), false, start);

        assert_eq!(buffer.start_recording("teacher"), 2);
        assert_eq!(buffer.start_recording("teacher"), 0);

        let outcome = buffer.push("teacher", speech_like(1000, 32), false, start);
        assert!(matches!(outcome, IngestOutcome::Buffered { chunks: 1, .. }));
    }
}
