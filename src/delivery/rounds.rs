//! # Utterance Rounds
//!
//! Takes flushed teacher audio off the connection's message worker and runs
//! transcribe → `transcription` broadcast → delivery round on a per-session
//! task. A session's utterances are processed in flush order; sessions never
//! wait on each other.

use crate::delivery::engine::{BroadcastDeliveryEngine, DeliveryReport, DeliveryRequest};
use crate::pipeline::TieredFallbackPipeline;
use crate::realtime::dispatcher::MessageSender;
use crate::realtime::messages::OutboundMessage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Utterances queued per session before new ones are dropped.
pub const ROUND_QUEUE_CAPACITY: usize = 64;

/// One flushed utterance awaiting transcription and delivery.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub session_id: String,
    pub source_language: String,
    pub audio: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundQueueSnapshot {
    pub active_sessions: usize,
    pub submitted: u64,
    pub dropped: u64,
}

/// Per-session queues of pending utterances.
pub struct RoundScheduler {
    worker: RoundWorker,
    queues: Mutex<HashMap<String, mpsc::Sender<Utterance>>>,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl RoundScheduler {
    pub fn new(
        pipeline: Arc<TieredFallbackPipeline>,
        sender: Arc<dyn MessageSender>,
        delivery: Arc<BroadcastDeliveryEngine>,
    ) -> Self {
        Self {
            worker: RoundWorker { pipeline, sender, delivery },
            queues: Mutex::new(HashMap::new()),
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an utterance without waiting for it to be processed.
    ///
    /// The session's worker task is started on first use, or restarted if the
    /// previous one has stopped.
    pub fn submit(&self, utterance: Utterance) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);

        let utterance = match queues.get(&utterance.session_id) {
            Some(tx) => match tx.try_send(utterance) {
                Ok(()) => {
                    self.submitted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(utterance)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session_id = %utterance.session_id,
                        capacity = ROUND_QUEUE_CAPACITY,
                        "Round queue full, dropping utterance"
                    );
                    return;
                }
                Err(TrySendError::Closed(utterance)) => utterance,
            },
            None => utterance,
        };

        let session_id = utterance.session_id.clone();
        let (tx, rx) = mpsc::channel(ROUND_QUEUE_CAPACITY);
        if tx.try_send(utterance).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(self.worker.clone().run(session_id.clone(), rx));
        debug!(session_id = %session_id, "Round worker started");
        queues.insert(session_id, tx);
    }

    /// Stop accepting utterances for a session; queued ones still finish.
    pub fn close(&self, session_id: &str) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues.remove(session_id).is_some() {
            debug!(session_id = %session_id, "Round queue closed");
        }
    }

    pub fn snapshot(&self) -> RoundQueueSnapshot {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        RoundQueueSnapshot {
            active_sessions: queues.len(),
            submitted: self.submitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
struct RoundWorker {
    pipeline: Arc<TieredFallbackPipeline>,
    sender: Arc<dyn MessageSender>,
    delivery: Arc<BroadcastDeliveryEngine>,
}

impl RoundWorker {
    async fn run(self, session_id: String, mut rx: mpsc::Receiver<Utterance>) {
        while let Some(utterance) = rx.recv().await {
            self.process(utterance).await;
        }
        debug!(session_id = %session_id, "Round worker stopped");
    }

    async fn process(&self, utterance: Utterance) -> Option<DeliveryReport> {
        let Utterance { session_id, source_language, audio } = utterance;

        let transcript = self.pipeline.transcribe(&audio, &source_language).await;
        if transcript.value.is_empty() {
            debug!(session_id = %session_id, "Empty transcript, nothing to deliver");
            return None;
        }

        info!(
            session_id = %session_id,
            provider = ?transcript.timing.provider,
            duration_ms = transcript.timing.duration_ms,
            chars = transcript.value.len(),
            "Utterance transcribed"
        );

        self.sender
            .broadcast_to_session(
                &session_id,
                &OutboundMessage::Transcription {
                    session_id: session_id.clone(),
                    text: transcript.value.clone(),
                    source_language: source_language.clone(),
                    is_final: true,
                },
            )
            .await;

        let report = self
            .delivery
            .deliver(DeliveryRequest {
                session_id,
                source_text: transcript.value,
                source_language,
                transcription: Some(transcript.timing),
            })
            .await;
        Some(report)
    }
}
