//! # Translation Delivery
//!
//! Per-language fan-out of teacher utterances to students.
//!
//! ## Key Components:
//! - **Engine**: groups students by language, translates once per group and
//!   unicasts shaped results with bounded retries
//! - **Shaping**: term locking and low-literacy simplification per student
//! - **Persistence**: best-effort record of every delivered group
//! - **Rounds**: per-session queues that transcribe and deliver flushed audio
//!   off the connection's message worker

pub mod engine;
pub mod persistence;
pub mod rounds;
pub mod shaping;

pub use engine::{
    BroadcastDeliveryEngine, DeliveryReport, DeliveryRequest, DeliveryStatsSnapshot,
    LanguageOutcome, TranslationDeliveryJob, TRANSLATION_UNAVAILABLE,
};
pub use persistence::{
    ChannelTranslationStore, PersistenceError, TranslationLogActor, TranslationRecord,
    TranslationStore,
};
pub use rounds::{RoundQueueSnapshot, RoundScheduler, Utterance};
pub use shaping::{shape_for_listener, simplify_for_low_literacy, ListenerSettings, TermGlossary};
