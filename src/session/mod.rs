//! # Sessions
//!
//! A session groups one teacher and any number of students. Exactly one
//! session is active per teacher language at a time.
//!
//! ## Lifecycle States:
//! - **ActiveEmpty**: teacher only, no students present
//! - **ActiveWithStudents**: at least one student connected
//! - **GracePeriod**: students were present, now zero, countdown running
//! - **Inactive**: terminal

pub mod lifecycle;
pub mod store;

pub use lifecycle::{SessionLifecycleManager, SweepReport};
pub use store::{InMemorySessionStore, SessionMutation, SessionStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker stored in `quality_reason` while a session waits for students to return.
pub const GRACE_MARKER: &str = "grace_period";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    ActiveEmpty,
    ActiveWithStudents,
    GracePeriod,
    Inactive,
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub teacher_language: String,
    /// Most recently joined student's language
    pub student_language: Option<String>,
    pub is_active: bool,
    pub students_count: u32,
    pub start_time: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub quality: Option<String>,
    /// Audit trail for why a session ended, or the grace marker
    pub quality_reason: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_translations: u64,
    pub grace_started_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(session_id: &str, teacher_language: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            teacher_language: teacher_language.to_string(),
            student_language: None,
            is_active: true,
            students_count: 0,
            start_time: now,
            last_activity_at: now,
            quality: None,
            quality_reason: None,
            end_time: None,
            total_translations: 0,
            grace_started_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        if !self.is_active {
            SessionState::Inactive
        } else if self.grace_started_at.is_some() {
            SessionState::GracePeriod
        } else if self.students_count > 0 {
            SessionState::ActiveWithStudents
        } else {
            SessionState::ActiveEmpty
        }
    }
}
