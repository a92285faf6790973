//! # Session Lifecycle Manager
//!
//! Drives sessions through `ActiveEmpty` / `ActiveWithStudents` /
//! `GracePeriod` / `Inactive` and reclaims abandoned sessions.
//!
//! ## Timeout Rules (all strict "exceeds" comparisons):
//! - **Empty teacher**: no student joined within `empty_teacher_timeout` of `start_time`
//! - **Grace period**: the last student left more than `grace_period` ago
//! - **Inactivity**: `last_activity_at` older than `inactivity_timeout`, in any state
//!
//! ## Concurrency:
//! Deactivation is a compare-and-set on the store, so overlapping sweeps and
//! manual termination never end a session twice or append a second reason.

use crate::config::LifecycleConfig;
use crate::pipeline::same_language;
use crate::session::store::{SessionStore, StoreError};
use crate::session::{Session, SessionState, GRACE_MARKER};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reason recorded when a newer teacher registration replaces a session.
pub const SUPERSEDED_REASON: &str = "superseded";

/// Told about every session this manager ends.
#[async_trait]
pub trait SessionEndNotifier: Send + Sync {
    async fn session_ended(&self, session_id: &str, reason: &str);
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub ended: Vec<EndedSession>,
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndedSession {
    pub session_id: String,
    pub reason: String,
}

pub struct SessionLifecycleManager {
    store: Arc<dyn SessionStore>,
    timeouts: RwLock<LifecycleConfig>,
    notifier: RwLock<Option<Arc<dyn SessionEndNotifier>>>,
}

impl SessionLifecycleManager {
    pub fn new(store: Arc<dyn SessionStore>, timeouts: &LifecycleConfig) -> Self {
        Self {
            store,
            timeouts: RwLock::new(timeouts.clone()),
            notifier: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Replace the timeout durations; takes effect on the next sweep.
    pub fn set_timeouts(&self, timeouts: &LifecycleConfig) {
        *self.timeouts.write().unwrap_or_else(PoisonError::into_inner) = timeouts.clone();
    }

    pub fn timeouts(&self) -> LifecycleConfig {
        self.timeouts.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_end_notifier(&self, notifier: Arc<dyn SessionEndNotifier>) {
        *self.notifier.write().unwrap_or_else(PoisonError::into_inner) = Some(notifier);
    }

    /// Register a teacher, creating or resuming its session.
    ///
    /// A requested session that is still active is resumed; otherwise a new
    /// session is created (with the requested id when that id is unused).
    /// Every other active session with the same teacher language is ended as
    /// superseded before the new one is returned.
    pub async fn register_teacher(
        &self,
        teacher_language: &str,
        requested_session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let existing = match requested_session_id {
            Some(id) => self.store.get(id).await?,
            None => None,
        };

        let session_id = match existing {
            Some(session) if session.is_active => session.session_id,
            ended => {
                // ids of ended sessions are never reused
                let id = match (requested_session_id, ended) {
                    (Some(id), None) => id.to_string(),
                    _ => Uuid::new_v4().to_string(),
                };
                self.store.insert(Session::new(&id, teacher_language, now)).await?;
                info!(session_id = %id, language = %teacher_language, "Session created");
                id
            }
        };

        for other in self.store.active().await? {
            if other.session_id != session_id
                && same_language(&other.teacher_language, teacher_language)
            {
                self.end_session(&other.session_id, SUPERSEDED_REASON, now).await?;
            }
        }

        self.update_session_activity(&session_id, now).await?;
        self.require(&session_id).await
    }

    /// A student joined (or rejoined) the session.
    ///
    /// Cancels a running grace period and clears the grace marker.
    pub async fn student_joined(
        &self,
        session_id: &str,
        student_language: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let language = student_language.to_string();
        let updated = self
            .store
            .modify(
                session_id,
                Box::new(move |session: &mut Session| {
                    if !session.is_active {
                        return false;
                    }
                    session.students_count += 1;
                    session.student_language = Some(language);
                    session.grace_started_at = None;
                    session.quality_reason = None;
                    true
                }),
            )
            .await?;

        if updated.is_active {
            debug!(session_id = %session_id, students = updated.students_count, "Student joined");
            self.update_session_activity(session_id, now).await?;
        }
        self.require(session_id).await
    }

    /// A student left; the last one leaving starts the grace period.
    pub async fn student_left(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let session = self
            .store
            .modify(
                session_id,
                Box::new(move |session: &mut Session| {
                    if !session.is_active || session.students_count == 0 {
                        return false;
                    }
                    session.students_count -= 1;
                    if session.students_count == 0 {
                        session.grace_started_at = Some(now);
                        session.quality_reason = Some(GRACE_MARKER.to_string());
                    }
                    true
                }),
            )
            .await?;

        if session.state() == SessionState::GracePeriod {
            info!(session_id = %session_id, "Last student left, grace period started");
        }
        Ok(session)
    }

    /// Record activity on a session. The only writer of `last_activity_at`.
    pub async fn update_session_activity(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .modify(
                session_id,
                Box::new(move |session: &mut Session| {
                    if !session.is_active || session.last_activity_at >= now {
                        return false;
                    }
                    session.last_activity_at = now;
                    true
                }),
            )
            .await?;
        Ok(())
    }

    /// Count delivered translations and refresh activity.
    pub async fn record_translations(
        &self,
        session_id: &str,
        delivered: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .modify(
                session_id,
                Box::new(move |session: &mut Session| {
                    session.total_translations += delivered;
                    delivered > 0
                }),
            )
            .await?;
        self.update_session_activity(session_id, now).await
    }

    /// End a session with a human-readable reason.
    ///
    /// Idempotent: ending an inactive session returns `Ok(false)` and changes nothing.
    pub async fn end_session(
        &self,
        session_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let ended = self.store.deactivate(session_id, reason, now).await?;
        if ended {
            info!(session_id = %session_id, reason = %reason, "Session ended");
            let notifier = self
                .notifier
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(notifier) = notifier {
                notifier.session_ended(session_id, reason).await;
            }
        } else {
            debug!(session_id = %session_id, "Session already inactive");
        }
        Ok(ended)
    }

    /// Evaluate every active session against the timeout rules.
    ///
    /// A failure to end one session is logged and left for the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let timeouts = self.timeouts();
        let mut report = SweepReport::default();

        for session in self.store.active().await? {
            report.examined += 1;
            let Some(reason) = expiry_reason(&session, &timeouts, now) else {
                continue;
            };

            match self.end_session(&session.session_id, &reason, now).await {
                Ok(true) => report.ended.push(EndedSession {
                    session_id: session.session_id,
                    reason,
                }),
                Ok(false) => {}
                Err(err) => {
                    report.failures += 1;
                    warn!(
                        session_id = %session.session_id,
                        error = %err,
                        "Failed to end expired session, will retry next sweep"
                    );
                }
            }
        }

        if !report.ended.is_empty() {
            info!(examined = report.examined, ended = report.ended.len(), "Lifecycle sweep finished");
        }
        Ok(report)
    }

    /// Run `sweep` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep(Utc::now()).await {
                    error!(error = %err, "Lifecycle sweep failed");
                }
            }
        })
    }

    async fn require(&self, session_id: &str) -> Result<Session, StoreError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }
}

/// Limits beyond what `TimeDelta` can represent never expire.
fn exceeds(now: DateTime<Utc>, since: DateTime<Utc>, limit_secs: u64) -> bool {
    let limit = i64::try_from(limit_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .unwrap_or(ChronoDuration::MAX);
    now.signed_duration_since(since) > limit
}

fn expiry_reason(
    session: &Session,
    timeouts: &LifecycleConfig,
    now: DateTime<Utc>,
) -> Option<String> {
    match session.state() {
        SessionState::GracePeriod => {
            let started = session.grace_started_at?;
            if exceeds(now, started, timeouts.grace_period_secs) {
                return Some(format!(
                    "grace period of {}s expired with no students",
                    timeouts.grace_period_secs
                ));
            }
        }
        SessionState::ActiveEmpty => {
            if exceeds(now, session.start_time, timeouts.empty_teacher_timeout_secs) {
                return Some(format!(
                    "no students joined within {}s",
                    timeouts.empty_teacher_timeout_secs
                ));
            }
        }
        SessionState::ActiveWithStudents | SessionState::Inactive => {}
    }

    if session.is_active && exceeds(now, session.last_activity_at, timeouts.inactivity_timeout_secs)
    {
        return Some(format!(
            "inactive for more than {}s",
            timeouts.inactivity_timeout_secs
        ));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::store::{InMemorySessionStore, SessionMutation};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn manager() -> SessionLifecycleManager {
        SessionLifecycleManager::new(
            Arc::new(InMemorySessionStore::new()),
            &AppConfig::default().lifecycle,
        )
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    #[derive(Default)]
    struct RecordingNotifier {
        ended: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SessionEndNotifier for RecordingNotifier {
        async fn session_ended(&self, session_id: &str, reason: &str) {
            self.ended
                .lock()
                .unwrap()
                .push((session_id.to_string(), reason.to_string()));
        }
    }

    #[tokio::test]
    async fn test_empty_teacher_timeout_boundary() {
        let manager = manager();
        let start = Utc::now();
        let session = manager.register_teacher("en", None, start).await.unwrap();
        let timeout = manager.timeouts().empty_teacher_timeout_secs as i64;

        let report = manager.sweep(start + secs(timeout - 1)).await.unwrap();
        assert!(report.ended.is_empty());

        let report = manager.sweep(start + secs(timeout)).await.unwrap();
        assert!(report.ended.is_empty());

        let report = manager.sweep(start + secs(timeout + 1)).await.unwrap();
        assert_eq!(report.ended.len(), 1);
        assert_eq!(report.ended[0].session_id, session.session_id);

        let stored = manager.store().get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.state(), SessionState::Inactive);
        assert!(stored.quality_reason.unwrap().contains(&timeout.to_string()));
    }

    #[tokio::test]
    async fn test_rejoin_during_grace_clears_marker() {
        let manager = manager();
        let start = Utc::now();
        let session = manager.register_teacher("en", None, start).await.unwrap();
        let id = session.session_id;

        manager.student_joined(&id, "es", start + secs(10)).await.unwrap();
        let left = manager.student_left(&id, start + secs(20)).await.unwrap();
        assert_eq!(left.state(), SessionState::GracePeriod);
        assert_eq!(left.quality_reason.as_deref(), Some(GRACE_MARKER));

        let rejoined = manager.student_joined(&id, "es", start + secs(60)).await.unwrap();
        assert_eq!(rejoined.state(), SessionState::ActiveWithStudents);
        assert_eq!(rejoined.quality_reason, None);
        assert_eq!(rejoined.last_activity_at, start + secs(60));

        let grace = manager.timeouts().grace_period_secs as i64;
        let report = manager.sweep(start + secs(20 + grace + 1)).await.unwrap();
        assert!(report.ended.is_empty());
    }

    #[tokio::test]
    async fn test_grace_expiry_records_timeout_in_reason() {
        let manager = manager();
        let start = Utc::now();
        let id = manager.register_teacher("en", None, start).await.unwrap().session_id;
        manager.student_joined(&id, "fr", start).await.unwrap();
        manager.student_left(&id, start + secs(5)).await.unwrap();

        let grace = manager.timeouts().grace_period_secs as i64;
        assert!(manager.sweep(start + secs(5 + grace)).await.unwrap().ended.is_empty());

        let report = manager.sweep(start + secs(5 + grace + 1)).await.unwrap();
        assert_eq!(report.ended.len(), 1);
        assert!(report.ended[0].reason.contains(&format!("{}s", grace)));
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let manager = manager();
        let now = Utc::now();
        let id = manager.register_teacher("en", None, now).await.unwrap().session_id;

        assert!(manager.end_session(&id, "teacher ended class", now).await.unwrap());
        let first = manager.store().get(&id).await.unwrap().unwrap();

        assert!(!manager.end_session(&id, "again", now + secs(30)).await.unwrap());
        let second = manager.store().get(&id).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(second.quality_reason.as_deref(), Some("teacher ended class"));
    }

    #[tokio::test]
    async fn test_new_teacher_supersedes_same_language() {
        let manager = manager();
        let notifier = Arc::new(RecordingNotifier::default());
        manager.set_end_notifier(notifier.clone());
        let now = Utc::now();

        let old = manager.register_teacher("en-US", None, now).await.unwrap();
        let other_language = manager.register_teacher("de", None, now).await.unwrap();
        let other_region = manager.register_teacher("en-GB", None, now).await.unwrap();
        let new = manager.register_teacher("en_us", None, now + secs(1)).await.unwrap();

        let active: Vec<String> = manager
            .store()
            .active()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert!(active.contains(&new.session_id));
        assert!(active.contains(&other_language.session_id));
        assert!(active.contains(&other_region.session_id));
        assert!(!active.contains(&old.session_id));

        let ended = notifier.ended.lock().unwrap().clone();
        assert_eq!(ended, vec![(old.session_id, SUPERSEDED_REASON.to_string())]);
    }

    #[tokio::test]
    async fn test_teacher_reconnect_resumes_active_session() {
        let manager = manager();
        let now = Utc::now();
        let first = manager.register_teacher("en", Some("room-1"), now).await.unwrap();
        assert_eq!(first.session_id, "room-1");

        let again = manager
            .register_teacher("en", Some("room-1"), now + secs(5))
            .await
            .unwrap();
        assert_eq!(again.session_id, "room-1");
        assert!(again.is_active);
        assert_eq!(again.last_activity_at, now + secs(5));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeouts_never_expire() {
        let timeouts = LifecycleConfig {
            empty_teacher_timeout_secs: u64::MAX,
            grace_period_secs: 10_000_000_000_000_000,
            inactivity_timeout_secs: i64::MAX as u64,
            sweep_interval_secs: 60,
        };
        let manager = SessionLifecycleManager::new(Arc::new(InMemorySessionStore::new()), &timeouts);
        let start = Utc::now();
        manager.register_teacher("en", None, start).await.unwrap();
        let left = manager.register_teacher("fr", None, start).await.unwrap().session_id;
        manager.student_joined(&left, "es", start).await.unwrap();
        manager.student_left(&left, start).await.unwrap();

        let report = manager.sweep(start + secs(365 * 24 * 60 * 60)).await.unwrap();
        assert_eq!(report.examined, 2);
        assert!(report.ended.is_empty());

        assert!(!exceeds(start + secs(1), start, u64::MAX));
        assert!(exceeds(start + secs(11), start, 10));
    }

    #[tokio::test]
    async fn test_stale_session_with_students_is_reclaimed() {
        let manager = manager();
        let start = Utc::now();
        let id = manager.register_teacher("en", None, start).await.unwrap().session_id;
        manager.student_joined(&id, "es", start).await.unwrap();

        let limit = manager.timeouts().inactivity_timeout_secs as i64;
        let report = manager.sweep(start + secs(limit + 1)).await.unwrap();
        assert_eq!(report.ended.len(), 1);
        assert!(report.ended[0].reason.starts_with("inactive"));
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_end_once() {
        let manager = Arc::new(manager());
        let notifier = Arc::new(RecordingNotifier::default());
        manager.set_end_notifier(notifier.clone());
        let start = Utc::now();
        manager.register_teacher("en", None, start).await.unwrap();

        let later = start + secs(manager.timeouts().empty_teacher_timeout_secs as i64 + 1);
        let (a, b) = tokio::join!(manager.sweep(later), manager.sweep(later));
        let total = a.unwrap().ended.len() + b.unwrap().ended.len();

        assert_eq!(total, 1);
        assert_eq!(notifier.ended.lock().unwrap().len(), 1);
    }

    struct FlakyStore {
        inner: InMemorySessionStore,
        fail_deactivate: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn insert(&self, session: Session) -> Result<(), StoreError> {
            self.inner.insert(session).await
        }
        async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.get(session_id).await
        }
        async fn list(&self) -> Result<Vec<Session>, StoreError> {
            self.inner.list().await
        }
        async fn active(&self) -> Result<Vec<Session>, StoreError> {
            self.inner.active().await
        }
        async fn modify(
            &self,
            session_id: &str,
            mutation: SessionMutation,
        ) -> Result<Session, StoreError> {
            self.inner.modify(session_id, mutation).await
        }
        async fn deactivate(
            &self,
            session_id: &str,
            reason: &str,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            if self.fail_deactivate.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.deactivate(session_id, reason, at).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_retried_next_sweep() {
        let store = Arc::new(FlakyStore {
            inner: InMemorySessionStore::new(),
            fail_deactivate: AtomicBool::new(true),
        });
        let manager = SessionLifecycleManager::new(store.clone(), &AppConfig::default().lifecycle);
        let start = Utc::now();
        manager.register_teacher("en", None, start).await.unwrap();

        let later = start + secs(manager.timeouts().empty_teacher_timeout_secs as i64 + 1);
        let report = manager.sweep(later).await.unwrap();
        assert_eq!(report.failures, 1);
        assert!(report.ended.is_empty());

        store.fail_deactivate.store(false, Ordering::SeqCst);
        let report = manager.sweep(later).await.unwrap();
        assert_eq!(report.ended.len(), 1);
    }
}
