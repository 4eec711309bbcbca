//! Usage accumulation and the once-per-session accounting submission.
//!
//! The accounting sink does not deduplicate, so the guard lives here: a
//! session id enters the finalized set under the lock before its record is
//! submitted. Racing teardown paths, and any later ledger reusing the id, see
//! it there and get [`FinalizeOutcome::AlreadyFinalized`].

use crate::{
    collaborators::UsageSink,
    error::SessionError,
    model::{Attribution, EndReason, UsageCounters, UsageRecord},
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Estimated text tokens for an utterance: one token per four characters.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimated audio tokens for `seconds` of audio.
pub fn estimate_audio_tokens(seconds: f64, tokens_per_minute: f64) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * tokens_per_minute / 60.0).ceil() as u64
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Submitted(UsageRecord),
    AlreadyFinalized,
    /// No ledger exists for the requested session.
    NoSession,
    /// The record was built but the sink rejected it. It is not retried.
    SubmissionFailed(SessionError),
}

#[derive(Debug)]
struct Ledger {
    session_id: String,
    start_time: DateTime<Utc>,
    started: Instant,
    attribution: Attribution,
    counters: UsageCounters,
}

#[derive(Debug, Default)]
struct Books {
    ledger: Option<Ledger>,
    finalized: HashSet<String>,
}

impl Books {
    fn is_open(&self) -> bool {
        self.ledger
            .as_ref()
            .is_some_and(|l| !self.finalized.contains(&l.session_id))
    }
}

/// Accumulates usage counters for the current session.
pub struct UsageAccountant {
    sink: Arc<dyn UsageSink>,
    audio_tokens_per_minute: f64,
    books: Mutex<Books>,
}

impl UsageAccountant {
    pub fn new(sink: Arc<dyn UsageSink>, audio_tokens_per_minute: f64) -> Self {
        Self {
            sink,
            audio_tokens_per_minute,
            books: Mutex::new(Books::default()),
        }
    }

    /// Starts a fresh ledger for `session_id`.
    ///
    /// A ledger for an id that was already finalized stays closed: it counts
    /// nothing and is never submitted again.
    pub fn begin(&self, session_id: &str, start_time: DateTime<Utc>, attribution: Attribution) {
        let mut books = self.lock();
        if books.is_open() {
            if let Some(previous) = books.ledger.as_ref() {
                warn!(
                    previous = %previous.session_id,
                    next = %session_id,
                    "Starting a new ledger before the previous session was finalized"
                );
            }
        }
        if books.finalized.contains(session_id) {
            warn!(session_id, "Session was already accounted; its usage will not be submitted again");
        }
        books.ledger = Some(Ledger {
            session_id: session_id.to_string(),
            start_time,
            started: Instant::now(),
            attribution,
            counters: UsageCounters::default(),
        });
    }

    pub fn add_text_input_tokens(&self, tokens: u64) {
        self.update(|c| c.text_input_tokens += tokens);
    }

    pub fn add_text_output_tokens(&self, tokens: u64) {
        self.update(|c| c.text_output_tokens += tokens);
    }

    pub fn add_audio_input_seconds(&self, seconds: f64) {
        if seconds > 0.0 {
            self.update(|c| c.audio_input_seconds += seconds);
        }
    }

    pub fn add_audio_output_seconds(&self, seconds: f64) {
        if seconds > 0.0 {
            self.update(|c| c.audio_output_seconds += seconds);
        }
    }

    pub fn mark_error(&self) {
        self.update(|c| c.error_occurred = true);
    }

    /// Snapshot of the current session's counters.
    pub fn counters(&self) -> Option<UsageCounters> {
        self.lock().ledger.as_ref().map(|l| l.counters.clone())
    }

    pub fn current_session(&self) -> Option<String> {
        self.lock().ledger.as_ref().map(|l| l.session_id.clone())
    }

    pub fn is_finalized(&self, session_id: &str) -> bool {
        self.lock().finalized.contains(session_id)
    }

    /// Computes and submits the usage record for `session_id`, at most once.
    pub async fn finalize(&self, session_id: &str, reason: EndReason) -> FinalizeOutcome {
        let record = {
            let mut books = self.lock();
            if books.finalized.contains(session_id) {
                return FinalizeOutcome::AlreadyFinalized;
            }
            let Some(ledger) = books.ledger.as_ref().filter(|l| l.session_id == session_id) else {
                return FinalizeOutcome::NoSession;
            };
            let record = self.build_record(ledger, reason);
            books.finalized.insert(session_id.to_string());
            record
        };

        info!(
            session_id = %record.session_id,
            reason = %record.end_reason,
            duration_seconds = record.duration_seconds,
            "Submitting session usage"
        );
        match self.sink.submit(record.clone()).await {
            Ok(()) => FinalizeOutcome::Submitted(record),
            Err(e) => {
                let err = SessionError::AccountingSubmissionFailed(format!("{:#}", e));
                error!(session_id = %record.session_id, error = %err, "Usage submission failed");
                FinalizeOutcome::SubmissionFailed(err)
            }
        }
    }

    fn build_record(&self, ledger: &Ledger, reason: EndReason) -> UsageRecord {
        let counters = &ledger.counters;
        UsageRecord {
            session_id: ledger.session_id.clone(),
            gym_id: ledger.attribution.gym_id.clone(),
            franchise_id: ledger.attribution.franchise_id.clone(),
            start_time: ledger.start_time,
            duration_seconds: ledger.started.elapsed().as_secs_f64(),
            text_input_tokens: counters.text_input_tokens,
            text_output_tokens: counters.text_output_tokens,
            audio_input_tokens: estimate_audio_tokens(
                counters.audio_input_seconds,
                self.audio_tokens_per_minute,
            ),
            audio_output_tokens: estimate_audio_tokens(
                counters.audio_output_seconds,
                self.audio_tokens_per_minute,
            ),
            error_occurred: counters.error_occurred,
            end_reason: reason,
        }
    }

    /// Counters of a finalized ledger are frozen.
    fn update(&self, apply: impl FnOnce(&mut UsageCounters)) {
        let mut books = self.lock();
        if !books.is_open() {
            return;
        }
        if let Some(ledger) = books.ledger.as_mut() {
            apply(&mut ledger.counters);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockUsageSink;
    use anyhow::anyhow;
    use std::time::Duration;

    fn attribution() -> Attribution {
        Attribution {
            gym_id: Some("gym_1".to_string()),
            franchise_id: Some("fr_1".to_string()),
            complete: true,
        }
    }

    #[test]
    fn test_text_token_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("Bonjour"), 2);
        // Counted in characters, not bytes.
        assert_eq!(estimate_text_tokens("éééé"), 1);
    }

    #[test]
    fn test_audio_token_estimate() {
        assert_eq!(estimate_audio_tokens(0.0, 600.0), 0);
        assert_eq!(estimate_audio_tokens(60.0, 600.0), 600);
        assert_eq!(estimate_audio_tokens(3.0, 600.0), 30);
        assert_eq!(estimate_audio_tokens(0.05, 600.0), 1);
        assert_eq!(estimate_audio_tokens(-2.0, 600.0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_builds_record() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit().times(1).returning(|_| Ok(()));
        let accountant = UsageAccountant::new(Arc::new(sink), 600.0);

        accountant.begin("sess_1", Utc::now(), attribution());
        accountant.add_text_input_tokens(3);
        accountant.add_text_output_tokens(2);
        accountant.add_audio_input_seconds(3.0);
        accountant.add_audio_output_seconds(4.0);
        tokio::time::advance(Duration::from_secs(12)).await;

        match accountant.finalize("sess_1", EndReason::UserAction).await {
            FinalizeOutcome::Submitted(record) => {
                assert_eq!(record.session_id, "sess_1");
                assert_eq!(record.gym_id.as_deref(), Some("gym_1"));
                assert_eq!(record.franchise_id.as_deref(), Some("fr_1"));
                assert_eq!(record.duration_seconds, 12.0);
                assert_eq!(record.text_input_tokens, 3);
                assert_eq!(record.text_output_tokens, 2);
                assert_eq!(record.audio_input_tokens, 30);
                assert_eq!(record.audio_output_tokens, 40);
                assert!(!record.error_occurred);
                assert_eq!(record.end_reason, EndReason::UserAction);
            }
            other => panic!("expected submission, got {:?}", other),
        }
        assert!(accountant.is_finalized("sess_1"));
    }

    #[tokio::test]
    async fn test_concurrent_finalize_submits_once() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit().times(1).returning(|_| Ok(()));
        let accountant = Arc::new(UsageAccountant::new(Arc::new(sink), 600.0));
        accountant.begin("sess_1", Utc::now(), attribution());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let accountant = accountant.clone();
                let reason = if i % 2 == 0 {
                    EndReason::UserAction
                } else {
                    EndReason::OwnerTeardown
                };
                tokio::spawn(async move { accountant.finalize("sess_1", reason).await })
            })
            .collect();

        let mut submitted = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                FinalizeOutcome::Submitted(_) => submitted += 1,
                FinalizeOutcome::AlreadyFinalized => duplicates += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(submitted, 1);
        assert_eq!(duplicates, 15);
    }

    #[tokio::test]
    async fn test_finalize_without_session_is_noop() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit().never();
        let accountant = UsageAccountant::new(Arc::new(sink), 600.0);

        assert_eq!(
            accountant.finalize("sess_missing", EndReason::UserAction).await,
            FinalizeOutcome::NoSession
        );
        accountant.add_text_input_tokens(5);
        assert_eq!(accountant.counters(), None);
    }

    #[tokio::test]
    async fn test_submission_failure_is_not_retried() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit()
            .times(1)
            .returning(|_| Err(anyhow!("accounting endpoint returned 500")));
        let accountant = UsageAccountant::new(Arc::new(sink), 600.0);
        accountant.begin("sess_1", Utc::now(), attribution());

        match accountant.finalize("sess_1", EndReason::Error).await {
            FinalizeOutcome::SubmissionFailed(SessionError::AccountingSubmissionFailed(msg)) => {
                assert!(msg.contains("500"))
            }
            other => panic!("expected submission failure, got {:?}", other),
        }
        assert_eq!(
            accountant.finalize("sess_1", EndReason::Error).await,
            FinalizeOutcome::AlreadyFinalized
        );
    }

    #[tokio::test]
    async fn test_counters_frozen_after_finalize() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit().returning(|_| Ok(()));
        let accountant = UsageAccountant::new(Arc::new(sink), 600.0);
        accountant.begin("sess_1", Utc::now(), attribution());
        accountant.add_text_output_tokens(2);
        accountant.mark_error();

        accountant.finalize("sess_1", EndReason::Error).await;
        accountant.add_text_output_tokens(10);

        let counters = accountant.counters().unwrap();
        assert_eq!(counters.text_output_tokens, 2);
        assert!(counters.error_occurred);
    }

    #[tokio::test]
    async fn test_new_ledger_per_session() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit().times(2).returning(|_| Ok(()));
        let accountant = UsageAccountant::new(Arc::new(sink), 600.0);

        accountant.begin("sess_1", Utc::now(), attribution());
        accountant.finalize("sess_1", EndReason::UserAction).await;
        accountant.begin("sess_2", Utc::now(), Attribution::default());
        assert_eq!(accountant.current_session().as_deref(), Some("sess_2"));
        assert_eq!(accountant.counters(), Some(UsageCounters::default()));

        assert_eq!(
            accountant.finalize("sess_1", EndReason::UserAction).await,
            FinalizeOutcome::AlreadyFinalized
        );
        assert_eq!(
            accountant.finalize("sess_9", EndReason::UserAction).await,
            FinalizeOutcome::NoSession
        );
        assert!(matches!(
            accountant.finalize("sess_2", EndReason::UserAction).await,
            FinalizeOutcome::Submitted(_)
        ));
    }

    #[tokio::test]
    async fn test_reused_session_id_is_not_submitted_twice() {
        let mut sink = MockUsageSink::new();
        sink.expect_submit().times(1).returning(|_| Ok(()));
        let accountant = UsageAccountant::new(Arc::new(sink), 600.0);

        accountant.begin("sess_1", Utc::now(), attribution());
        accountant.add_text_input_tokens(3);
        accountant.finalize("sess_1", EndReason::UserAction).await;

        accountant.begin("sess_1", Utc::now(), attribution());
        accountant.add_text_input_tokens(5);
        assert_eq!(accountant.counters(), Some(UsageCounters::default()));
        assert_eq!(
            accountant.finalize("sess_1", EndReason::OwnerTeardown).await,
            FinalizeOutcome::AlreadyFinalized
        );
        assert!(accountant.is_finalized("sess_1"));
    }
}
