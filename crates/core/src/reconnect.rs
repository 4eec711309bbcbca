//! Bounded exponential-backoff reconnection.
//!
//! The scheduler owns at most one pending retry timer. A transport failure
//! calls [`ReconnectionScheduler::schedule`]; a successful connect calls
//! [`ReconnectionScheduler::reset`]; teardown calls
//! [`ReconnectionScheduler::cancel`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `delay(n) = min(base * multiplier^(n - 1), max_delay)` for attempt `n >= 1`.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(
        base: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Result<Self, String> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1, got {}", multiplier));
        }
        if max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if max_delay < base {
            return Err("max_delay must not be shorter than base".to_string());
        }
        Ok(Self {
            base,
            multiplier,
            max_delay,
            max_attempts,
        })
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Scheduled,
    Attempting,
    Exhausted,
}

/// Result of asking the scheduler for another retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { attempt: u32, delay: Duration },
    AlreadyPending,
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
struct SchedulerState {
    attempts: u32,
    phase: ReconnectPhase,
    pending: Option<JoinHandle<()>>,
}

/// Schedules reconnection attempts for one controller.
#[derive(Debug, Clone)]
pub struct ReconnectionScheduler {
    policy: BackoffPolicy,
    state: Arc<Mutex<SchedulerState>>,
}

impl ReconnectionScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(SchedulerState {
                attempts: 0,
                phase: ReconnectPhase::Idle,
                pending: None,
            })),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.lock().phase
    }

    /// Arms a retry timer that runs `retry` after the backoff delay.
    ///
    /// No-op while a timer is already pending. Once `max_attempts` retries
    /// have been scheduled the scheduler is exhausted and stays so until
    /// [`ReconnectionScheduler::reset`].
    pub fn schedule<F, Fut>(&self, retry: F) -> ScheduleOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        if state.pending.is_some() {
            debug!("Reconnect already pending; ignoring schedule request");
            return ScheduleOutcome::AlreadyPending;
        }
        if state.phase == ReconnectPhase::Exhausted || state.attempts >= self.policy.max_attempts {
            state.phase = ReconnectPhase::Exhausted;
            warn!(attempts = state.attempts, "Reconnection attempts exhausted");
            return ScheduleOutcome::Exhausted {
                attempts: state.attempts,
            };
        }

        state.attempts += 1;
        let attempt = state.attempts;
        let delay = self.policy.delay_for(attempt);
        state.phase = ReconnectPhase::Scheduled;

        let shared = self.state.clone();
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Detach before running so a cancel during the attempt does
                // not abort a half-finished handshake.
                let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                state.pending = None;
                state.phase = ReconnectPhase::Attempting;
            }
            info!(attempt, "Attempting reconnection");
            retry().await;
        }));

        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnection scheduled");
        ScheduleOutcome::Scheduled { attempt, delay }
    }

    /// Called after a successful connect.
    pub fn reset(&self) {
        let mut state = self.lock();
        if let Some(handle) = state.pending.take() {
            handle.abort();
        }
        state.attempts = 0;
        state.phase = ReconnectPhase::Idle;
    }

    /// Drops any pending timer. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        let had_pending = match state.pending.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        if state.phase != ReconnectPhase::Exhausted {
            state.phase = ReconnectPhase::Idle;
        }
        had_pending
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(1000),
            2.0,
            Duration::from_millis(5000),
            max_attempts,
        )
        .unwrap()
    }

    #[test]
    fn test_delay_follows_capped_exponential() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
        assert_eq!(p.delay_for(4), Duration::from_millis(5000));
        assert_eq!(p.delay_for(60), Duration::from_millis(5000));
    }

    #[test]
    fn test_policy_validation() {
        assert!(BackoffPolicy::new(Duration::from_secs(1), 0.5, Duration::from_secs(5), 3).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(5), 0).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(6), 2.0, Duration::from_secs(5), 3).is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), 1.0, Duration::from_secs(1), 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fires_after_delay() {
        let scheduler = ReconnectionScheduler::new(policy(3));
        let fired = Arc::new(AtomicU32::new(0));

        let counter = fired.clone();
        let outcome = scheduler.schedule(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(scheduler.phase(), ReconnectPhase::Scheduled);

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.phase(), ReconnectPhase::Attempting);
        assert!(!scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_timer_pending() {
        let scheduler = ReconnectionScheduler::new(policy(3));
        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = fired.clone();
            scheduler.schedule(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.attempts(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_never_exceed_max() {
        let scheduler = ReconnectionScheduler::new(policy(3));
        let mut delays = Vec::new();

        for _ in 0..6 {
            match scheduler.schedule(|| async {}) {
                ScheduleOutcome::Scheduled { delay, .. } => delays.push(delay),
                ScheduleOutcome::Exhausted { attempts } => assert_eq!(attempts, 3),
                ScheduleOutcome::AlreadyPending => panic!("timer should have fired"),
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );
        assert_eq!(scheduler.attempts(), 3);
        assert_eq!(scheduler.phase(), ReconnectPhase::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_backoff() {
        let scheduler = ReconnectionScheduler::new(policy(3));
        scheduler.schedule(|| async {});
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.schedule(|| async {});
        assert_eq!(scheduler.attempts(), 2);

        scheduler.reset();
        assert_eq!(scheduler.attempts(), 0);
        assert_eq!(scheduler.phase(), ReconnectPhase::Idle);
        assert!(!scheduler.has_pending());

        let outcome = scheduler.schedule(|| async {});
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_retry() {
        let scheduler = ReconnectionScheduler::new(policy(3));
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        scheduler.schedule(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
