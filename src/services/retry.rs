use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::store::{JobStore, StoreError};
use crate::models::job::{FailureKind, Job, JobPatch, JobStatus};

/// Exponential backoff bounded by a retry ceiling.
///
/// `delay_for(n) = min(base * 2^n, cap)`, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    ceiling: u32,
    base: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn new(ceiling: u32, base: Duration, cap: Duration) -> Self {
        Self {
            ceiling: ceiling.max(1),
            base,
            cap: cap.max(base),
        }
    }

    /// Maximum number of attempts of a retryable stage.
    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the delay has elapsed.
    RetryAfter(Duration),
    /// Non-retryable failure or ceiling reached.
    GiveUp,
}

/// Retry bookkeeping for one stage of one job: attempts so far and the
/// earliest instant the next attempt may start.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt_count: u32,
    next_eligible_at: Option<Instant>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy, attempt_count: u32) -> Self {
        Self {
            policy,
            attempt_count,
            next_eligible_at: None,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn next_eligible_at(&self) -> Option<Instant> {
        self.next_eligible_at
    }

    /// Count a failed attempt and decide whether another one is allowed.
    pub fn record_failure(&mut self, kind: FailureKind) -> RetryDecision {
        let previous = self.attempt_count;
        self.attempt_count += 1;

        if !kind.is_retryable() || self.attempt_count >= self.policy.ceiling() {
            self.next_eligible_at = None;
            return RetryDecision::GiveUp;
        }

        let delay = self.policy.delay_for(previous);
        self.next_eligible_at = Some(Instant::now() + delay);
        RetryDecision::RetryAfter(delay)
    }

    /// Sleep until the next attempt is eligible.
    ///
    /// Returns `false` when `token` is cancelled first.
    pub async fn wait_until_eligible(&self, token: &CancellationToken) -> bool {
        let Some(at) = self.next_eligible_at else {
            return !token.is_cancelled();
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep_until(at) => true,
        }
    }
}

/// Compare-and-transition that repeats storage failures with the policy's
/// backoff, up to its ceiling. Conflicts and rejected edges return at once.
///
/// A write that committed before its error was reported shows up as a
/// conflict whose actual status is `new`; that counts as success.
pub async fn transition_with_retry(
    store: &dyn JobStore,
    policy: &RetryPolicy,
    id: Uuid,
    expected: JobStatus,
    new: JobStatus,
    patch: JobPatch,
) -> Result<Job, StoreError> {
    let mut attempt = 0;
    loop {
        match store
            .compare_and_transition(id, expected, new, patch.clone())
            .await
        {
            Err(e) if e.is_transient() && attempt + 1 < policy.ceiling() => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    job_id = %id,
                    from = %expected,
                    to = %new,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Job store write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(StoreError::Conflict { actual, .. })
                if attempt > 0 && actual == new && expected != new =>
            {
                return store.get(id).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_cap_never_below_base() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_gives_up_at_ceiling() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
        let mut state = RetryState::new(policy, 0);

        assert_eq!(
            state.record_failure(FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_millis(1))
        );
        assert_eq!(
            state.record_failure(FailureKind::Transient),
            RetryDecision::RetryAfter(Duration::from_millis(2))
        );
        assert_eq!(
            state.record_failure(FailureKind::Transient),
            RetryDecision::GiveUp
        );
        assert_eq!(state.attempt_count(), 3);
    }

    #[test]
    fn test_permanent_gives_up_immediately() {
        let mut state = RetryState::new(RetryPolicy::default(), 0);
        assert_eq!(
            state.record_failure(FailureKind::Permanent),
            RetryDecision::GiveUp
        );
        assert_eq!(state.attempt_count(), 1);
        assert!(state.next_eligible_at().is_none());
    }

    #[tokio::test]
    async fn test_wait_is_interrupted_by_cancellation() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(60));
        let mut state = RetryState::new(policy, 0);
        state.record_failure(FailureKind::Transient);

        let token = CancellationToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        assert!(!state.wait_until_eligible(&token).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
