use crate::channel::ChannelError;
use std::time::Duration;

/// Decision returned by the retry policy after a failed dashboard push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again (includes the 1-based attempt that failed).
    Retry { attempt: u32, delay: Duration },
    /// Exhausted the attempts for this cycle. The next cycle pushes fresher content.
    Skip,
}

/// Bounded retry policy for pushes to the remote channel.
///
/// Tracks attempts within one reconciliation cycle. Transient failures back off
/// exponentially; a rate-limit answer waits the advised time instead, capped at
/// `max_backoff`. Nothing here ever aborts the loop.
pub struct PushRetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    current_attempt: u32,
}

impl PushRetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            current_attempt: 0,
        }
    }

    /// Record a failed attempt and decide what to do next.
    pub fn evaluate(&mut self, error: &ChannelError) -> RetryDecision {
        self.current_attempt += 1;

        if self.current_attempt >= self.max_attempts {
            tracing::warn!(
                error = %error,
                attempts = self.current_attempt,
                "dashboard push attempts exhausted, skipping cycle"
            );
            return RetryDecision::Skip;
        }

        let delay = match error {
            ChannelError::RateLimited { retry_after } => (*retry_after).min(self.max_backoff),
            // A vanished message is re-posted right away.
            ChannelError::MessageGone => Duration::ZERO,
            _ => backoff_delay(self.initial_backoff, self.current_attempt - 1, self.max_backoff),
        };

        tracing::debug!(
            error = %error,
            attempt = self.current_attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "dashboard push failed, retrying"
        );

        RetryDecision::Retry {
            attempt: self.current_attempt,
            delay,
        }
    }

    /// Current attempt count (0 = no failure yet).
    #[allow(dead_code)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Exponential backoff: `initial * 2^consecutive`, capped at `max`.
pub fn backoff_delay(initial: Duration, consecutive: u32, max: Duration) -> Duration {
    let shift = 1u32.checked_shl(consecutive).unwrap_or(u32::MAX);
    initial.saturating_mul(shift).min(max)
}
