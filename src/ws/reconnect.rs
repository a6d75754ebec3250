use std::time::Duration;

use super::config::ReconnectConfig;

/// Outcome of asking the policy for another connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    /// A new retry timer must be armed with this delay.
    Scheduled { attempt: u32, delay: Duration },
    /// A retry is already pending for this drop; nothing to do.
    AlreadyPending,
    /// Every attempt has been spent since the last successful open.
    Exhausted,
}

/// Linear backoff with a hard cap on consecutive attempts.
#[derive(Debug)]
pub(crate) struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    pending: bool,
}

impl ReconnectPolicy {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            pending: false,
        }
    }

    /// Idempotent while a retry is pending, so several close/error signals for
    /// the same drop produce a single timer.
    pub(crate) fn schedule_retry(&mut self) -> Retry {
        if self.pending {
            return Retry::AlreadyPending;
        }
        if self.attempt >= self.config.max_attempts {
            return Retry::Exhausted;
        }

        self.attempt += 1;
        self.pending = true;
        Retry::Scheduled {
            attempt: self.attempt,
            delay: self.config.delay_for(self.attempt),
        }
    }

    /// The pending timer fired or was cancelled.
    pub(crate) fn clear_pending(&mut self) {
        self.pending = false;
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig {
            max_attempts,
            base_interval: Duration::from_millis(100),
        })
    }

    #[test]
    fn second_schedule_while_pending_is_ignored() {
        let mut policy = policy(5);

        assert_eq!(
            policy.schedule_retry(),
            Retry::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(policy.schedule_retry(), Retry::AlreadyPending);
        assert_eq!(policy.attempt(), 1);
    }

    #[test]
    fn delays_increase_linearly_until_exhausted() {
        let mut policy = policy(3);

        for expected in 1..=3 {
            assert_eq!(
                policy.schedule_retry(),
                Retry::Scheduled {
                    attempt: expected,
                    delay: Duration::from_millis(100) * expected
                }
            );
            policy.clear_pending();
        }

        assert_eq!(policy.schedule_retry(), Retry::Exhausted);
        assert!(!policy.is_pending(), "exhaustion must not leave a timer");
    }

    #[test]
    fn reset_restarts_from_first_attempt() {
        let mut policy = policy(3);
        _ = policy.schedule_retry();
        policy.clear_pending();
        _ = policy.schedule_retry();
        policy.clear_pending();

        policy.reset();

        assert_eq!(
            policy.schedule_retry(),
            Retry::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn zero_max_attempts_never_schedules() {
        let mut policy = policy(0);
        assert_eq!(policy.schedule_retry(), Retry::Exhausted);
    }
}
