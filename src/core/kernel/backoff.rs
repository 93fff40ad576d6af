use std::time::Duration;

/// Delay before attempt `attempt` (1-based).
///
/// Attempt 1 runs immediately, attempt k >= 2 waits `2^(k-2)` seconds:
/// 0s, 1s, 2s, 4s, 8s for attempts 1 to 5.
pub fn backoff_delay(attempt: u32) -> Duration {
    if attempt <= 1 {
        Duration::ZERO
    } else {
        Duration::from_secs(1u64 << (attempt - 2).min(32))
    }
}

/// Retry counter owned by the reconnect path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    attempt: u32,
    max_attempts: u32,
}

/// What the reconnect loop does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the delay, then run attempt `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Budget spent; the counter has been reset
    Exhausted { attempts: u32 },
}

impl BackoffState {
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Claim the next attempt, or report exhaustion and reset
    pub fn next_attempt(&mut self) -> RetryDecision {
        if self.attempt >= self.max_attempts {
            let attempts = self.attempt;
            self.reset();
            return RetryDecision::Exhausted { attempts };
        }
        self.attempt += 1;
        RetryDecision::Retry {
            attempt: self.attempt,
            delay: backoff_delay(self.attempt),
        }
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule() {
        let delays: Vec<u64> = (1..=5).map(|k| backoff_delay(k).as_secs()).collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8]);
    }

    #[test]
    fn test_exhaustion_resets_counter() {
        let mut state = BackoffState::new(5);
        for expected in 1..=5 {
            match state.next_attempt() {
                RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                RetryDecision::Exhausted { .. } => panic!("exhausted too early"),
            }
        }
        assert_eq!(state.attempt(), 5);
        assert_eq!(
            state.next_attempt(),
            RetryDecision::Exhausted { attempts: 5 }
        );
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn test_reset_starts_fresh() {
        let mut state = BackoffState::default();
        state.next_attempt();
        state.next_attempt();
        state.reset();
        assert_eq!(
            state.next_attempt(),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        assert_eq!(backoff_delay(100), Duration::from_secs(1 << 32));
    }
}
