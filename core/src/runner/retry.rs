//! Bounded retry for one round.
//!
//! `RoundState` is the round's state machine:
//! `Attempting(n) -> Succeeded | Attempting(n + 1) -> Failed`. A round gets at
//! most `retry_limit + 1` attempts. `Backoff` spaces the attempts linearly up
//! to a cap.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Linear-capped backoff: `min(step * attempt, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub step: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Backoff { step, cap }
    }

    /// Sleep before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }
}

impl Default for Backoff {
    /// 2s per failed attempt, at most 10s.
    fn default() -> Self {
        Backoff {
            step: Duration::from_secs(2),
            cap: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// RoundState
// ---------------------------------------------------------------------------

/// Where a round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// About to make attempt number `n` (1-based).
    Attempting(u32),
    /// The last attempt exited 0.
    Succeeded { attempts: u32 },
    /// Every allowed attempt failed.
    Failed { attempts: u32 },
}

impl RoundState {
    pub fn start() -> Self {
        RoundState::Attempting(1)
    }

    /// Advance after an attempt finished. Terminal states do not move.
    pub fn after_attempt(self, succeeded: bool, retry_limit: u32) -> Self {
        match self {
            RoundState::Attempting(n) if succeeded => RoundState::Succeeded { attempts: n },
            RoundState::Attempting(n) if n > retry_limit => RoundState::Failed { attempts: n },
            RoundState::Attempting(n) => RoundState::Attempting(n + 1),
            terminal => terminal,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_is_two_seconds_capped_at_ten() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(4), Duration::from_secs(8));
        assert_eq!(b.delay(5), Duration::from_secs(10));
        assert_eq!(b.delay(50), Duration::from_secs(10));
    }

    #[test]
    fn zero_step_never_sleeps() {
        let b = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(b.delay(7), Duration::ZERO);
    }

    #[test]
    fn success_on_first_attempt() {
        let s = RoundState::start().after_attempt(true, 2);
        assert_eq!(s, RoundState::Succeeded { attempts: 1 });
    }

    #[test]
    fn retries_until_limit_then_fails() {
        let mut s = RoundState::start();
        s = s.after_attempt(false, 2);
        assert_eq!(s, RoundState::Attempting(2));
        s = s.after_attempt(false, 2);
        assert_eq!(s, RoundState::Attempting(3));
        s = s.after_attempt(false, 2);
        assert_eq!(s, RoundState::Failed { attempts: 3 });
    }

    #[test]
    fn zero_retry_limit_allows_one_attempt() {
        let s = RoundState::start().after_attempt(false, 0);
        assert_eq!(s, RoundState::Failed { attempts: 1 });
    }

    #[test]
    fn success_after_retry() {
        let s = RoundState::start()
            .after_attempt(false, 1)
            .after_attempt(true, 1);
        assert_eq!(s, RoundState::Succeeded { attempts: 2 });
    }

    #[test]
    fn terminal_states_are_sticky() {
        let done = RoundState::Succeeded { attempts: 1 };
        assert_eq!(done.after_attempt(false, 5), done);
        let failed = RoundState::Failed { attempts: 3 };
        assert_eq!(failed.after_attempt(true, 5), failed);
    }
}
