//! Cooperative cancellation shared between the controller and the harness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same flag. The controller checks it between attempts and
/// the process helper polls it while waiting on the validator.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that reports cancellation once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Clamp `timeout` to the time left before the deadline, if any.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => timeout.min(
                deadline
                    .checked_duration_since(Instant::now())
                    .unwrap_or(Duration::ZERO),
            ),
            None => timeout,
        }
    }

    /// Guard that cancels the token when dropped.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            token: self.clone(),
            armed: true,
        }
    }
}

/// Cancels its token on drop unless disarmed.
#[derive(Debug)]
pub struct CancelOnDrop {
    token: CancelToken,
    armed: bool,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn past_deadline_counts_as_cancelled() {
        let token = CancelToken::with_deadline(Instant::now());
        assert!(token.is_cancelled());
        assert_eq!(token.clamp(Duration::from_secs(60)), Duration::ZERO);
    }

    #[test]
    fn clamp_without_deadline_is_identity() {
        let token = CancelToken::new();
        assert_eq!(token.clamp(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test]
    fn drop_guard_cancels_unless_disarmed() {
        let token = CancelToken::new();
        drop(token.cancel_on_drop());
        assert!(token.is_cancelled());

        let token = CancelToken::new();
        token.cancel_on_drop().disarm();
        assert!(!token.is_cancelled());
    }
}
