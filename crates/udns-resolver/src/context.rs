//! Per-request deadline propagation.
//!
//! Every resolve path carries one of these.  The only operations that
//! can block on the network are in the upstream resolver, which takes
//! its per-attempt budget from the remaining time here; a deadline
//! that has already passed reads as cancellation.

use std::time::{Duration, Instant};

/// The deadline (if any) of one in-flight request.
#[derive(Debug, Copy, Clone)]
pub struct Context {
    deadline: Option<Instant>,
}

impl Context {
    /// A context with no deadline: attempts use their default
    /// timeouts.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    /// Time left until the deadline, `None` when there is no
    /// deadline.  Zero once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// The budget for one blocking attempt: the remaining time when a
    /// deadline is set, the given default otherwise.
    pub fn budget(&self, default: Duration) -> Duration {
        self.remaining().unwrap_or(default)
    }

    /// True once the deadline has passed.  A context without a
    /// deadline is never cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.remaining(), Some(Duration::ZERO))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_has_no_deadline() {
        let ctx = Context::background();
        assert_eq!(None, ctx.remaining());
        assert!(!ctx.is_cancelled());
        assert_eq!(Duration::from_secs(5), ctx.budget(Duration::from_secs(5)));
    }

    #[test]
    fn deadline_budget_shrinks() {
        let ctx = Context::with_timeout(Duration::from_secs(60));
        let budget = ctx.budget(Duration::from_secs(5));
        assert!(budget > Duration::from_secs(59));
        assert!(budget <= Duration::from_secs(60));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn passed_deadline_reads_as_cancelled() {
        let ctx = Context::with_deadline(Instant::now() - Duration::from_secs(1));
        assert_eq!(Some(Duration::ZERO), ctx.remaining());
        assert!(ctx.is_cancelled());
        assert_eq!(Duration::ZERO, ctx.budget(Duration::from_secs(5)));
    }
}
