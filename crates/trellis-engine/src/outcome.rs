//! What a walker asks of the work queue after a pass

use std::time::Duration;

/// Interval at which a parent re-checks children that are still settling
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// When the parent should be reconciled again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// Progress was made; come back immediately
    Now,
    /// Waiting on an external controller; poll again after the delay
    After(Duration),
}

impl Requeue {
    /// The standard poll for a child that has not settled yet
    pub fn poll() -> Self {
        Requeue::After(STATUS_POLL_INTERVAL)
    }

    fn delay(self) -> Duration {
        match self {
            Requeue::Now => Duration::ZERO,
            Requeue::After(d) => d,
        }
    }
}

/// Result of one walker pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the desired state changes
    Converged,
    /// More work remains
    Requeue(Requeue),
    /// A component reported a terminal failure; wait for a spec change
    Blocked,
}

impl Outcome {
    /// Shorthand for `Outcome::Requeue(Requeue::Now)`
    pub fn now() -> Self {
        Outcome::Requeue(Requeue::Now)
    }

    /// Shorthand for the standard status poll
    pub fn poll() -> Self {
        Outcome::Requeue(Requeue::poll())
    }

    /// True when the pass left nothing to do
    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged)
    }

    /// Combine two outcomes, keeping the most urgent
    ///
    /// Any requeue beats `Blocked` so independent work keeps moving, and
    /// `Blocked` beats `Converged`. Between two requeues the shorter wins.
    pub fn merge(self, other: Outcome) -> Outcome {
        match (self, other) {
            (Outcome::Requeue(a), Outcome::Requeue(b)) => {
                if a.delay() <= b.delay() {
                    Outcome::Requeue(a)
                } else {
                    Outcome::Requeue(b)
                }
            }
            (r @ Outcome::Requeue(_), _) | (_, r @ Outcome::Requeue(_)) => r,
            (Outcome::Blocked, _) | (_, Outcome::Blocked) => Outcome::Blocked,
            (Outcome::Converged, Outcome::Converged) => Outcome::Converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorter_requeue_wins() {
        let merged = Outcome::poll().merge(Outcome::now());
        assert_eq!(merged, Outcome::now());

        let a = Outcome::Requeue(Requeue::After(Duration::from_secs(5)));
        assert_eq!(Outcome::poll().merge(a), a);
    }

    #[test]
    fn requeue_beats_blocked_beats_converged() {
        assert_eq!(Outcome::Blocked.merge(Outcome::poll()), Outcome::poll());
        assert_eq!(Outcome::Converged.merge(Outcome::Blocked), Outcome::Blocked);
        assert_eq!(
            Outcome::Converged.merge(Outcome::Converged),
            Outcome::Converged
        );
    }
}
