//! Cooperative cancellation and the shared search budget.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cloneable abort flag. All clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Why a budget check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Cancelled,
    Exhausted,
}

/// One wall-clock deadline plus an optional step count, shared by all workers
/// of a solve.
#[derive(Debug)]
pub struct SolveBudget {
    started: Instant,
    deadline: Instant,
    max_steps: Option<u64>,
    steps: AtomicU64,
    cancel: CancelToken,
}

impl SolveBudget {
    pub fn new(time_limit: Duration, max_steps: Option<u64>, cancel: CancelToken) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + time_limit,
            max_steps,
            steps: AtomicU64::new(0),
            cancel,
        }
    }

    /// Consume one step (one subset probe).
    pub fn step(&self) -> Result<(), Stop> {
        self.check()?;
        let used = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        match self.max_steps {
            Some(max) if used > max => Err(Stop::Exhausted),
            _ => Ok(()),
        }
    }

    /// Check cancellation and the deadline without consuming a step.
    pub fn check(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Stop::Exhausted);
        }
        if let Some(max) = self.max_steps {
            if self.steps.load(Ordering::Relaxed) >= max {
                return Err(Stop::Exhausted);
            }
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
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
        other.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn step_budget_is_enforced() {
        let budget = SolveBudget::new(Duration::from_secs(60), Some(3), CancelToken::new());
        assert!(budget.step().is_ok());
        assert!(budget.step().is_ok());
        assert!(budget.step().is_ok());
        assert_eq!(budget.step(), Err(Stop::Exhausted));
        assert_eq!(budget.check(), Err(Stop::Exhausted));
    }

    #[test]
    fn cancellation_wins_over_exhaustion() {
        let token = CancelToken::new();
        let budget = SolveBudget::new(Duration::ZERO, None, token.clone());
        assert_eq!(budget.check(), Err(Stop::Exhausted));
        token.cancel();
        assert_eq!(budget.step(), Err(Stop::Cancelled));
    }
}
