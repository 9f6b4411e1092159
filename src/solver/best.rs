//! The single shared slot holding the best candidate found so far.

use parking_lot::Mutex;

/// Keeps the highest-scoring candidate across all workers.
///
/// A candidate replaces the current one only with a strictly higher score, so
/// with sequential search the first of several equal candidates wins.
#[derive(Debug)]
pub struct BestMatchSlot<T> {
    inner: Mutex<SlotState<T>>,
}

#[derive(Debug)]
struct SlotState<T> {
    best: Option<(f64, T)>,
    history: Vec<f64>,
}

impl<T: Clone> BestMatchSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState {
                best: None,
                history: Vec::new(),
            }),
        }
    }

    /// Offer a candidate. Returns whether it became the best.
    pub fn offer(&self, score: f64, candidate: T) -> bool {
        if !score.is_finite() {
            return false;
        }
        let mut state = self.inner.lock();
        let better = state.best.as_ref().map_or(true, |(s, _)| score > *s);
        if better {
            state.best = Some((score, candidate));
            state.history.push(score);
        }
        better
    }

    pub fn best_score(&self) -> Option<f64> {
        self.inner.lock().best.as_ref().map(|(s, _)| *s)
    }

    /// Whether the best score has reached `threshold`.
    pub fn reached(&self, threshold: f64) -> bool {
        self.best_score().is_some_and(|s| s >= threshold)
    }

    /// Scores of every replacement, in order.
    pub fn history(&self) -> Vec<f64> {
        self.inner.lock().history.clone()
    }

    pub fn take(&self) -> Option<(f64, T)> {
        self.inner.lock().best.take()
    }
}

impl<T: Clone> Default for BestMatchSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
