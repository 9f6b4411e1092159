//! The stateful front end: one image, its stars and its solution.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::background::Background;
use crate::error::{ExtractionError, SolveError};
use crate::extraction::{extract, Extraction, ExtractionProfile};
use crate::index::IndexCatalog;
use crate::params::SolveParameters;
use crate::pixel_buffer::PixelBuffer;
use crate::solver::{CancelToken, Search, Solution};
use crate::star::StarList;

/// Phase of a [`PlateSolver`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Idle,
    Extracting,
    Matching,
    Verifying,
    Solved,
    Failed,
    Aborted,
}

impl SolverState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Extracting | Self::Matching | Self::Verifying)
    }

    fn allows(self, next: SolverState) -> bool {
        use SolverState::*;
        match (self, next) {
            (Idle | Solved | Failed | Aborted, Extracting) => true,
            // Extraction on its own returns to Idle.
            (Extracting, Matching | Idle) => true,
            (Matching, Verifying) => true,
            (Verifying, Solved) => true,
            (Extracting | Matching | Verifying, Failed | Aborted) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: SolverState,
    stars: Option<StarList>,
    background: Option<Background>,
    solution: Option<Solution>,
    score_history: Vec<f64>,
}

/// Extracts stars from a pixel buffer and solves them against a shared index
/// catalog.
///
/// Every method takes `&self`, so one thread can [`abort`](Self::abort) while
/// another is inside [`solve`](Self::solve).
#[derive(Debug)]
pub struct PlateSolver<'a> {
    buffer: &'a PixelBuffer<'a>,
    catalog: Arc<IndexCatalog>,
    cancel: CancelToken,
    inner: Mutex<Inner>,
}

impl<'a> PlateSolver<'a> {
    pub fn new(buffer: &'a PixelBuffer<'a>, catalog: Arc<IndexCatalog>) -> Self {
        Self {
            buffer,
            catalog,
            cancel: CancelToken::new(),
            inner: Mutex::new(Inner {
                state: SolverState::Idle,
                stars: None,
                background: None,
                solution: None,
                score_history: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> SolverState {
        self.inner.lock().state
    }

    /// Stars from the last extraction.
    pub fn stars(&self) -> Option<StarList> {
        self.inner.lock().stars.clone()
    }

    /// Solution of the last successful solve; cleared when a solve starts.
    pub fn solution(&self) -> Option<Solution> {
        self.inner.lock().solution.clone()
    }

    pub fn background(&self) -> Option<Background> {
        self.inner.lock().background.clone()
    }

    /// Best-score replacements of the last search, in order.
    pub fn score_history(&self) -> Vec<f64> {
        self.inner.lock().score_history.clone()
    }

    pub fn catalog(&self) -> &Arc<IndexCatalog> {
        &self.catalog
    }

    /// A handle that aborts the current run from anywhere.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask a running extraction or solve to stop. It ends in
    /// [`SolverState::Aborted`].
    pub fn abort(&self) {
        info!("Abort requested in state {:?}", self.state());
        self.cancel.cancel();
    }

    /// Apply a transition, logging and ignoring invalid ones.
    fn transition(&self, next: SolverState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.allows(next) {
            inner.state = next;
            true
        } else {
            warn!("Ignoring state change {:?} -> {:?}", inner.state, next);
            false
        }
    }

    /// Enter Extracting from a resting state and clear the previous run.
    fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.allows(SolverState::Extracting) {
            warn!("Ignoring new run while {:?}", inner.state);
            return false;
        }
        self.cancel.reset();
        inner.state = SolverState::Extracting;
        inner.solution = None;
        inner.score_history.clear();
        true
    }

    fn run_extraction(&self, profile: &ExtractionProfile) -> Result<Extraction, ExtractionError> {
        let result = extract(self.buffer, profile, &self.cancel);
        if let Ok(extraction) = &result {
            let mut inner = self.inner.lock();
            inner.stars = Some(extraction.stars.clone());
            inner.background = Some(extraction.background.clone());
        }
        result
    }

    fn fail_with<E>(&self, err: E, aborted: bool) -> E {
        self.transition(if aborted { SolverState::Aborted } else { SolverState::Failed });
        err
    }

    /// Extract and rank stars without solving.
    pub fn extract(&self, profile: &ExtractionProfile) -> Result<StarList, ExtractionError> {
        if !self.begin() {
            return Err(ExtractionError::Aborted);
        }
        match self.run_extraction(profile) {
            Ok(extraction) => {
                self.transition(SolverState::Idle);
                Ok(extraction.stars)
            }
            Err(err) => {
                let aborted = err == ExtractionError::Aborted;
                Err(self.fail_with(err, aborted))
            }
        }
    }

    /// Extract, search and fit.
    ///
    /// A call made while another run is in progress is ignored and returns
    /// `Aborted`.
    pub fn solve(&self, params: &SolveParameters) -> Result<Solution, SolveError> {
        if !self.begin() {
            return Err(SolveError::Aborted);
        }
        let image_size = (self.buffer.width(), self.buffer.height());

        let stars = match self.run_extraction(&params.extraction) {
            Ok(extraction) => extraction.stars,
            Err(err) => {
                let aborted = err == ExtractionError::Aborted;
                return Err(self.fail_with(err.into(), aborted));
            }
        };
        info!("Solving {} stars against {} index file(s)", stars.len(), self.catalog.len());
        self.transition(SolverState::Matching);

        let search = match Search::new(&stars, image_size, &self.catalog, params, &self.cancel) {
            Ok(search) => search,
            Err(err) => return Err(self.fail_with(err, false)),
        };
        let report = search.run();
        self.inner.lock().score_history = report.score_history.clone();
        let best = match report.into_best() {
            Ok(best) => best,
            Err(err) => {
                let aborted = err == SolveError::Aborted;
                return Err(self.fail_with(err, aborted));
            }
        };

        self.transition(SolverState::Verifying);
        match search.finish(best) {
            Ok(solution) => {
                let mut inner = self.inner.lock();
                inner.solution = Some(solution.clone());
                inner.state = SolverState::Solved;
                Ok(solution)
            }
            Err(err) => {
                let aborted = err == SolveError::Aborted;
                Err(self.fail_with(err, aborted))
            }
        }
    }
}
