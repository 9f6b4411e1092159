//! Search orchestration: work units, workers and the shared best match.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::best::BestMatchSlot;
use super::cancel::{CancelToken, SolveBudget, Stop};
use super::matcher::{CandidateMatch, QuadMatcher, WorkUnit};
use super::verify::{verify, VerifyConfig};
use super::wcs::{self, PixelSkyPair, TanWcs};
use super::{position_error_arcsec, MatchedStar, Solution};
use crate::error::SolveError;
use crate::index::{CatalogQuery, IndexCatalog};
use crate::params::{LogOddsThresholds, SearchPartition, SolveParameters};
use crate::star::StarList;
use crate::starcatalog::radec_to_uvec;

/// Stars considered by the depth partition when the filter keeps everything.
const DEFAULT_DEPTH_STARS: usize = 200;
/// Smallest depth window.
const MIN_DEPTH_INCREMENT: usize = 10;
/// Final fit: re-association radius in units of the match sigma.
const REFINE_RADIUS_NSIGMA: f64 = 3.0;
const REFINE_ITERATIONS: usize = 10;

/// Outcome of running every work unit.
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub best: Option<CandidateMatch>,
    /// Scores of successive best-match replacements.
    pub score_history: Vec<f64>,
    pub quads_tried: u64,
    pub num_units: usize,
    pub elapsed: Duration,
    pub aborted: bool,
}

impl SearchReport {
    /// The accepted candidate, or why there is none.
    pub fn into_best(self) -> Result<CandidateMatch, SolveError> {
        if self.aborted {
            return Err(SolveError::Aborted);
        }
        self.best.ok_or(SolveError::NoSolution)
    }
}

/// One solve of a star list: the work units plus what they share.
pub struct Search<'a> {
    field: Vec<(f64, f64)>,
    image_size: (u32, u32),
    params: &'a SolveParameters,
    thresholds: LogOddsThresholds,
    verify_config: VerifyConfig,
    units: Vec<WorkUnit>,
    cancel: CancelToken,
}

impl<'a> Search<'a> {
    /// Select index files and lay out work units.
    ///
    /// Fails with `IndexUnavailable` when no index covers the requested scale
    /// and position, and with `NoSolution` for fewer than 4 stars.
    pub fn new(
        stars: &StarList,
        image_size: (u32, u32),
        catalog: &IndexCatalog,
        params: &'a SolveParameters,
        cancel: &CancelToken,
    ) -> Result<Self, SolveError> {
        let scale = params.scale_range(image_size.0);
        let query = CatalogQuery {
            scale_rad_per_px: scale,
            image_size,
            min_quad_fraction: params.min_quad_fraction,
            position: params
                .search_position
                .map(|p| (radec_to_uvec(p.ra_deg.to_radians(), p.dec_deg.to_radians()), p.radius_deg.to_radians())),
        };
        let files = catalog.candidates(&query);
        if files.is_empty() {
            let (lo, hi) = scale;
            return Err(SolveError::IndexUnavailable(format!(
                "none of {} index file(s) covers {:.3}-{:.3} arcsec/px{}",
                catalog.len(),
                (lo.to_degrees() * 3600.0),
                (hi.to_degrees() * 3600.0),
                if params.search_position.is_some() { " at the search position" } else { "" }
            )));
        }
        if stars.len() < 4 {
            debug!("Only {} stars; cannot form a quad", stars.len());
            return Err(SolveError::NoSolution);
        }

        let threads = params.parallelism.threads();
        let partition = params
            .partition
            .resolve(params.scale.is_some(), params.search_position.is_some());
        let diagonal = query.diagonal_px();
        let mut units = Vec::new();
        for file in &files {
            for (range, depth) in partitions(partition, scale, threads, stars.len(), params) {
                // Skip scale slices that miss this index.
                if !file.scale_overlaps(range.0 * params.min_quad_fraction * diagonal, range.1 * diagonal) {
                    continue;
                }
                units.push(WorkUnit {
                    index: file.clone(),
                    scale_rad_per_px: range,
                    depth,
                });
            }
        }
        debug!(
            "Search: {} index file(s), {:?} partition, {} work unit(s), {} thread(s)",
            files.len(),
            partition,
            units.len(),
            threads
        );

        Ok(Self {
            field: stars.positions(),
            image_size,
            params,
            thresholds: params.log_odds.clamped(),
            verify_config: VerifyConfig {
                sigma_px: params.match_sigma_px,
                distractor_fraction: params.distractor_fraction,
                max_stars: params.max_verify_stars,
            },
            units,
            cancel: cancel.clone(),
        })
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn thresholds(&self) -> LogOddsThresholds {
        self.thresholds
    }

    /// Run every work unit until the best candidate reaches `to_keep`, the
    /// budget runs out or the search is cancelled.
    pub fn run(&self) -> SearchReport {
        let start = Instant::now();
        let budget = SolveBudget::new(self.params.time_limit, self.params.max_quads, self.cancel.clone());
        let best: BestMatchSlot<CandidateMatch> = BestMatchSlot::new();

        let run_unit = |unit: &WorkUnit| -> Result<(), Stop> {
            let matcher = QuadMatcher::new(
                unit,
                &self.field,
                self.image_size,
                self.params.min_quad_fraction,
                self.params.scale.is_some(),
            );
            matcher.run(&budget, &|| best.reached(self.thresholds.to_keep), |mut candidate| {
                self.evaluate(&mut candidate, &budget);
                if candidate.log_odds >= self.thresholds.to_solve {
                    let score = candidate.log_odds;
                    if best.offer(score, candidate) {
                        debug!("New best log-odds {:.2}", score);
                    }
                }
                if best.reached(self.thresholds.to_keep) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        };

        let threads = self.params.parallelism.threads();
        let stop = if threads <= 1 || self.units.len() <= 1 {
            self.units.iter().map(&run_unit).find_map(Result::err)
        } else {
            match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
                Ok(pool) => pool.install(|| {
                    self.units
                        .par_iter()
                        .map(&run_unit)
                        .filter_map(Result::err)
                        .reduce_with(|a, b| if a == Stop::Cancelled { a } else { b })
                }),
                Err(err) => {
                    warn!("Could not start {} search threads ({}); searching sequentially", threads, err);
                    self.units.iter().map(&run_unit).find_map(Result::err)
                }
            }
        };

        let aborted = stop == Some(Stop::Cancelled) || self.cancel.is_cancelled();
        let score_history = best.history();
        let report = SearchReport {
            best: if aborted { None } else { best.take().map(|(_, c)| c) },
            score_history,
            quads_tried: budget.steps(),
            num_units: self.units.len(),
            elapsed: start.elapsed(),
            aborted,
        };
        debug!(
            "Search finished after {:.1} ms: {} quads, best {:?}, stop {:?}",
            report.elapsed.as_secs_f64() * 1e3,
            report.quads_tried,
            report.best.as_ref().map(|c| c.log_odds),
            stop
        );
        report
    }

    /// Verify a fresh hypothesis; if accepted, refit and rescore it while
    /// that improves it.
    fn evaluate(&self, candidate: &mut CandidateMatch, budget: &SolveBudget) {
        let index = candidate.index.clone();
        let frame = candidate.quad_frame(&self.field);
        let v = verify(&candidate.wcs, &self.field, &frame, true, &index, &self.verify_config);
        candidate.log_odds = v.log_odds;
        candidate.matches = v.matches;
        if candidate.log_odds < self.thresholds.to_solve {
            return;
        }
        debug!(
            "Accepted quad {:?} from {}: log-odds {:.2}, {} matches",
            candidate.field_quad,
            index.name(),
            candidate.log_odds,
            candidate.matches.len()
        );

        for round in 0..self.params.max_tune_iterations {
            if candidate.log_odds >= self.thresholds.to_tune || budget.check().is_err() {
                break;
            }
            let pairs: Vec<PixelSkyPair> = candidate
                .all_pairs()
                .into_iter()
                .map(|(fi, si)| (self.field[fi], index.star_vector(si)))
                .collect();
            let crval = (candidate.wcs.crval[0], candidate.wcs.crval[1]);
            let Some(fit) = TanWcs::fit(&pairs, candidate.wcs.crpix, crval, self.image_size) else {
                break;
            };
            let v = verify(&fit, &self.field, &frame, false, &index, &self.verify_config);
            if v.log_odds <= candidate.log_odds {
                break;
            }
            debug!("Tune {}: log-odds {:.2} -> {:.2}", round, candidate.log_odds, v.log_odds);
            candidate.wcs = fit;
            candidate.log_odds = v.log_odds;
            candidate.matches = v.matches;
        }
    }

    /// Final fit over all agreeing stars and conversion to a [`Solution`].
    pub fn finish(&self, candidate: CandidateMatch) -> Result<Solution, SolveError> {
        if self.cancel.is_cancelled() {
            return Err(SolveError::Aborted);
        }
        let index = &candidate.index;
        let radius = REFINE_RADIUS_NSIGMA * self.params.match_sigma_px;
        let refined = wcs::refine(
            &candidate.wcs,
            &candidate.all_pairs(),
            &self.field,
            index,
            radius,
            REFINE_ITERATIONS,
        );
        if self.cancel.is_cancelled() {
            return Err(SolveError::Aborted);
        }

        let wcs = refined.wcs.clone();
        let centre = TanWcs::image_centre(self.image_size);
        let (ra, dec) = wcs.pixel_to_sky(centre[0], centre[1]);
        let (ra_deg, dec_deg) = (ra.to_degrees(), dec.to_degrees());
        let scale_arcsec = wcs.pixel_scale().to_degrees() * 3600.0;

        let matched_stars = refined
            .matches
            .iter()
            .zip(&refined.residuals_px)
            .filter_map(|(&(fi, si), &residual)| {
                let star = index.star_catalog().get(si)?;
                Some(MatchedStar {
                    star_index: fi,
                    x: self.field[fi].0,
                    y: self.field[fi].1,
                    ra_deg: star.ra_rad.to_degrees(),
                    dec_deg: star.dec_rad.to_degrees(),
                    reference_id: star.id,
                    residual_px: residual,
                })
            })
            .collect::<Vec<_>>();

        let solution = Solution {
            ra_deg,
            dec_deg,
            field_width_arcmin: scale_arcsec * self.image_size.0 as f64 / 60.0,
            field_height_arcmin: scale_arcsec * self.image_size.1 as f64 / 60.0,
            pixel_scale_arcsec: scale_arcsec,
            orientation_deg: wcs.orientation_deg(),
            parity: wcs.parity(),
            position_error_arcsec: self
                .params
                .search_position
                .map(|p| position_error_arcsec(ra_deg, dec_deg, p.ra_deg, p.dec_deg)),
            log_odds: candidate.log_odds,
            num_matches: matched_stars.len(),
            index_name: index.name().to_string(),
            rms_residual_px: refined.rms_px(),
            wcs,
            matched_stars,
        };
        info!("Solved: {}", solution.summary());
        Ok(solution)
    }
}

/// Scale ranges and depth windows for one index file.
fn partitions(
    partition: SearchPartition,
    scale: (f64, f64),
    threads: usize,
    num_stars: usize,
    params: &SolveParameters,
) -> Vec<((f64, f64), (usize, usize))> {
    let all = (0, usize::MAX);
    match partition {
        SearchPartition::Scales if threads > 1 => {
            // Slice t covers [lo + c·t², lo + c·(t+1)²].
            let (lo, hi) = scale;
            let c = (hi - lo) / (threads * threads) as f64;
            (0..threads)
                .map(|t| {
                    let (t0, t1) = (t as f64, (t + 1) as f64);
                    ((lo + c * t0 * t0, lo + c * t1 * t1), all)
                })
                .collect()
        }
        SearchPartition::Depths if threads > 1 => {
            let source = params
                .extraction
                .filter
                .keep_num
                .unwrap_or(DEFAULT_DEPTH_STARS)
                .min(num_stars);
            let inc = (source / threads).max(MIN_DEPTH_INCREMENT);
            let mut out = Vec::new();
            let mut d = 0;
            while d < source {
                out.push((scale, (d, (d + inc).min(source))));
                d += inc;
            }
            if out.is_empty() {
                out.push((scale, all));
            }
            out
        }
        _ => vec![(scale, all)],
    }
}

/// Solve a ranked star list from an image of `image_size` pixels.
pub fn solve_star_list(
    stars: &StarList,
    image_size: (u32, u32),
    catalog: &IndexCatalog,
    params: &SolveParameters,
    cancel: &CancelToken,
) -> Result<Solution, SolveError> {
    let search = Search::new(stars, image_size, catalog, params, cancel)?;
    let best = search.run().into_best()?;
    search.finish(best)
}
