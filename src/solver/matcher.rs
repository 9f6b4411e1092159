//! Quad enumeration and hash lookup for one work unit.
//!
//! Field quads are drawn brightest-first: every quad whose faintest star is
//! star `n` comes before any quad that uses a star fainter than `n`. Each
//! quad's code is looked up under
//! every key within the ratio tolerance, nearest key first, and every index
//! pattern that agrees on all ratios and on the pixel scale becomes a
//! hypothesis: a TAN fit of the 4 star pairs in canonical order.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::debug;

use super::cancel::{SolveBudget, Stop};
use super::verify::QuadFrame;
use super::wcs::{PixelSkyPair, TanWcs};
use crate::index::build::separation_for_density;
use crate::index::combinations::BreadthFirstCombinations;
use crate::index::pattern::{canonical_order, GeometricCode, PATTERN_SIZE};
use crate::index::IndexFile;
use crate::starcatalog::uvec_to_radec;

/// Hypotheses whose CD axis scales differ by more than this are not
/// similarity transforms and are dropped.
const MAX_AXIS_RATIO: f64 = 1.1;

/// One slice of the search: an index file, a pixel-scale range and a range of
/// star depth.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub index: Arc<IndexFile>,
    /// Radians per pixel.
    pub scale_rad_per_px: (f64, f64),
    /// Quads use stars ranked below `depth.1` and at least one ranked at or
    /// beyond `depth.0`.
    pub depth: (usize, usize),
}

/// A correspondence of 4 field stars to 4 index stars and the hypothesis it
/// implies.
#[derive(Debug, Clone)]
pub struct CandidateMatch {
    pub index: Arc<IndexFile>,
    /// Field stars in canonical order.
    pub field_quad: [usize; PATTERN_SIZE],
    /// Index stars, parallel to `field_quad`.
    pub index_quad: [u32; PATTERN_SIZE],
    pub wcs: TanWcs,
    /// Pixel scale implied by the pattern sizes, radians per pixel.
    pub pixel_scale: f64,
    /// Running log-odds; negative infinity until verified.
    pub log_odds: f64,
    /// Agreeing `(field_idx, index_star)` pairs found by verification,
    /// excluding the quad.
    pub matches: Vec<(usize, usize)>,
}

impl CandidateMatch {
    pub fn quad_frame(&self, field: &[(f64, f64)]) -> QuadFrame {
        let pts = self.field_quad.map(|i| field[i]);
        let centre = (
            pts.iter().map(|p| p.0).sum::<f64>() / PATTERN_SIZE as f64,
            pts.iter().map(|p| p.1).sum::<f64>() / PATTERN_SIZE as f64,
        );
        let largest = GeometricCode::from_pixels(&pts).map_or(1.0, |c| c.largest_edge);
        QuadFrame {
            stars: self.field_quad,
            centre,
            radius_px: largest / 2.0,
        }
    }

    /// The quad pairs followed by the verified matches.
    pub fn all_pairs(&self) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize)> = self
            .field_quad
            .iter()
            .zip(self.index_quad.iter())
            .map(|(&f, &s)| (f, s as usize))
            .collect();
        pairs.extend(self.matches.iter().copied());
        pairs
    }
}

/// Enumerates quads of one work unit.
pub struct QuadMatcher<'a> {
    unit: &'a WorkUnit,
    field: &'a [(f64, f64)],
    image_size: (u32, u32),
    pattern_stars: Vec<usize>,
    min_quad_px: f64,
}

impl<'a> QuadMatcher<'a> {
    /// `field` holds ranked pixel positions. With `cluster_bust`, stars closer
    /// than the index's cluster-buster spacing to a brighter kept star are
    /// left out of quads.
    pub fn new(
        unit: &'a WorkUnit,
        field: &'a [(f64, f64)],
        image_size: (u32, u32),
        min_quad_fraction: f64,
        cluster_bust: bool,
    ) -> Self {
        let depth_end = unit.depth.1.min(field.len());
        let mut pattern_stars: Vec<usize> = Vec::with_capacity(depth_end);
        if cluster_bust {
            let sep = separation_for_density(image_size.0 as f64, unit.index.props().stars_per_fov);
            let sep_sq = sep * sep;
            for i in 0..depth_end {
                let (x, y) = field[i];
                let crowded = pattern_stars
                    .iter()
                    .any(|&j| (field[j].0 - x).powi(2) + (field[j].1 - y).powi(2) < sep_sq);
                if !crowded {
                    pattern_stars.push(i);
                }
            }
        } else {
            pattern_stars.extend(0..depth_end);
        }
        let diagonal = (image_size.0 as f64).hypot(image_size.1 as f64);
        Self {
            unit,
            field,
            image_size,
            pattern_stars,
            min_quad_px: min_quad_fraction.max(0.0) * diagonal,
        }
    }

    pub fn pattern_stars(&self) -> &[usize] {
        &self.pattern_stars
    }

    /// Feed every hypothesis to `on_candidate` until it breaks, `halted`
    /// returns true, or the quads run out.
    ///
    /// The budget is consulted before each quad; its stop reason is returned
    /// as the error.
    pub fn run<F>(&self, budget: &SolveBudget, halted: &dyn Fn() -> bool, mut on_candidate: F) -> Result<(), Stop>
    where
        F: FnMut(CandidateMatch) -> ControlFlow<()>,
    {
        let index = &self.unit.index;
        let props = index.props();
        let (scale_lo, scale_hi) = self.unit.scale_rad_per_px;
        let crpix = TanWcs::image_centre(self.image_size);
        let (mut quads, mut hypotheses) = (0u64, 0u64);

        for quad in self.quads() {
            if halted() {
                break;
            }
            budget.step()?;
            quads += 1;

            let Some(code) = GeometricCode::from_pixels(&quad.map(|i| self.field[i])) else {
                continue;
            };
            if code.largest_edge < self.min_quad_px {
                continue;
            }
            // The whole band of this quad misses the index.
            if !index.scale_overlaps(scale_lo * code.largest_edge, scale_hi * code.largest_edge) {
                continue;
            }

            let mut seen: HashSet<usize> = HashSet::new();
            for key in code.key_range(props.pattern_bins, props.pattern_max_error) {
                for slot in index.slots_for_key(&key) {
                    if !seen.insert(slot) {
                        continue;
                    }
                    let scale = index.pattern_largest_edge(slot) / code.largest_edge;
                    if scale < scale_lo || scale > scale_hi {
                        continue;
                    }
                    let Some(index_code) = index.pattern_code(slot) else {
                        continue;
                    };
                    if !code.agrees_with(&index_code, props.pattern_max_error) {
                        continue;
                    }
                    let Some(candidate) = self.hypothesis(quad, slot, scale, crpix) else {
                        continue;
                    };
                    hypotheses += 1;
                    if on_candidate(candidate).is_break() {
                        debug!(
                            "Unit {} done: {} quads, {} hypotheses",
                            index.name(),
                            quads,
                            hypotheses
                        );
                        return Ok(());
                    }
                }
            }
        }
        debug!(
            "Unit {} exhausted: {} quads, {} hypotheses",
            index.name(),
            quads,
            hypotheses
        );
        Ok(())
    }

    /// Quads of the depth window. For each pattern star at or beyond
    /// `depth.0`, in rank order, the 3-subsets of the stars ranked before it
    /// are completed with that star.
    fn quads(&self) -> impl Iterator<Item = [usize; PATTERN_SIZE]> + '_ {
        let first = self
            .pattern_stars
            .partition_point(|&i| i < self.unit.depth.0)
            .max(PATTERN_SIZE - 1);
        (first..self.pattern_stars.len()).flat_map(move |pos| {
            let newest = self.pattern_stars[pos];
            BreadthFirstCombinations::<{ PATTERN_SIZE - 1 }>::new(&self.pattern_stars[..pos]).map(move |brighter| {
                let mut quad = [newest; PATTERN_SIZE];
                quad[..PATTERN_SIZE - 1].copy_from_slice(&brighter);
                quad
            })
        })
    }

    fn hypothesis(
        &self,
        quad: [usize; PATTERN_SIZE],
        slot: usize,
        scale: f64,
        crpix: [f64; 2],
    ) -> Option<CandidateMatch> {
        let index = &self.unit.index;
        let mut field_quad = quad;
        canonical_order(&mut field_quad, |i| [self.field[i].0, self.field[i].1]);
        let index_quad = index.pattern(slot);

        let vectors = index_quad.map(|s| index.star_vector(s as usize));
        let pairs: Vec<PixelSkyPair> = (0..PATTERN_SIZE)
            .map(|k| (self.field[field_quad[k]], vectors[k]))
            .collect();
        let mean: Vector3<f64> = vectors.iter().sum();
        let wcs = TanWcs::fit(&pairs, crpix, uvec_to_radec(&mean), self.image_size)?;
        if wcs.axis_ratio() > MAX_AXIS_RATIO {
            return None;
        }
        Some(CandidateMatch {
            index: Arc::clone(index),
            field_quad,
            index_quad,
            wcs,
            pixel_scale: scale,
            log_odds: f64::NEG_INFINITY,
            matches: Vec::new(),
        })
    }
}
