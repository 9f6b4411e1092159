//! Index generation from a reference star list.
//!
//! 1. Sort stars by brightness and apply the magnitude cut.
//! 2. Build the spatial catalog for cone queries.
//! 3. For each pattern scale, thin the stars with the cluster buster, then
//!    collect brightest-first 4-star patterns in a field around every kept star.
//! 4. Hash the unique patterns into a quadratic-probing table.

use std::collections::BTreeSet;

use nalgebra::Vector3;
use tracing::{debug, info};

use super::combinations::BreadthFirstCombinations;
use super::pattern::{
    bins_for_error, canonical_order, hash_to_index, insert_pattern, key_hash, next_prime,
    short_hash, GeometricCode, EMPTY_SLOT, PATTERN_SIZE,
};
use super::{IndexFile, IndexProperties};
use crate::starcatalog::{angular_distance, ReferenceStar, StarCatalog};

/// Parameters controlling index generation.
#[derive(Debug, Clone)]
pub struct BuildIndexConfig {
    /// Largest field of view to support, in degrees.
    pub max_fov_deg: f64,
    /// Smallest field of view. `None` builds a single-scale index at `max_fov_deg`.
    pub min_fov_deg: Option<f64>,
    /// Faintest magnitude to keep. `None` derives a cut from `stars_per_fov`.
    pub star_max_magnitude: Option<f32>,
    /// Maximum edge-ratio error tolerated when matching. Default 0.001 (250 bins).
    pub pattern_max_error: f64,
    /// Patterns kept per field. Default 50.
    pub patterns_per_field: u32,
    /// Target star density per field for the cluster buster. Default 150.
    pub stars_per_fov: u32,
    /// Ratio between neighbouring pattern scales. Default 1.5.
    pub multiscale_step: f64,
    /// Resolution of the spatial star catalog. Default 32.
    pub catalog_nside: u32,
}

impl Default for BuildIndexConfig {
    fn default() -> Self {
        Self {
            max_fov_deg: 1.0,
            min_fov_deg: None,
            star_max_magnitude: None,
            pattern_max_error: 0.001,
            patterns_per_field: 50,
            stars_per_fov: 150,
            multiscale_step: 1.5,
            catalog_nside: 32,
        }
    }
}

/// Solid-angle count of `fov`-wide fields needed to tile the sphere.
fn num_fields_for_sky(fov_rad: f64) -> usize {
    let cone = std::f64::consts::TAU * (1.0 - (fov_rad / 2.0).cos());
    if cone <= 0.0 {
        return 1;
    }
    ((4.0 * std::f64::consts::PI / cone).ceil() as usize).max(1)
}

/// Mean spacing of `stars_per_fov` stars spread over a `fov`-wide disc.
pub(crate) fn separation_for_density(fov: f64, stars_per_fov: u32) -> f64 {
    (fov / 2.0) * (std::f64::consts::PI / stars_per_fov.max(1) as f64).sqrt()
}

/// Log-spaced pattern scales from `min_fov` to `max_fov`.
fn pattern_fovs(min_fov: f64, max_fov: f64, step: f64) -> Vec<f64> {
    let ratio = max_fov / min_fov;
    let divisions = if !(step > 1.0) || ratio < step.sqrt() {
        1
    } else {
        (ratio.ln() / step.ln()).ceil() as usize + 1
    };
    if divisions <= 1 {
        return vec![max_fov];
    }
    (0..divisions)
        .map(|i| {
            let t = i as f64 / (divisions - 1) as f64;
            (min_fov.ln() + t * (max_fov.ln() - min_fov.ln())).exp()
        })
        .collect()
}

/// Magnitude of the star that fills `stars_per_fov` across the whole sky at
/// the smallest scale. `stars` must be brightness-sorted and non-empty.
fn magnitude_cutoff(stars: &[ReferenceStar], min_fov: f64, stars_per_fov: u32) -> f32 {
    let needed = (num_fields_for_sky(min_fov) as f64 * stars_per_fov as f64 * 0.7) as usize;
    stars[needed.min(stars.len() - 1)].mag
}

impl IndexFile {
    /// Build an index from reference stars.
    pub fn build(
        name: impl Into<String>,
        stars: &[ReferenceStar],
        config: &BuildIndexConfig,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let max_fov = config.max_fov_deg.to_radians();
        let min_fov = config.min_fov_deg.map_or(max_fov, f64::to_radians);
        if !(max_fov > 0.0) || !(min_fov > 0.0) || min_fov > max_fov {
            anyhow::bail!(
                "invalid field of view range {:?}..{} deg",
                config.min_fov_deg,
                config.max_fov_deg
            );
        }
        if !(config.pattern_max_error > 0.0 && config.pattern_max_error <= 0.25) {
            anyhow::bail!("pattern_max_error {} outside (0, 0.25]", config.pattern_max_error);
        }
        if config.patterns_per_field == 0 {
            anyhow::bail!("patterns_per_field must be positive");
        }

        let pattern_bins = bins_for_error(config.pattern_max_error);
        info!(
            "Building index '{}': {} bins, max ratio error {}",
            name, pattern_bins, config.pattern_max_error
        );

        let mut stars: Vec<ReferenceStar> = stars
            .iter()
            .filter(|s| s.ra_rad.is_finite() && s.dec_rad.is_finite() && s.mag.is_finite())
            .cloned()
            .collect();
        stars.sort_by(|a, b| a.mag.total_cmp(&b.mag).then(a.id.cmp(&b.id)));
        if stars.len() < PATTERN_SIZE {
            anyhow::bail!("index '{}' needs at least {} stars, got {}", name, PATTERN_SIZE, stars.len());
        }

        let star_max_magnitude = config
            .star_max_magnitude
            .unwrap_or_else(|| magnitude_cutoff(&stars, min_fov, config.stars_per_fov));
        let before = stars.len();
        stars.retain(|s| s.mag <= star_max_magnitude);
        info!(
            "Kept {} of {} stars brighter than magnitude {:.2}",
            stars.len(),
            before,
            star_max_magnitude
        );
        if stars.len() < PATTERN_SIZE {
            anyhow::bail!("magnitude cut {} leaves fewer than {} stars", star_max_magnitude, PATTERN_SIZE);
        }

        let vectors: Vec<Vector3<f64>> = stars.iter().map(ReferenceStar::uvec).collect();
        let star_catalog = StarCatalog::new(config.catalog_nside, stars);
        let num_stars = vectors.len();

        let fovs = pattern_fovs(min_fov, max_fov, config.multiscale_step);
        info!(
            "Generating patterns at {} scales: {:?} deg",
            fovs.len(),
            fovs.iter().map(|f| f.to_degrees()).collect::<Vec<_>>()
        );

        // Sorted patterns, so the table layout is reproducible.
        let mut pattern_set: BTreeSet<[u32; PATTERN_SIZE]> = BTreeSet::new();
        for &fov in fovs.iter().rev() {
            let separation = separation_for_density(fov, config.stars_per_fov);

            let mut keep = vec![false; num_stars];
            for i in 0..num_stars {
                let occupied = star_catalog
                    .cone(&vectors[i], separation)
                    .into_iter()
                    .any(|j| keep[j]);
                keep[i] = !occupied;
            }
            let pattern_stars: Vec<usize> = (0..num_stars).filter(|&i| keep[i]).collect();

            let mut added = 0usize;
            for &centre in &pattern_stars {
                let field: Vec<usize> = star_catalog
                    .cone(&vectors[centre], fov / 2.0)
                    .into_iter()
                    .filter(|&j| keep[j])
                    .collect();
                if field.len() < PATTERN_SIZE {
                    continue;
                }
                for combo in BreadthFirstCombinations::<PATTERN_SIZE>::new(&field)
                    .take(config.patterns_per_field as usize)
                {
                    let mut pat = combo.map(|i| i as u32);
                    pat.sort_unstable();
                    if pattern_set.insert(pat) {
                        added += 1;
                    }
                }
            }
            info!(
                "Scale {:.3} deg: separation {:.4} deg, {} pattern stars, {} new patterns",
                fov.to_degrees(),
                separation.to_degrees(),
                pattern_stars.len(),
                added
            );
        }

        let num_patterns = pattern_set.len();
        let table_size = next_prime(2 * num_patterns as u64).max(2) as usize;
        let mut pattern_catalog = vec![EMPTY_SLOT; table_size];
        let mut pattern_largest_edge = vec![0.0f64; table_size];
        let mut pattern_key_hashes = vec![0u16; table_size];
        let (mut min_scale, mut max_scale) = (f64::INFINITY, 0.0f64);
        let mut stored = 0u32;

        for pat in &pattern_set {
            let Some(code) = GeometricCode::from_vectors(&pat.map(|i| vectors[i as usize])) else {
                continue;
            };
            let hash = key_hash(&code.key(pattern_bins), pattern_bins);
            let mut ordered = *pat;
            canonical_order(&mut ordered, |i| {
                let v = vectors[i as usize];
                [v.x, v.y, v.z]
            });
            let slot = insert_pattern(ordered, hash_to_index(hash, table_size), &mut pattern_catalog)
                .ok_or_else(|| anyhow::anyhow!("pattern table of {} slots is full", table_size))?;
            pattern_largest_edge[slot] = code.largest_edge;
            pattern_key_hashes[slot] = short_hash(hash);
            min_scale = min_scale.min(code.largest_edge);
            max_scale = max_scale.max(code.largest_edge);
            stored += 1;
        }
        if stored == 0 {
            min_scale = 0.0;
        }

        let (coverage_centre, coverage_radius_rad) = coverage(&vectors);
        info!(
            "Index '{}': {} stars, {} patterns in {} slots, scale band {:.4}..{:.4} deg, coverage radius {:.3} deg",
            name,
            num_stars,
            stored,
            table_size,
            min_scale.to_degrees(),
            max_scale.to_degrees(),
            coverage_radius_rad.to_degrees()
        );

        let props = IndexProperties {
            pattern_bins,
            pattern_max_error: config.pattern_max_error,
            min_scale_rad: min_scale,
            max_scale_rad: max_scale,
            min_fov_rad: min_fov,
            max_fov_rad: max_fov,
            num_patterns: stored,
            star_max_magnitude,
            stars_per_fov: config.stars_per_fov,
            patterns_per_field: config.patterns_per_field,
            coverage_centre,
            coverage_radius_rad,
        };
        debug!("{props:?}");

        Ok(Self {
            name,
            star_catalog,
            star_vectors: vectors.iter().map(|v| [v.x, v.y, v.z]).collect(),
            pattern_catalog,
            pattern_largest_edge,
            pattern_key_hashes,
            props,
        })
    }
}

/// Normalized mean direction and the largest distance of any star from it.
/// Sky-wide sets whose mean cancels out get a radius of π.
fn coverage(vectors: &[Vector3<f64>]) -> ([f64; 3], f64) {
    let sum: Vector3<f64> = vectors.iter().sum();
    let norm = sum.norm();
    if !(norm > 1e-9 * vectors.len() as f64) {
        return ([0.0, 0.0, 1.0], std::f64::consts::PI);
    }
    let centre = sum / norm;
    let radius = vectors
        .iter()
        .map(|v| angular_distance(&centre, v))
        .fold(0.0, f64::max);
    ([centre.x, centre.y, centre.z], radius)
}
