//! Log-odds verification of a WCS hypothesis against an index.
//!
//! Each field star is either explained by a nearby projected reference star or
//! is a distractor. Relative to a background model of stars falling uniformly
//! on the image, a star matched at distance `d` contributes
//! `ln((1 - f) · A · g(d; σ) / N_ref + f)` and an unmatched star `ln f`, where
//! `A` is the image area, `f` the distractor fraction, `g` a 2-D Gaussian and
//! `N_ref` the number of reference stars on the image.

use super::wcs::{project_index_stars, TanWcs};
use crate::index::IndexFile;

/// Scores below this cannot recover; verification stops early.
pub const BAIL_LOG_ODDS: f64 = -230.258_509_299_404_6; // ln(1e-100)

/// Matching radius in units of the per-star sigma.
const MATCH_NSIGMA: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifyConfig {
    /// Positional sigma at the quad, pixels.
    pub sigma_px: f64,
    pub distractor_fraction: f64,
    /// Field stars examined, in ranked order.
    pub max_stars: usize,
}

/// The quad that produced a hypothesis. Positional errors grow with distance
/// from it, and its own stars are not scored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadFrame {
    pub stars: [usize; 4],
    pub centre: (f64, f64),
    pub radius_px: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub log_odds: f64,
    /// `(field_idx, index_star)` agreeing correspondences.
    pub matches: Vec<(usize, usize)>,
    pub num_references: usize,
    /// Whether the score dropped below [`BAIL_LOG_ODDS`].
    pub bailed: bool,
}

/// Score `wcs` over `field` (ranked pixel positions).
///
/// With a `quad`, `σᵢ² = σ₀²(1 + dᵢ²/r_q²)` where `dᵢ` is the distance from
/// the quad centre; without one every star uses `σ₀`.
pub fn verify(
    wcs: &TanWcs,
    field: &[(f64, f64)],
    quad: &QuadFrame,
    grow_sigma: bool,
    index: &IndexFile,
    config: &VerifyConfig,
) -> Verification {
    let refs = project_index_stars(wcs, index);
    let n_ref = refs.len();
    if n_ref == 0 {
        return Verification {
            log_odds: BAIL_LOG_ODDS,
            matches: Vec::new(),
            num_references: 0,
            bailed: true,
        };
    }

    let area = wcs.image_size.0 as f64 * wcs.image_size.1 as f64;
    let f = config.distractor_fraction.clamp(1e-6, 1.0 - 1e-6);
    let ln_f = f.ln();
    let sigma0_sq = config.sigma_px.max(1e-3).powi(2);
    let r_q_sq = quad.radius_px.max(1.0).powi(2);

    let mut claimed = vec![false; n_ref];
    let mut matches = Vec::new();
    let mut log_odds = 0.0;
    for (fi, &(x, y)) in field.iter().enumerate().take(config.max_stars) {
        if quad.stars.contains(&fi) {
            continue;
        }
        let sigma_sq = if grow_sigma {
            let d_sq = (x - quad.centre.0).powi(2) + (y - quad.centre.1).powi(2);
            sigma0_sq * (1.0 + d_sq / r_q_sq)
        } else {
            sigma0_sq
        };
        let limit_sq = MATCH_NSIGMA * MATCH_NSIGMA * sigma_sq;

        let nearest = refs
            .iter()
            .enumerate()
            .filter(|(k, _)| !claimed[*k])
            .map(|(k, &(_, rx, ry))| (k, (rx - x).powi(2) + (ry - y).powi(2)))
            .filter(|&(_, d_sq)| d_sq <= limit_sq)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match nearest {
            Some((k, d_sq)) => {
                claimed[k] = true;
                matches.push((fi, refs[k].0));
                let g = (-d_sq / (2.0 * sigma_sq)).exp() / (std::f64::consts::TAU * sigma_sq);
                log_odds += ((1.0 - f) * area * g / n_ref as f64 + f).ln();
            }
            None => log_odds += ln_f,
        }

        if log_odds < BAIL_LOG_ODDS {
            return Verification {
                log_odds,
                matches,
                num_references: n_ref,
                bailed: true,
            };
        }
    }

    Verification {
        log_odds,
        matches,
        num_references: n_ref,
        bailed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BuildIndexConfig;
    use crate::starcatalog::{uvec_to_radec, ReferenceStar};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn wcs() -> TanWcs {
        let s = (1.0f64 / 3600.0).to_radians();
        TanWcs {
            crval: [150f64.to_radians(), 2f64.to_radians()],
            crpix: TanWcs::image_centre((800, 800)),
            cd: [[-s, 0.0], [0.0, -s]],
            image_size: (800, 800),
        }
    }

    /// An index built from stars scattered over the field, plus their pixel
    /// positions under `wcs()`, ranked by brightness.
    fn setup() -> (IndexFile, Vec<(f64, f64)>) {
        let w = wcs();
        let mut rng = StdRng::seed_from_u64(21);
        let mut stars = Vec::new();
        for i in 0..60 {
            let (x, y) = (rng.random_range(0.0..799.0), rng.random_range(0.0..799.0));
            let (ra, dec) = uvec_to_radec(&w.pixel_to_uvec(x, y));
            stars.push(ReferenceStar { id: i, ra_rad: ra, dec_rad: dec, mag: 8.0 + i as f32 * 0.05 });
        }
        let config = BuildIndexConfig {
            max_fov_deg: 0.3,
            min_fov_deg: Some(0.15),
            star_max_magnitude: Some(20.0),
            pattern_max_error: 0.002,
            patterns_per_field: 5,
            stars_per_fov: 20,
            ..Default::default()
        };
        let index = IndexFile::build("verify", &stars, &config).unwrap();
        let field = (0..index.num_stars())
            .map(|i| w.uvec_to_pixel(&index.star_vector(i)).unwrap())
            .collect();
        (index, field)
    }

    const CONFIG: VerifyConfig = VerifyConfig {
        sigma_px: 1.0,
        distractor_fraction: 0.25,
        max_stars: 100,
    };

    fn quad() -> QuadFrame {
        QuadFrame {
            stars: [0, 1, 2, 3],
            centre: (400.0, 400.0),
            radius_px: 200.0,
        }
    }

    #[test]
    fn true_hypothesis_scores_high() {
        let (index, field) = setup();
        let v = verify(&wcs(), &field, &quad(), true, &index, &CONFIG);
        assert!(!v.bailed);
        assert_eq!(v.num_references, 60);
        assert_eq!(v.matches.len(), 56);
        assert!(v.log_odds > 1e9f64.ln(), "log odds {}", v.log_odds);
        assert!(v.matches.iter().all(|&(fi, si)| fi == si));
    }

    #[test]
    fn wrong_hypothesis_scores_low() {
        let (index, field) = setup();
        let mut shifted = wcs();
        shifted.crpix[0] += 37.0;
        let v = verify(&shifted, &field, &quad(), false, &index, &CONFIG);
        assert!(v.log_odds < 0.0, "log odds {}", v.log_odds);
    }

    #[test]
    fn empty_sky_bails() {
        let (index, field) = setup();
        let mut elsewhere = wcs();
        elsewhere.crval = [10f64.to_radians(), -50f64.to_radians()];
        let v = verify(&elsewhere, &field, &quad(), true, &index, &CONFIG);
        assert!(v.bailed);
        assert_eq!(v.num_references, 0);
    }
}
