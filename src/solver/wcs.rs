//! Gnomonic (TAN) world coordinate system: projection, least-squares fitting
//! and iterative refinement.
//!
//! The CD matrix maps pixel offsets from CRPIX to tangent-plane coordinates
//! `(ξ, η)` in radians at CRVAL, with ξ toward east and η toward north. Pixel
//! coordinates have their origin at the centre of the top-left pixel and y
//! increases downward.
//!
//! ## Fitting
//!
//! 1. TAN-project the matched sky positions at the current CRVAL.
//! 2. Solve two 3-parameter linear systems for `[CD11, CD12, ξ₀]` and
//!    `[CD21, CD22, η₀]`.
//! 3. Move CRVAL by `(ξ₀, η₀)` through the inverse projection and repeat until
//!    the offset vanishes.
//!
//! [`refine`] wraps the fit in MAD outlier rejection and re-association with
//! the index stars.

use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use super::Parity;
use crate::index::IndexFile;
use crate::starcatalog::{radec_to_uvec, uvec_to_radec};

const MAD_SCALE: f64 = 1.4826;
const CLIP_NSIGMA: f64 = 3.0;
const CONVERGENCE_RAD: f64 = 1e-12;
const MAX_INNER_ITERATIONS: usize = 10;

// ── TAN projection ──────────────────────────────────────────────────────────

/// Forward gnomonic projection of `(ra, dec)` onto the plane tangent at
/// `(ra0, dec0)`. `None` on or behind the tangent plane.
#[inline]
pub fn tan_project(ra: f64, dec: f64, ra0: f64, dec0: f64) -> Option<(f64, f64)> {
    let da = ra - ra0;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let cos_da = da.cos();
    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }
    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

/// Inverse gnomonic projection; RA is wrapped into `[0, 2π)`.
#[inline]
pub fn inverse_tan_project(xi: f64, eta: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let rho = xi.hypot(eta);
    if rho < 1e-15 {
        return (ra0.rem_euclid(std::f64::consts::TAU), dec0);
    }
    let c = rho.atan();
    let (sin_c, cos_c) = c.sin_cos();
    let (sin_dec0, cos_dec0) = dec0.sin_cos();
    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).clamp(-1.0, 1.0).asin();
    let ra = ra0 + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra.rem_euclid(std::f64::consts::TAU), dec)
}

// ── The WCS ─────────────────────────────────────────────────────────────────

/// A TAN projection tied to an image.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    /// Reference sky position `[ra, dec]` in radians.
    pub crval: [f64; 2],
    /// Reference pixel `[x, y]`.
    pub crpix: [f64; 2],
    /// `[[CD11, CD12], [CD21, CD22]]` in radians per pixel.
    pub cd: [[f64; 2]; 2],
    pub image_size: (u32, u32),
}

/// A pixel position paired with a sky direction.
pub type PixelSkyPair = ((f64, f64), Vector3<f64>);

impl TanWcs {
    /// Geometric centre of an image in pixel coordinates.
    pub fn image_centre(image_size: (u32, u32)) -> [f64; 2] {
        [
            (image_size.0 as f64 - 1.0) / 2.0,
            (image_size.1 as f64 - 1.0) / 2.0,
        ]
    }

    pub fn det(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    /// Mean pixel scale in radians per pixel.
    pub fn pixel_scale(&self) -> f64 {
        self.det().abs().sqrt()
    }

    /// With y pointing down, a positive determinant is an unmirrored sky.
    pub fn parity(&self) -> Parity {
        if self.det() > 0.0 {
            Parity::Normal
        } else {
            Parity::Flipped
        }
    }

    /// Position angle of the image "up" direction, degrees east of north in
    /// `(-180, 180]`.
    pub fn orientation_deg(&self) -> f64 {
        // "Up" is the pixel direction (0, -1).
        let d_xi = -self.cd[0][1];
        let d_eta = -self.cd[1][1];
        d_xi.atan2(d_eta).to_degrees()
    }

    /// Ratio of the larger to the smaller singular value of CD.
    pub fn axis_ratio(&self) -> f64 {
        let [[a, b], [c, d]] = self.cd;
        let q = ((a + d) / 2.0).hypot((c - b) / 2.0);
        let r = ((a - d) / 2.0).hypot((c + b) / 2.0);
        let (s1, s2) = (q + r, (q - r).abs());
        if s2 > 0.0 {
            s1 / s2
        } else {
            f64::INFINITY
        }
    }

    fn cd_inverse(&self) -> Option<[[f64; 2]; 2]> {
        let det = self.det();
        if !(det.abs() > 1e-30) {
            return None;
        }
        let [[a, b], [c, d]] = self.cd;
        Some([[d / det, -b / det], [-c / det, a / det]])
    }

    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let (dx, dy) = (x - self.crpix[0], y - self.crpix[1]);
        let xi = self.cd[0][0] * dx + self.cd[0][1] * dy;
        let eta = self.cd[1][0] * dx + self.cd[1][1] * dy;
        inverse_tan_project(xi, eta, self.crval[0], self.crval[1])
    }

    pub fn pixel_to_uvec(&self, x: f64, y: f64) -> Vector3<f64> {
        let (ra, dec) = self.pixel_to_sky(x, y);
        radec_to_uvec(ra, dec)
    }

    /// `None` for points on the far side of the tangent plane.
    pub fn sky_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        let (xi, eta) = tan_project(ra, dec, self.crval[0], self.crval[1])?;
        let inv = self.cd_inverse()?;
        Some((
            self.crpix[0] + inv[0][0] * xi + inv[0][1] * eta,
            self.crpix[1] + inv[1][0] * xi + inv[1][1] * eta,
        ))
    }

    pub fn uvec_to_pixel(&self, v: &Vector3<f64>) -> Option<(f64, f64)> {
        let (ra, dec) = uvec_to_radec(v);
        self.sky_to_pixel(ra, dec)
    }

    /// Whether a pixel position falls on the image.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= -0.5 && y >= -0.5 && x < self.image_size.0 as f64 - 0.5 && y < self.image_size.1 as f64 - 0.5
    }

    /// Angular radius from the image centre to a corner.
    pub fn field_radius(&self) -> f64 {
        let (w, h) = (self.image_size.0 as f64, self.image_size.1 as f64);
        self.pixel_scale() * w.hypot(h) / 2.0
    }

    /// Least-squares TAN fit with CRPIX fixed.
    ///
    /// `crval_guess` only seeds the iteration. Needs at least 3 pairs; `None`
    /// when the pairs are degenerate.
    pub fn fit(
        pairs: &[PixelSkyPair],
        crpix: [f64; 2],
        crval_guess: (f64, f64),
        image_size: (u32, u32),
    ) -> Option<Self> {
        if pairs.len() < 3 {
            return None;
        }
        let (mut ra0, mut dec0) = crval_guess;
        let mut cd = None;
        for _ in 0..MAX_INNER_ITERATIONS {
            let mut ata = Matrix3::<f64>::zeros();
            let mut atb_xi = Vector3::<f64>::zeros();
            let mut atb_eta = Vector3::<f64>::zeros();
            let mut n_valid = 0;
            for ((x, y), v) in pairs {
                let (ra, dec) = uvec_to_radec(v);
                let Some((xi, eta)) = tan_project(ra, dec, ra0, dec0) else {
                    continue;
                };
                let row = Vector3::new(x - crpix[0], y - crpix[1], 1.0);
                ata += row * row.transpose();
                atb_xi += row * xi;
                atb_eta += row * eta;
                n_valid += 1;
            }
            if n_valid < 3 {
                return None;
            }
            // Reject near-singular geometry (collinear or coincident points).
            if !(ata.determinant().abs() > 1e-12 * ata.norm().powi(3)) {
                return None;
            }
            let inv = ata.try_inverse()?;
            let sx = inv * atb_xi;
            let se = inv * atb_eta;
            if !sx.iter().chain(se.iter()).all(|v| v.is_finite()) {
                return None;
            }
            cd = Some([[sx[0], sx[1]], [se[0], se[1]]]);
            (ra0, dec0) = inverse_tan_project(sx[2], se[2], ra0, dec0);
            if sx[2].abs() + se[2].abs() < CONVERGENCE_RAD {
                break;
            }
        }
        let wcs = Self {
            crval: [ra0, dec0],
            crpix,
            cd: cd?,
            image_size,
        };
        (wcs.det().abs() > 1e-30).then_some(wcs)
    }
}

// ── Association ─────────────────────────────────────────────────────────────

/// Index stars inside the image, with their projected pixel positions.
pub fn project_index_stars(wcs: &TanWcs, index: &IndexFile) -> Vec<(usize, f64, f64)> {
    let centre = TanWcs::image_centre(wcs.image_size);
    let dir = wcs.pixel_to_uvec(centre[0], centre[1]);
    index
        .star_catalog()
        .cone(&dir, wcs.field_radius() * 1.05)
        .into_iter()
        .filter_map(|i| {
            let (x, y) = wcs.uvec_to_pixel(&index.star_vector(i))?;
            wcs.contains(x, y).then_some((i, x, y))
        })
        .collect()
}

/// Greedy one-to-one matching, closest pairs first. Returns
/// `(field_idx, index_star)` pairs within `radius_px`.
pub fn match_nearest(
    field: &[(f64, f64)],
    predicted: &[(usize, f64, f64)],
    radius_px: f64,
) -> Vec<(usize, usize)> {
    let r2 = radius_px * radius_px;
    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (fi, &(fx, fy)) in field.iter().enumerate() {
        for &(si, px, py) in predicted {
            let d2 = (fx - px).powi(2) + (fy - py).powi(2);
            if d2 <= r2 {
                candidates.push((d2, fi, si));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut used_field = vec![false; field.len()];
    let mut used_star = std::collections::HashSet::new();
    let mut matches = Vec::new();
    for (_, fi, si) in candidates {
        if !used_field[fi] && used_star.insert(si) {
            used_field[fi] = true;
            matches.push((fi, si));
        }
    }
    matches.sort_unstable();
    matches
}

/// Pixel residual of each match under `wcs`; `NaN` when a star cannot be
/// projected.
pub fn residuals_px(
    wcs: &TanWcs,
    matches: &[(usize, usize)],
    field: &[(f64, f64)],
    index: &IndexFile,
) -> Vec<f64> {
    matches
        .iter()
        .map(|&(fi, si)| match wcs.uvec_to_pixel(&index.star_vector(si)) {
            Some((x, y)) => (x - field[fi].0).hypot(y - field[fi].1),
            None => f64::NAN,
        })
        .collect()
}

fn pairs_for(matches: &[(usize, usize)], field: &[(f64, f64)], index: &IndexFile) -> Vec<PixelSkyPair> {
    matches
        .iter()
        .map(|&(fi, si)| (field[fi], index.star_vector(si)))
        .collect()
}

/// Median and MAD-derived sigma.
fn robust_spread(values: &[f64]) -> (f64, f64) {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return (0.0, 0.0);
    }
    v.sort_by(|a, b| a.total_cmp(b));
    let median = v[v.len() / 2];
    let mut dev: Vec<f64> = v.iter().map(|x| (x - median).abs()).collect();
    dev.sort_by(|a, b| a.total_cmp(b));
    (median, MAD_SCALE * dev[dev.len() / 2])
}

// ── Refinement ──────────────────────────────────────────────────────────────

/// Outcome of [`refine`].
#[derive(Debug, Clone)]
pub struct Refined {
    pub wcs: TanWcs,
    /// `(field_idx, index_star)`, sorted.
    pub matches: Vec<(usize, usize)>,
    /// Pixel residuals parallel to `matches`.
    pub residuals_px: Vec<f64>,
}

impl Refined {
    pub fn rms_px(&self) -> f64 {
        if self.residuals_px.is_empty() {
            return 0.0;
        }
        (self.residuals_px.iter().map(|r| r * r).sum::<f64>() / self.residuals_px.len() as f64).sqrt()
    }
}

/// Refit over all correspondences with MAD clipping, then re-associate the
/// index stars and repeat until the match set settles.
///
/// `radius_px` bounds the re-association distance.
pub fn refine(
    initial: &TanWcs,
    matches: &[(usize, usize)],
    field: &[(f64, f64)],
    index: &IndexFile,
    radius_px: f64,
    max_iterations: usize,
) -> Refined {
    let mut wcs = initial.clone();
    let mut current: Vec<(usize, usize)> = matches.to_vec();
    current.sort_unstable();

    for iteration in 0..max_iterations.max(1) {
        if let Some(fit) = TanWcs::fit(
            &pairs_for(&current, field, index),
            wcs.crpix,
            (wcs.crval[0], wcs.crval[1]),
            wcs.image_size,
        ) {
            wcs = fit;
        } else {
            break;
        }

        // MAD clip.
        let residuals = residuals_px(&wcs, &current, field, index);
        let (median, sigma) = robust_spread(&residuals);
        let mut clipped = false;
        if residuals.len() >= 6 {
            let limit = median + CLIP_NSIGMA * sigma;
            let keep: Vec<(usize, usize)> = current
                .iter()
                .zip(&residuals)
                .filter(|(_, r)| **r <= limit)
                .map(|(m, _)| *m)
                .collect();
            if keep.len() < current.len() && keep.len() >= 4 {
                debug!(
                    "refine {}: clipped {} -> {} matches (limit {:.3} px)",
                    iteration,
                    current.len(),
                    keep.len(),
                    limit
                );
                current = keep;
                clipped = true;
            }
        }
        if clipped {
            continue;
        }

        // Re-associate.
        let radius = if residuals.len() >= 6 {
            (5.0 * sigma + median).max(1.0).min(radius_px.max(1.0))
        } else {
            radius_px
        };
        let associated = match_nearest(field, &project_index_stars(&wcs, index), radius);
        if associated.len() >= 4 && associated != current {
            debug!(
                "refine {}: re-associated {} -> {} matches (radius {:.2} px)",
                iteration,
                current.len(),
                associated.len(),
                radius
            );
            current = associated;
            continue;
        }
        break;
    }

    if let Some(fit) = TanWcs::fit(
        &pairs_for(&current, field, index),
        wcs.crpix,
        (wcs.crval[0], wcs.crval[1]),
        wcs.image_size,
    ) {
        wcs = fit;
    }
    let residuals_px = residuals_px(&wcs, &current, field, index);
    Refined {
        wcs,
        matches: current,
        residuals_px,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn arcsec() -> f64 {
        (1.0f64 / 3600.0).to_radians()
    }

    /// North up, east left, 1"/px, optionally rotated by `theta` (degrees
    /// east of north) and mirrored.
    fn truth(theta_deg: f64, mirrored: bool) -> TanWcs {
        let s = arcsec();
        let (sn, cs) = theta_deg.to_radians().sin_cos();
        let m = if mirrored { -1.0 } else { 1.0 };
        // CD = -s · [[cos, sin], [-sin, cos]] · diag(m, 1)
        TanWcs {
            crval: [83f64.to_radians(), 22f64.to_radians()],
            crpix: TanWcs::image_centre((1024, 768)),
            cd: [[-s * cs * m, -s * sn], [s * sn * m, -s * cs]],
            image_size: (1024, 768),
        }
    }

    #[test]
    fn projection_round_trip() {
        let (ra0, dec0) = (1.0, 0.3);
        let (xi, eta) = tan_project(1.01, 0.295, ra0, dec0).unwrap();
        let (ra, dec) = inverse_tan_project(xi, eta, ra0, dec0);
        assert_relative_eq!(ra, 1.01, epsilon = 1e-12);
        assert_relative_eq!(dec, 0.295, epsilon = 1e-12);
        assert!(tan_project(ra0 + std::f64::consts::PI, -dec0, ra0, dec0).is_none());
    }

    #[test]
    fn orientation_and_parity_conventions() {
        let north_up = truth(0.0, false);
        assert_eq!(north_up.parity(), Parity::Normal);
        assert_relative_eq!(north_up.orientation_deg(), 0.0, epsilon = 1e-9);
        // Moving up the image goes north, moving left goes east.
        let (_, dec_up) = north_up.pixel_to_sky(511.5, 100.0);
        assert!(dec_up > 22f64.to_radians());
        let (ra_left, _) = north_up.pixel_to_sky(100.0, 383.5);
        assert!(ra_left > 83f64.to_radians());

        let rotated = truth(30.0, false);
        assert_relative_eq!(rotated.orientation_deg(), 30.0, epsilon = 1e-9);
        assert_eq!(truth(30.0, true).parity(), Parity::Flipped);
        assert_relative_eq!(rotated.pixel_scale(), arcsec(), max_relative = 1e-12);
        assert_relative_eq!(rotated.axis_ratio(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn pixel_sky_round_trip() {
        let wcs = truth(-47.0, true);
        let (ra, dec) = wcs.pixel_to_sky(12.25, 700.5);
        let (x, y) = wcs.sky_to_pixel(ra, dec).unwrap();
        assert_relative_eq!(x, 12.25, epsilon = 1e-7);
        assert_relative_eq!(y, 700.5, epsilon = 1e-7);
    }

    #[test]
    fn fit_recovers_truth_from_offset_guess() {
        let wcs = truth(12.0, false);
        let pairs: Vec<PixelSkyPair> = [(10.0, 20.0), (900.0, 50.0), (500.0, 700.0), (100.0, 600.0), (640.0, 333.0)]
            .into_iter()
            .map(|(x, y)| ((x, y), wcs.pixel_to_uvec(x, y)))
            .collect();
        let guess = (83.2f64.to_radians(), 21.9f64.to_radians());
        let fit = TanWcs::fit(&pairs, wcs.crpix, guess, wcs.image_size).unwrap();
        assert_relative_eq!(fit.crval[0], wcs.crval[0], epsilon = 1e-10);
        assert_relative_eq!(fit.crval[1], wcs.crval[1], epsilon = 1e-10);
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(fit.cd[i][j], wcs.cd[i][j], epsilon = 1e-12);
            }
        }
        assert!(TanWcs::fit(&pairs[..2], wcs.crpix, guess, wcs.image_size).is_none());
        let collinear: Vec<PixelSkyPair> = (0..5)
            .map(|i| {
                let p = (100.0 * i as f64, 100.0 * i as f64);
                (p, wcs.pixel_to_uvec(p.0, p.1))
            })
            .collect();
        assert!(TanWcs::fit(&collinear, wcs.crpix, guess, wcs.image_size).is_none());
    }

    #[test]
    fn greedy_matching_is_one_to_one() {
        let field = [(0.0, 0.0), (10.0, 0.0), (0.5, 0.0)];
        let predicted = [(7, 0.2, 0.0), (8, 10.5, 0.0), (9, 50.0, 50.0)];
        let m = match_nearest(&field, &predicted, 2.0);
        assert_eq!(m, vec![(0, 7), (1, 8)]);
    }

    #[test]
    fn robust_spread_of_constant_values() {
        assert_eq!(robust_spread(&[2.0; 7]), (2.0, 0.0));
        assert_eq!(robust_spread(&[]), (0.0, 0.0));
    }
}
