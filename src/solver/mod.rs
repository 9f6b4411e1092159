//! Blind astrometric solving of a ranked star list against index files.
//!
//! The search, in the astrometry.net manner:
//!
//! 1. **Quads**: 4-subsets of the field stars are drawn brightest-first and
//!    reduced to a scale/rotation invariant geometric code.
//! 2. **Lookup**: every index pattern whose code agrees within the index
//!    tolerance, at a plausible pixel scale, gives a TAN hypothesis fitted to
//!    the 4 star pairs.
//! 3. **Verification**: hypotheses are scored by the log-odds that the field
//!    stars are explained by the projected index stars; accepted candidates
//!    are refitted and rescored while that improves them.
//! 4. **Fit**: the best candidate is refined over all agreeing stars with
//!    outlier clipping and converted into a [`Solution`].

pub mod best;
pub mod cancel;
pub mod matcher;
pub mod search;
pub mod verify;
pub mod wcs;

pub use best::BestMatchSlot;
pub use cancel::{CancelToken, SolveBudget, Stop};
pub use search::{solve_star_list, Search, SearchReport};
pub use wcs::TanWcs;

use crate::star::StarList;

/// Handedness of the image relative to the sky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// East is counter-clockwise from north, as seen on the sky.
    Normal,
    /// The image is mirrored.
    Flipped,
}

/// A field star identified with an index star.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedStar {
    /// Position in the solved star list.
    pub star_index: usize,
    pub x: f64,
    pub y: f64,
    /// Catalog position of the index star, degrees.
    pub ra_deg: f64,
    pub dec_deg: f64,
    /// Catalog identifier of the index star.
    pub reference_id: u64,
    /// Distance between the star and the projected index star, pixels.
    pub residual_px: f64,
}

/// Result of a successful solve.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Sky position of the image centre, degrees.
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub field_width_arcmin: f64,
    pub field_height_arcmin: f64,
    pub pixel_scale_arcsec: f64,
    /// The image "up" direction is this many degrees east of north.
    pub orientation_deg: f64,
    pub parity: Parity,
    /// Offset of the image centre from the search position, arcseconds on the
    /// sky `(ΔRA·cos δ, ΔDec)`. Only set when a search position was given.
    pub position_error_arcsec: Option<(f64, f64)>,
    pub log_odds: f64,
    pub num_matches: usize,
    /// Name of the index file that solved the field.
    pub index_name: String,
    pub wcs: TanWcs,
    pub matched_stars: Vec<MatchedStar>,
    pub rms_residual_px: f64,
}

impl Solution {
    /// Pixel to sky, degrees.
    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let (ra, dec) = self.wcs.pixel_to_sky(x, y);
        (ra.to_degrees(), dec.to_degrees())
    }

    /// Sky (degrees) to pixel; `None` for positions on the far side of the
    /// tangent plane.
    pub fn sky_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        self.wcs.sky_to_pixel(ra_deg.to_radians(), dec_deg.to_radians())
    }

    /// `(ra_deg, dec_deg)` of every star, in list order.
    pub fn sky_positions(&self, stars: &StarList) -> Vec<(f64, f64)> {
        stars.iter().map(|s| self.pixel_to_sky(s.x, s.y)).collect()
    }

    /// One line describing the solution.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "RA {:.6}° Dec {:+.6}°, {:.2}' x {:.2}', {:.4}\"/px, up {:.2}° E of N, {}",
            self.ra_deg,
            self.dec_deg,
            self.field_width_arcmin,
            self.field_height_arcmin,
            self.pixel_scale_arcsec,
            self.orientation_deg,
            match self.parity {
                Parity::Normal => "normal parity",
                Parity::Flipped => "flipped parity",
            }
        );
        out.push_str(&format!(
            ", {} matches (rms {:.2} px), log-odds {:.1}, index {}",
            self.num_matches, self.rms_residual_px, self.log_odds, self.index_name
        ));
        if let Some((dra, ddec)) = self.position_error_arcsec {
            out.push_str(&format!(", offset {dra:.1}\" / {ddec:.1}\""));
        }
        out
    }
}

/// Arcseconds of `(ra, dec)` from `(ra0, dec0)`, all in degrees, with the RA
/// difference wrapped and scaled by `cos dec`.
pub(crate) fn position_error_arcsec(ra: f64, dec: f64, ra0: f64, dec0: f64) -> (f64, f64) {
    let dra = (ra - ra0 + 180.0).rem_euclid(360.0) - 180.0;
    (dra * dec.to_radians().cos() * 3600.0, (dec - dec0) * 3600.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::Star;
    use approx::assert_relative_eq;

    fn solution() -> Solution {
        let s = (1.5f64 / 3600.0).to_radians();
        let wcs = TanWcs {
            crval: [45f64.to_radians(), 30f64.to_radians()],
            crpix: TanWcs::image_centre((400, 300)),
            cd: [[-s, 0.0], [0.0, -s]],
            image_size: (400, 300),
        };
        Solution {
            ra_deg: 45.0,
            dec_deg: 30.0,
            field_width_arcmin: 10.0,
            field_height_arcmin: 7.5,
            pixel_scale_arcsec: 1.5,
            orientation_deg: 0.0,
            parity: wcs.parity(),
            position_error_arcsec: Some((1.0, -2.0)),
            log_odds: 120.0,
            num_matches: 30,
            index_name: "test".into(),
            wcs,
            matched_stars: Vec::new(),
            rms_residual_px: 0.1,
        }
    }

    #[test]
    fn pixel_sky_round_trip() {
        let sol = solution();
        let (ra, dec) = sol.pixel_to_sky(199.5, 149.5);
        assert_relative_eq!(ra, 45.0, epsilon = 1e-9);
        assert_relative_eq!(dec, 30.0, epsilon = 1e-9);
        let (x, y) = sol.sky_to_pixel(45.01, 30.02).unwrap();
        let (ra2, dec2) = sol.pixel_to_sky(x, y);
        assert_relative_eq!(ra2, 45.01, epsilon = 1e-9);
        assert_relative_eq!(dec2, 30.02, epsilon = 1e-9);
    }

    #[test]
    fn sky_positions_follow_the_list() {
        let sol = solution();
        let star = |x, y| Star { x, y, flux: 1.0, peak: 1.0, background: 0.0, a: 1.0, b: 1.0, theta_deg: 0.0, hfr: 0.0, mag: 0.0, num_pixels: 5, border: false };
        let list = StarList::new(vec![star(199.5, 149.5), star(0.0, 0.0)]);
        let pos = sol.sky_positions(&list);
        assert_eq!(pos.len(), 2);
        assert_relative_eq!(pos[0].0, 45.0, epsilon = 1e-9);
        // Top-left is north-east of the centre with north up and east left.
        assert!(pos[1].0 > 45.0 && pos[1].1 > 30.0);
    }

    #[test]
    fn summary_mentions_the_essentials() {
        let text = solution().summary();
        assert!(text.contains("RA 45.000000°"));
        assert!(text.contains("normal parity"));
        assert!(text.contains("matches (rms"));
        assert!(text.contains("index test"));
        assert!(text.contains("offset"));
    }

    #[test]
    fn position_error_wraps_ra() {
        let (dra, ddec) = position_error_arcsec(0.001, 0.0, 359.999, 0.0);
        assert_relative_eq!(dra, 7.2, epsilon = 1e-6);
        assert_relative_eq!(ddec, 0.0);
        let (dra, _) = position_error_arcsec(10.0, 60.0, 10.01, 60.0);
        assert_relative_eq!(dra, -18.0, epsilon = 1e-6);
    }
}
