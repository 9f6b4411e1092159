//! Solve parameters and the built-in parameter profiles.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::extraction::ExtractionProfile;
use crate::filter::{StarFilter, Trim};

// ── Scale ───────────────────────────────────────────────────────────────────

/// Units of a pixel-scale prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleUnits {
    /// Image width in degrees.
    DegWidth,
    /// Image width in arcminutes.
    ArcminWidth,
    ArcsecPerPixel,
    /// Focal length in millimetres of a lens on a 36 mm wide sensor.
    FocalMm,
}

impl FromStr for ScaleUnits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dw" | "degw" | "degwidth" => Ok(Self::DegWidth),
            "aw" | "amw" | "arcminwidth" => Ok(Self::ArcminWidth),
            "app" | "arcsecperpix" => Ok(Self::ArcsecPerPixel),
            "focalmm" => Ok(Self::FocalMm),
            other => Err(format!("unknown scale units '{other}'")),
        }
    }
}

impl fmt::Display for ScaleUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DegWidth => "degwidth",
            Self::ArcminWidth => "arcminwidth",
            Self::ArcsecPerPixel => "arcsecperpix",
            Self::FocalMm => "focalmm",
        })
    }
}

/// Bounds on the image scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleBounds {
    pub low: f64,
    pub high: f64,
    pub units: ScaleUnits,
}

impl ScaleBounds {
    /// Pixel-scale range in radians per pixel for an image `width` pixels wide,
    /// ordered low to high.
    pub fn to_rad_per_px(&self, width: u32) -> (f64, f64) {
        let w = width.max(1) as f64;
        let convert = |v: f64| -> f64 {
            match self.units {
                ScaleUnits::DegWidth => v.to_radians() / w,
                ScaleUnits::ArcminWidth => (v / 60.0).to_radians() / w,
                ScaleUnits::ArcsecPerPixel => (v / 3600.0).to_radians(),
                ScaleUnits::FocalMm => 2.0 * (36.0 / (2.0 * v)).atan() / w,
            }
        };
        let (a, b) = (convert(self.low), convert(self.high));
        (a.min(b), a.max(b))
    }
}

/// A prior on where the image points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub radius_deg: f64,
}

// ── Search shape ────────────────────────────────────────────────────────────

/// Worker threads for the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    /// Run every work unit on the calling thread, in catalog order.
    Sequential,
    Threads(usize),
    /// One thread per available core.
    #[default]
    Auto,
}

impl Parallelism {
    /// Worker count; 1 means sequential.
    pub fn threads(&self) -> usize {
        match *self {
            Self::Sequential => 1,
            Self::Threads(n) => n.max(1),
            Self::Auto => std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// How each index file's search is split into work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPartition {
    /// One unit per index file.
    #[default]
    None,
    /// Quadratic sub-ranges of the scale range.
    Scales,
    /// Ranges of star depth in the ranked list.
    Depths,
    /// Choose from the priors given.
    Auto,
}

impl SearchPartition {
    /// Resolve `Auto`: with both priors there is nothing to split; a position
    /// alone splits scales; a scale alone splits depths; no prior splits scales.
    pub fn resolve(self, has_scale: bool, has_position: bool) -> Self {
        match self {
            Self::Auto => match (has_scale, has_position) {
                (true, true) => Self::None,
                (false, true) => Self::Scales,
                (true, false) => Self::Depths,
                (false, false) => Self::Scales,
            },
            other => other,
        }
    }
}

// ── Log-odds ────────────────────────────────────────────────────────────────

/// Natural-log odds thresholds of the verification escalation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogOddsThresholds {
    /// A candidate at or above this is accepted.
    pub to_solve: f64,
    /// The search stops once the best candidate reaches this.
    pub to_keep: f64,
    /// Accepted candidates are refined until they reach this.
    pub to_tune: f64,
}

impl Default for LogOddsThresholds {
    fn default() -> Self {
        Self {
            to_solve: 1e9f64.ln(),
            to_keep: 1e9f64.ln(),
            to_tune: 1e12f64.ln(),
        }
    }
}

impl LogOddsThresholds {
    /// Raise out-of-order thresholds so `to_solve <= to_keep <= to_tune`.
    pub fn clamped(self) -> Self {
        let mut out = self;
        if out.to_keep < out.to_solve {
            warn!("to_keep {:.2} below to_solve {:.2}; raising it", out.to_keep, out.to_solve);
            out.to_keep = out.to_solve;
        }
        if out.to_tune < out.to_keep {
            warn!("to_tune {:.2} below to_keep {:.2}; raising it", out.to_tune, out.to_keep);
            out.to_tune = out.to_keep;
        }
        out
    }
}

// ── Parameters ──────────────────────────────────────────────────────────────

/// Everything a solve needs besides the image and the indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveParameters {
    pub search_position: Option<SearchPosition>,
    pub scale: Option<ScaleBounds>,
    /// Image-width bounds used without a scale prior, degrees. Default 0.1..180
    pub min_width_deg: f64,
    pub max_width_deg: f64,
    /// Wall-clock budget for the whole search. Default 600 s
    pub time_limit: Duration,
    /// Optional cap on the number of quads probed.
    pub max_quads: Option<u64>,
    pub parallelism: Parallelism,
    pub partition: SearchPartition,
    pub log_odds: LogOddsThresholds,
    pub extraction: ExtractionProfile,
    /// Positional uncertainty of a field star, pixels. Default 1.0
    pub match_sigma_px: f64,
    /// Fraction of field stars assumed to have no counterpart. Default 0.25
    pub distractor_fraction: f64,
    /// Field stars examined per verification. Default 100
    pub max_verify_stars: usize,
    /// Refit-and-reverify rounds for an accepted candidate. Default 5
    pub max_tune_iterations: usize,
    /// Smallest quad, as a fraction of the image diagonal. Default 0.1
    pub min_quad_fraction: f64,
}

impl Default for SolveParameters {
    fn default() -> Self {
        Self {
            search_position: None,
            scale: None,
            min_width_deg: 0.1,
            max_width_deg: 180.0,
            time_limit: Duration::from_secs(600),
            max_quads: None,
            parallelism: Parallelism::Auto,
            partition: SearchPartition::None,
            log_odds: LogOddsThresholds::default(),
            extraction: ExtractionProfile::default(),
            match_sigma_px: 1.0,
            distractor_fraction: 0.25,
            max_verify_stars: 100,
            max_tune_iterations: 5,
            min_quad_fraction: 0.1,
        }
    }
}

impl SolveParameters {
    /// Pixel-scale search range in radians per pixel.
    pub fn scale_range(&self, width: u32) -> (f64, f64) {
        match &self.scale {
            Some(bounds) => bounds.to_rad_per_px(width),
            None => ScaleBounds {
                low: self.min_width_deg,
                high: self.max_width_deg,
                units: ScaleUnits::DegWidth,
            }
            .to_rad_per_px(width),
        }
    }
}

// ── Profiles ────────────────────────────────────────────────────────────────

/// Named parameter sets for common situations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParametersProfile {
    FastSolving,
    ParallelSolving,
    ParallelLargeScale,
    ParallelSmallScale,
    AllStars,
    SmallSizedStars,
    MidSizedStars,
    BigSizedStars,
}

impl ParametersProfile {
    pub const ALL: [ParametersProfile; 8] = [
        Self::FastSolving,
        Self::ParallelSolving,
        Self::ParallelLargeScale,
        Self::ParallelSmallScale,
        Self::AllStars,
        Self::SmallSizedStars,
        Self::MidSizedStars,
        Self::BigSizedStars,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::FastSolving => "1-FastSolving",
            Self::ParallelSolving => "2-ParallelSolving",
            Self::ParallelLargeScale => "3-ParallelLargeScale",
            Self::ParallelSmallScale => "4-ParallelSmallScale",
            Self::AllStars => "5-AllStars",
            Self::SmallSizedStars => "6-SmallSizedStars",
            Self::MidSizedStars => "7-MidSizedStars",
            Self::BigSizedStars => "8-BigSizedStars",
        }
    }

    pub fn parameters(&self) -> SolveParameters {
        let base = SolveParameters::default();
        let solving = |fwhm: f32, partition: SearchPartition| SolveParameters {
            min_width_deg: 1.0,
            max_width_deg: 10.0,
            partition,
            extraction: ExtractionProfile {
                downsample: 2,
                conv_fwhm: Some(fwhm),
                filter: StarFilter {
                    keep_num: Some(50),
                    max_ellipse: Some(1.5),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..base.clone()
        };
        let stars = |fwhm: f32, r_min: f64, filter: StarFilter, min_area: usize| SolveParameters {
            extraction: ExtractionProfile {
                conv_fwhm: Some(fwhm),
                r_min,
                min_area,
                filter: StarFilter {
                    max_ellipse: Some(1.5),
                    ..filter
                },
                ..Default::default()
            },
            ..base.clone()
        };
        let default_area = ExtractionProfile::default().min_area;

        match self {
            Self::FastSolving => solving(4.0, SearchPartition::None),
            Self::ParallelSolving | Self::ParallelLargeScale | Self::ParallelSmallScale => {
                solving(2.0, SearchPartition::Auto)
            }
            Self::AllStars => stars(1.0, 2.0, StarFilter::default(), default_area),
            Self::SmallSizedStars => stars(
                1.0,
                2.0,
                StarFilter {
                    max_size: Some(5.0),
                    saturation_limit_percent: Some(80.0),
                    ..Default::default()
                },
                default_area,
            ),
            Self::MidSizedStars => stars(
                4.0,
                5.0,
                StarFilter {
                    remove_dimmest: Trim::Percent(20.0),
                    min_size: Some(2.0),
                    max_size: Some(10.0),
                    saturation_limit_percent: Some(80.0),
                    ..Default::default()
                },
                20,
            ),
            Self::BigSizedStars => stars(
                8.0,
                20.0,
                StarFilter {
                    min_size: Some(5.0),
                    remove_dimmest: Trim::Percent(50.0),
                    ..Default::default()
                },
                40,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn scale_unit_strings() {
        for s in ["dw", "degw", "DegWidth"] {
            assert_eq!(s.parse::<ScaleUnits>().unwrap(), ScaleUnits::DegWidth);
        }
        for s in ["aw", "amw", "arcminwidth"] {
            assert_eq!(s.parse::<ScaleUnits>().unwrap(), ScaleUnits::ArcminWidth);
        }
        assert_eq!("app".parse::<ScaleUnits>().unwrap(), ScaleUnits::ArcsecPerPixel);
        assert_eq!("arcsecperpix".parse::<ScaleUnits>().unwrap(), ScaleUnits::ArcsecPerPixel);
        assert_eq!("focalmm".parse::<ScaleUnits>().unwrap(), ScaleUnits::FocalMm);
        assert!("furlongs".parse::<ScaleUnits>().is_err());
        assert_eq!(ScaleUnits::ArcminWidth.to_string().parse::<ScaleUnits>().unwrap(), ScaleUnits::ArcminWidth);
    }

    #[test]
    fn scale_conversions_agree() {
        let arcsec = (1.0f64 / 3600.0).to_radians();
        let app = ScaleBounds { low: 1.0, high: 2.0, units: ScaleUnits::ArcsecPerPixel };
        let (lo, hi) = app.to_rad_per_px(1000);
        assert_relative_eq!(lo, arcsec, max_relative = 1e-12);
        assert_relative_eq!(hi, 2.0 * arcsec, max_relative = 1e-12);

        let amw = ScaleBounds { low: 1000.0 / 60.0, high: 2000.0 / 60.0, units: ScaleUnits::ArcminWidth };
        let (lo2, hi2) = amw.to_rad_per_px(1000);
        assert_relative_eq!(lo2, lo, max_relative = 1e-12);
        assert_relative_eq!(hi2, hi, max_relative = 1e-12);

        // Longer focal lengths give narrower fields; bounds come back ordered.
        let focal = ScaleBounds { low: 50.0, high: 200.0, units: ScaleUnits::FocalMm };
        let (flo, fhi) = focal.to_rad_per_px(6000);
        assert!(flo < fhi);
        assert_relative_eq!(fhi * 6000.0, 2.0 * (36.0f64 / 100.0).atan(), max_relative = 1e-12);
    }

    #[test]
    fn auto_partition_rules() {
        let auto = SearchPartition::Auto;
        assert_eq!(auto.resolve(true, true), SearchPartition::None);
        assert_eq!(auto.resolve(false, true), SearchPartition::Scales);
        assert_eq!(auto.resolve(true, false), SearchPartition::Depths);
        assert_eq!(auto.resolve(false, false), SearchPartition::Scales);
        assert_eq!(SearchPartition::Depths.resolve(false, false), SearchPartition::Depths);
    }

    #[test]
    fn thresholds_are_clamped_upward() {
        let t = LogOddsThresholds { to_solve: 20.0, to_keep: 10.0, to_tune: 5.0 }.clamped();
        assert_eq!((t.to_solve, t.to_keep, t.to_tune), (20.0, 20.0, 20.0));
        let d = LogOddsThresholds::default();
        assert_eq!(d.clamped(), d);
    }

    #[test]
    fn builtin_profiles() {
        let fast = ParametersProfile::FastSolving.parameters();
        assert_eq!(fast.extraction.downsample, 2);
        assert_eq!(fast.extraction.filter.keep_num, Some(50));
        assert_eq!((fast.min_width_deg, fast.max_width_deg), (1.0, 10.0));
        assert_eq!(fast.partition, SearchPartition::None);

        let par = ParametersProfile::ParallelSolving.parameters();
        assert_eq!(par.partition, SearchPartition::Auto);
        assert_eq!(par.extraction.conv_fwhm, Some(2.0));

        let mid = ParametersProfile::MidSizedStars.parameters();
        assert_eq!(mid.extraction.min_area, 20);
        assert_eq!(mid.extraction.filter.remove_dimmest, Trim::Percent(20.0));
        assert_eq!(mid.extraction.filter.max_ellipse, Some(1.5));

        let big = ParametersProfile::BigSizedStars.parameters();
        assert_eq!(big.extraction.r_min, 20.0);
        assert_eq!(big.extraction.filter.saturation_limit_percent, None);

        let names: Vec<&str> = ParametersProfile::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), 8);
        assert!(names.iter().all(|n| !n.is_empty()));
    }
}
