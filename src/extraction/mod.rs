//! Star extraction: background subtraction, detection, deblending and
//! measurement.
//!
//! The pipeline for one [`PixelBuffer`]:
//! 1. Cut the working plane (channel, subframe) and optionally bin it down
//! 2. Estimate and subtract the sky background ([`Background`])
//! 3. Smooth with a Gaussian detection filter matched to the star FWHM
//! 4. Threshold at `threshold_sigma` times the local noise and label blobs
//! 5. Split merged blobs by multi-threshold deblending
//! 6. Measure centroid, shape, flux and half-flux radius per source
//! 7. Drop faint detections sitting in the wings of brighter ones (clean pass)
//! 8. Map to full-image coordinates, de-duplicate and rank with the
//!    [`StarFilter`]
//!
//! Extraction is sequential; it checks for cancellation between phases.
//!
//! # Example
//!
//! ```
//! use skysolve::{extract_stars, ExtractionProfile, PixelBuffer, SampleData};
//!
//! let samples = vec![100u16; 64 * 64];
//! let buffer = PixelBuffer::new(SampleData::U16(&samples), 64, 64, 1).unwrap();
//! let stars = extract_stars(&buffer, &ExtractionProfile::default()).unwrap();
//! assert!(stars.is_empty());
//! ```

mod convolve;
mod deblend;
mod label;
mod measure;

use tracing::{debug, info};

use crate::background::{Background, BackgroundConfig};
use crate::error::ExtractionError;
use crate::filter::StarFilter;
use crate::pixel_buffer::{PixelBuffer, Plane, Subframe};
use crate::solver::CancelToken;
use crate::star::{Star, StarList};

use convolve::Kernel;
use deblend::{deblend, DeblendConfig};
use measure::{measure, Detection, MeasureContext};

/// Two detections closer than this (full-image pixels) are duplicates.
const DEDUP_RADIUS_PX: f64 = 0.5;

/// Parameters controlling star extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionProfile {
    /// Channel to extract from; `None` averages all channels.
    pub channel: Option<u32>,
    /// Region of interest in full-image pixels.
    pub subframe: Option<Subframe>,
    /// Fixed binning factor applied before detection. Default: 1
    pub downsample: u32,
    /// Choose the binning as `max(w, h) / 1024 + 1`, overriding `downsample`.
    /// Default: false
    pub auto_downsample: bool,
    /// Detection threshold in units of the local background noise.
    /// Default: 2.0
    pub threshold_sigma: f32,
    /// FWHM (working-plane pixels) of the Gaussian detection filter; `None`
    /// disables filtering. Default: Some(2.0)
    pub conv_fwhm: Option<f32>,
    /// Minimum blob area in pixels. Default: 5
    pub min_area: usize,
    /// Number of deblending thresholds; below 2 disables deblending.
    /// Default: 32
    pub deblend_nthresh: usize,
    /// Minimum flux fraction for a deblended component. Default: 0.005
    pub deblend_contrast: f64,
    /// Run the clean pass. Default: true
    pub clean: bool,
    /// Scale applied to a neighbour's profile width in the clean pass.
    /// Default: 1.0
    pub clean_param: f64,
    /// Minimum aperture radius for the half-flux radius. Default: 3.5
    pub r_min: f64,
    /// Magnitude zero point. Default: 20.0
    pub magzero: f64,
    /// Compute half-flux radii. Default: true
    pub calculate_hfr: bool,
    pub background: BackgroundConfig,
    /// Post-extraction rejection and ranking.
    pub filter: StarFilter,
}

impl Default for ExtractionProfile {
    fn default() -> Self {
        Self {
            channel: None,
            subframe: None,
            downsample: 1,
            auto_downsample: false,
            threshold_sigma: 2.0,
            conv_fwhm: Some(2.0),
            min_area: 5,
            deblend_nthresh: 32,
            deblend_contrast: 0.005,
            clean: true,
            clean_param: 1.0,
            r_min: 3.5,
            magzero: 20.0,
            calculate_hfr: true,
            background: BackgroundConfig::default(),
            filter: StarFilter::default(),
        }
    }
}

impl ExtractionProfile {
    /// Binning factor for a plane of the given size.
    pub fn binning_for(&self, width: u32, height: u32) -> u32 {
        if self.auto_downsample {
            width.max(height) / 1024 + 1
        } else {
            self.downsample.max(1)
        }
    }
}

/// Result of a full extraction run.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub stars: StarList,
    /// Background model of the working plane.
    pub background: Background,
    /// Binning of the working plane relative to the image.
    pub binning: u32,
    /// Detections before filtering.
    pub num_detected: usize,
}

/// Extract and rank stars from `buffer`.
pub fn extract_stars(
    buffer: &PixelBuffer<'_>,
    profile: &ExtractionProfile,
) -> Result<StarList, ExtractionError> {
    extract(buffer, profile, &CancelToken::new()).map(|e| e.stars)
}

/// Extraction with a cancellation token, returning the background model too.
pub fn extract(
    buffer: &PixelBuffer<'_>,
    profile: &ExtractionProfile,
    cancel: &CancelToken,
) -> Result<Extraction, ExtractionError> {
    let checkpoint = || {
        if cancel.is_cancelled() {
            Err(ExtractionError::Aborted)
        } else {
            Ok(())
        }
    };

    // ── Working plane ──
    let plane = buffer.plane(profile.channel, profile.subframe)?;
    let factor = profile.binning_for(plane.width, plane.height);
    let plane = if factor > 1 && plane.width >= factor && plane.height >= factor {
        plane.downsample(factor)
    } else {
        plane
    };
    let (w, h) = (plane.width as usize, plane.height as usize);
    checkpoint()?;

    // ── Background ──
    let background = Background::estimate(&plane.data, plane.width, plane.height, &profile.background);
    let (levels, noises) = background.maps();
    let residual: Vec<f32> = plane
        .data
        .iter()
        .zip(&levels)
        .map(|(&v, &b)| if v.is_finite() { v - b } else { 0.0 })
        .collect();
    checkpoint()?;

    // ── Detection ──
    let detection = match profile.conv_fwhm.and_then(Kernel::from_fwhm) {
        Some(kernel) => kernel.apply(&residual, w, h),
        None => residual.clone(),
    };
    // A noiseless sky would otherwise detect every positive float.
    let floor = f32::EPSILON * background.level.abs().max(1.0);
    let mask: Vec<bool> = detection
        .iter()
        .zip(&noises)
        .map(|(&v, &n)| v > (profile.threshold_sigma * n).max(floor))
        .collect();
    let (labels, count) = label::label_components(&mask, w, h);
    let blobs: Vec<Vec<usize>> = label::group_pixels(&labels, count)
        .into_iter()
        .filter(|b| b.len() >= profile.min_area.max(1))
        .collect();
    debug!(
        "Extraction: {} blobs, {} above min area {}",
        count,
        blobs.len(),
        profile.min_area
    );
    checkpoint()?;

    // ── Deblend and measure ──
    let deblend_config = DeblendConfig {
        nthresh: profile.deblend_nthresh,
        contrast: profile.deblend_contrast,
    };
    let ctx = MeasureContext {
        plane: &plane,
        residual: &residual,
        background: &background,
        threshold_sigma: profile.threshold_sigma as f64,
        r_min: profile.r_min / factor as f64,
        calculate_hfr: profile.calculate_hfr,
    };
    let mut detections: Vec<Detection> = Vec::new();
    for blob in &blobs {
        for child in deblend(blob, &detection, w, &deblend_config) {
            if let Some(d) = measure(&child, &ctx) {
                detections.push(d);
            }
        }
    }
    checkpoint()?;

    if profile.clean {
        let before = detections.len();
        detections = clean(detections, profile.clean_param);
        debug!("Extraction: clean pass removed {}", before - detections.len());
    }

    // ── Publish ──
    let mut stars: Vec<Star> = detections
        .into_iter()
        .map(|d| to_star(d, &plane, profile.magzero))
        .collect();
    stars.sort_by(|a, b| b.flux.total_cmp(&a.flux));
    let stars = dedup(stars);
    let num_detected = stars.len();

    let ranked = profile
        .filter
        .apply(&StarList::new(stars), buffer.saturation_level());
    info!(
        "Extraction: background {:.2} ± {:.2}, {} detected, {} kept (binning {})",
        background.level,
        background.noise,
        num_detected,
        ranked.len(),
        factor
    );

    Ok(Extraction {
        stars: ranked,
        background,
        binning: factor,
        num_detected,
    })
}

/// Drop detections whose peak is explained by the Gaussian wing of a
/// brighter neighbour.
fn clean(mut detections: Vec<Detection>, clean_param: f64) -> Vec<Detection> {
    detections.sort_by(|a, b| b.peak_residual.total_cmp(&a.peak_residual));
    let mut keep = vec![true; detections.len()];
    for j in 0..detections.len() {
        let dj = &detections[j];
        for (i, di) in detections.iter().enumerate().take(j) {
            if !keep[i] {
                continue;
            }
            let sigma = clean_param * ((di.a * di.a + di.b * di.b) / 2.0).sqrt();
            if !(sigma > 0.0) {
                continue;
            }
            let d2 = (dj.x - di.x).powi(2) + (dj.y - di.y).powi(2);
            let wing = di.peak_residual * (-d2 / (2.0 * sigma * sigma)).exp();
            if dj.peak_residual - wing < dj.threshold {
                keep[j] = false;
                break;
            }
        }
    }
    detections
        .into_iter()
        .zip(keep)
        .filter_map(|(d, k)| k.then_some(d))
        .collect()
}

fn to_star(d: Detection, plane: &Plane, magzero: f64) -> Star {
    let bin = plane.binning as f64;
    let (x, y) = plane.to_image(d.x, d.y);
    // Binned pixels hold block means; flux sums over raw pixels.
    let flux = d.flux * bin * bin;
    Star {
        x,
        y,
        flux,
        peak: d.peak,
        background: d.background,
        a: d.a * bin,
        b: d.b * bin,
        theta_deg: d.theta_deg,
        hfr: d.hfr * bin,
        mag: magzero - 2.5 * flux.log10(),
        num_pixels: d.num_pixels * (plane.binning * plane.binning) as usize,
        border: d.border,
    }
}

/// Keep the brightest of any stars closer than [`DEDUP_RADIUS_PX`]. Input is
/// flux-sorted.
fn dedup(stars: Vec<Star>) -> Vec<Star> {
    let mut out: Vec<Star> = Vec::with_capacity(stars.len());
    let r2 = DEDUP_RADIUS_PX * DEDUP_RADIUS_PX;
    for s in stars {
        if out.iter().all(|kept| kept.distance_sq(s.x, s.y) >= r2) {
            out.push(s);
        }
    }
    out
}
