//! Per-source photometry and shape measurement.

use crate::background::Background;
use crate::pixel_buffer::Plane;

/// A measured source in working-plane coordinates, plus what the clean pass
/// needs.
#[derive(Debug, Clone)]
pub(crate) struct Detection {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
    pub peak: f64,
    /// Largest background-subtracted sample.
    pub peak_residual: f64,
    pub background: f64,
    /// Detection threshold at the peak, in residual units.
    pub threshold: f64,
    pub a: f64,
    pub b: f64,
    pub theta_deg: f64,
    pub hfr: f64,
    pub num_pixels: usize,
    pub border: bool,
}

pub(crate) struct MeasureContext<'a> {
    pub plane: &'a Plane,
    /// `plane - background`, same layout.
    pub residual: &'a [f32],
    pub background: &'a Background,
    pub threshold_sigma: f64,
    pub r_min: f64,
    pub calculate_hfr: bool,
}

/// Measure one child blob. `None` when it carries no positive flux.
pub(crate) fn measure(pixels: &[usize], ctx: &MeasureContext<'_>) -> Option<Detection> {
    let w = ctx.plane.width as usize;
    let h = ctx.plane.height as usize;
    let first = *pixels.first()?;
    // Moments relative to the first pixel keep the sums small.
    let (ref_x, ref_y) = ((first % w) as f64, (first / w) as f64);

    let (mut sum, mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0);
    let mut peak = f64::NEG_INFINITY;
    let mut peak_residual = f64::NEG_INFINITY;
    let mut peak_idx = first;
    let mut border = false;
    for &p in pixels {
        let (col, row) = (p % w, p / w);
        if col == 0 || row == 0 || col + 1 == w || row + 1 == h {
            border = true;
        }
        let raw = ctx.plane.data[p] as f64;
        let r = ctx.residual[p] as f64;
        if raw > peak {
            peak = raw;
        }
        if r > peak_residual {
            peak_residual = r;
            peak_idx = p;
        }
        let v = r.max(0.0);
        let dx = col as f64 - ref_x;
        let dy = row as f64 - ref_y;
        sum += v;
        sx += v * dx;
        sy += v * dy;
        sxx += v * dx * dx;
        syy += v * dy * dy;
        sxy += v * dx * dy;
    }
    if !(sum > 0.0) {
        return None;
    }

    let mx = sx / sum;
    let my = sy / sum;
    // A lone pixel still has the variance of a uniform pixel footprint.
    let cxx = (sxx / sum - mx * mx).max(1.0 / 12.0);
    let cyy = (syy / sum - my * my).max(1.0 / 12.0);
    let cxy = sxy / sum - mx * my;

    let half_trace = (cxx + cyy) / 2.0;
    let disc = (((cxx - cyy) / 2.0).powi(2) + cxy * cxy).sqrt();
    let a = (half_trace + disc).max(0.0).sqrt();
    let b = (half_trace - disc).max(0.0).sqrt();
    let theta_deg = 0.5 * (2.0 * cxy).atan2(cxx - cyy).to_degrees();

    let x = ref_x + mx;
    let y = ref_y + my;
    let (px, py) = (peak_idx % w, peak_idx / w);
    let background = ctx.background.level_at(px, py) as f64;
    let threshold = ctx.threshold_sigma * ctx.background.noise_at(px, py) as f64;

    let hfr = if ctx.calculate_hfr {
        half_flux_radius(ctx.residual, w, h, x, y, ctx.r_min.max(3.0 * a))
    } else {
        0.0
    };

    Some(Detection {
        x,
        y,
        flux: sum,
        peak,
        peak_residual,
        background,
        threshold,
        a,
        b,
        theta_deg,
        hfr,
        num_pixels: pixels.len(),
        border,
    })
}

/// Radius enclosing half of the positive flux inside a circular aperture,
/// linearly interpolated between pixel distances.
pub(crate) fn half_flux_radius(
    residual: &[f32],
    width: usize,
    height: usize,
    cx: f64,
    cy: f64,
    radius: f64,
) -> f64 {
    if !(radius > 0.0) {
        return 0.0;
    }
    let x0 = (cx - radius).floor().max(0.0) as usize;
    let y0 = (cy - radius).floor().max(0.0) as usize;
    let x1 = ((cx + radius).ceil() as usize).min(width.saturating_sub(1));
    let y1 = ((cy + radius).ceil() as usize).min(height.saturating_sub(1));

    let mut samples: Vec<(f64, f64)> = Vec::new();
    for y in y0..=y1 {
        for x in x0..=x1 {
            let d = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
            if d <= radius {
                let v = residual[y * width + x].max(0.0) as f64;
                if v > 0.0 {
                    samples.push((d, v));
                }
            }
        }
    }
    let total: f64 = samples.iter().map(|s| s.1).sum();
    if !(total > 0.0) {
        return 0.0;
    }
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));

    let half = total / 2.0;
    let (mut prev_r, mut prev_cum) = (0.0, 0.0);
    for (d, v) in samples {
        let cum = prev_cum + v;
        if cum >= half {
            return prev_r + (half - prev_cum) / v * (d - prev_r);
        }
        prev_r = d;
        prev_cum = cum;
    }
    prev_r
}
