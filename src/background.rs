//! Sky background and noise estimation.
//!
//! The global estimate is a sigma-clipped median / standard deviation over the
//! whole plane. When the plane is large enough, a coarse mesh of per-cell
//! clipped estimates is built, median-filtered over 3×3 cells (to suppress
//! cells dominated by a bright star) and bilinearly interpolated between cell
//! centres. Estimation never fails: degenerate input degrades to the global
//! constant estimate.

use tracing::debug;

/// Parameters for [`Background::estimate`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundConfig {
    /// Mesh cell size in pixels. `None` forces a global constant estimate.
    /// Default: Some(64)
    pub mesh_size: Option<u32>,
    /// Clip level in units of the current sigma. Default: 3.0
    pub clip_sigma: f32,
    /// Maximum clipping iterations. Default: 5
    pub clip_iterations: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            mesh_size: Some(64),
            clip_sigma: 3.0,
            clip_iterations: 5,
        }
    }
}

/// Sky background model for one working plane.
#[derive(Debug, Clone)]
pub struct Background {
    /// Global clipped median.
    pub level: f32,
    /// Global clipped standard deviation.
    pub noise: f32,
    width: u32,
    height: u32,
    mesh: Option<Mesh>,
}

#[derive(Debug, Clone)]
struct Mesh {
    cell: u32,
    nx: usize,
    ny: usize,
    levels: Vec<f32>,
    noises: Vec<f32>,
}

impl Background {
    /// Estimate the background of a row-major `width × height` plane.
    pub fn estimate(pixels: &[f32], width: u32, height: u32, config: &BackgroundConfig) -> Self {
        let (level, noise) = clipped_stats(pixels.iter().copied(), config);

        let mesh = config.mesh_size.and_then(|cell| {
            if cell == 0 || width < 2 * cell || height < 2 * cell {
                debug!(
                    "Background: {}x{} plane too small for {:?} px mesh, using global estimate",
                    width, height, config.mesh_size
                );
                return None;
            }
            build_mesh(pixels, width, height, cell, config, level, noise)
        });

        debug!(
            "Background: level {:.3}, noise {:.3}, mesh {}",
            level,
            noise,
            mesh.is_some()
        );

        Self {
            level,
            noise,
            width,
            height,
            mesh,
        }
    }

    /// A constant model (used when the caller already knows the sky level).
    pub fn constant(level: f32, noise: f32, width: u32, height: u32) -> Self {
        Self {
            level,
            noise,
            width,
            height,
            mesh: None,
        }
    }

    /// `true` when the model is spatially varying.
    pub fn is_local(&self) -> bool {
        self.mesh.is_some()
    }

    /// Background level at a plane pixel.
    pub fn level_at(&self, x: usize, y: usize) -> f32 {
        match &self.mesh {
            Some(m) => m.interpolate(&m.levels, x, y),
            None => self.level,
        }
    }

    /// Background noise at a plane pixel.
    pub fn noise_at(&self, x: usize, y: usize) -> f32 {
        match &self.mesh {
            Some(m) => m.interpolate(&m.noises, x, y),
            None => self.noise,
        }
    }

    /// Per-pixel level and noise maps.
    pub fn maps(&self) -> (Vec<f32>, Vec<f32>) {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut levels = Vec::with_capacity(w * h);
        let mut noises = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                levels.push(self.level_at(x, y));
                noises.push(self.noise_at(x, y));
            }
        }
        (levels, noises)
    }
}

impl Mesh {
    fn interpolate(&self, grid: &[f32], x: usize, y: usize) -> f32 {
        let cs = self.cell as f32;
        let bx_f = (x as f32 + 0.5 - cs / 2.0) / cs;
        let by_f = (y as f32 + 0.5 - cs / 2.0) / cs;

        let bx0 = (bx_f.floor() as isize).clamp(0, self.nx as isize - 1) as usize;
        let by0 = (by_f.floor() as isize).clamp(0, self.ny as isize - 1) as usize;
        let bx1 = (bx0 + 1).min(self.nx - 1);
        let by1 = (by0 + 1).min(self.ny - 1);

        let fx = (bx_f - bx0 as f32).clamp(0.0, 1.0);
        let fy = (by_f - by0 as f32).clamp(0.0, 1.0);

        let m00 = grid[by0 * self.nx + bx0];
        let m10 = grid[by0 * self.nx + bx1];
        let m01 = grid[by1 * self.nx + bx0];
        let m11 = grid[by1 * self.nx + bx1];

        m00 * (1.0 - fx) * (1.0 - fy) + m10 * fx * (1.0 - fy) + m01 * (1.0 - fx) * fy + m11 * fx * fy
    }
}

fn build_mesh(
    pixels: &[f32],
    width: u32,
    height: u32,
    cell: u32,
    config: &BackgroundConfig,
    global_level: f32,
    global_noise: f32,
) -> Option<Mesh> {
    let w = width as usize;
    let h = height as usize;
    let cs = cell as usize;
    let nx = w.div_ceil(cs);
    let ny = h.div_ceil(cs);

    let mut levels = vec![global_level; nx * ny];
    let mut noises = vec![global_noise; nx * ny];
    for by in 0..ny {
        for bx in 0..nx {
            let x0 = bx * cs;
            let y0 = by * cs;
            let x1 = (x0 + cs).min(w);
            let y1 = (y0 + cs).min(h);
            let cell_pixels = (y0..y1).flat_map(|y| pixels[y * w + x0..y * w + x1].iter().copied());
            let (lv, nz) = clipped_stats(cell_pixels, config);
            // Cells with no finite data keep the global estimate.
            if lv.is_finite() && nz.is_finite() && (lv != 0.0 || nz != 0.0) {
                levels[by * nx + bx] = lv;
                noises[by * nx + bx] = nz;
            }
        }
    }

    let levels = median_filter_3x3(&levels, nx, ny);
    let noises = median_filter_3x3(&noises, nx, ny);

    // A mesh that came out flat carries no information over the global value.
    if noises.iter().all(|&n| n <= 0.0) && global_noise <= 0.0 {
        return None;
    }

    Some(Mesh {
        cell,
        nx,
        ny,
        levels,
        noises,
    })
}

fn median_filter_3x3(grid: &[f32], nx: usize, ny: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; grid.len()];
    let mut window = [0.0f32; 9];
    // Edge cells replicate their border neighbours so the window is always 3×3.
    for y in 0..ny {
        for x in 0..nx {
            let mut k = 0;
            for dy in -1isize..=1 {
                let yy = (y as isize + dy).clamp(0, ny as isize - 1) as usize;
                for dx in -1isize..=1 {
                    let xx = (x as isize + dx).clamp(0, nx as isize - 1) as usize;
                    window[k] = grid[yy * nx + xx];
                    k += 1;
                }
            }
            window.sort_unstable_by(f32::total_cmp);
            out[y * nx + x] = window[4];
        }
    }
    out
}

/// Sigma-clipped median and standard deviation of the finite values.
///
/// Returns `(0, 0)` for an empty input.
pub fn clipped_stats(values: impl Iterator<Item = f32>, config: &BackgroundConfig) -> (f32, f32) {
    let mut vals: Vec<f32> = values.filter(|v| v.is_finite()).collect();
    if vals.is_empty() {
        return (0.0, 0.0);
    }

    let mut median = median_of(&mut vals);
    let mut sigma = stddev(&vals);
    for _ in 0..config.clip_iterations {
        if sigma <= 0.0 {
            break;
        }
        let lo = median - config.clip_sigma * sigma;
        let hi = median + config.clip_sigma * sigma;
        let before = vals.len();
        vals.retain(|&v| v >= lo && v <= hi);
        if vals.is_empty() {
            break;
        }
        median = median_of(&mut vals);
        sigma = stddev(&vals);
        if vals.len() == before {
            break;
        }
    }
    (median, sigma)
}

fn median_of(vals: &mut [f32]) -> f32 {
    let n = vals.len();
    vals.sort_unstable_by(f32::total_cmp);
    if n % 2 == 0 {
        (vals[n / 2 - 1] + vals[n / 2]) / 2.0
    } else {
        vals[n / 2]
    }
}

fn stddev(vals: &[f32]) -> f32 {
    let n = vals.len() as f64;
    let mean = vals.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = vals.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    var.sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn uniform_plane_has_zero_noise() {
        let pixels = vec![100.0_f32; 100 * 100];
        let bg = Background::estimate(&pixels, 100, 100, &BackgroundConfig::default());
        assert!((bg.level - 100.0).abs() < 1e-6);
        assert_eq!(bg.noise, 0.0);
        assert!(!bg.is_local());
    }

    #[test]
    fn clipping_rejects_bright_stars() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(500.0_f32, 10.0).unwrap();
        let mut pixels: Vec<f32> = (0..200 * 200).map(|_| noise.sample(&mut rng)).collect();
        // Sprinkle saturated hot spots over 2% of the pixels.
        for i in (0..pixels.len()).step_by(50) {
            pixels[i] = 60000.0;
        }
        let bg = Background::estimate(&pixels, 200, 200, &BackgroundConfig::default());
        assert!((bg.level - 500.0).abs() < 1.0, "level {}", bg.level);
        assert!((bg.noise - 10.0).abs() < 1.0, "noise {}", bg.noise);
    }

    #[test]
    fn mesh_follows_gradient() {
        let w = 256u32;
        let h = 256u32;
        let mut pixels = vec![0.0f32; (w * h) as usize];
        for y in 0..h as usize {
            for x in 0..w as usize {
                pixels[y * w as usize + x] = 100.0 + x as f32;
            }
        }
        let bg = Background::estimate(&pixels, w, h, &BackgroundConfig::default());
        assert!(bg.is_local());
        let left = bg.level_at(32, 128);
        let right = bg.level_at(224, 128);
        assert!((left - 132.0).abs() < 3.0, "left {}", left);
        assert!((right - 324.0).abs() < 3.0, "right {}", right);
    }

    #[test]
    fn small_plane_falls_back_to_global() {
        let pixels: Vec<f32> = (0..50 * 50).map(|i| (i % 7) as f32).collect();
        let bg = Background::estimate(&pixels, 50, 50, &BackgroundConfig::default());
        assert!(!bg.is_local());
        assert_eq!(bg.level_at(10, 10), bg.level);
        assert_eq!(bg.noise_at(49, 49), bg.noise);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let mut pixels = vec![10.0f32; 64];
        pixels[3] = f32::NAN;
        pixels[9] = f32::INFINITY;
        let (level, noise) = clipped_stats(pixels.into_iter(), &BackgroundConfig::default());
        assert_eq!(level, 10.0);
        assert_eq!(noise, 0.0);
        let (level, noise) = clipped_stats(std::iter::empty(), &BackgroundConfig::default());
        assert_eq!((level, noise), (0.0, 0.0));
    }
}
