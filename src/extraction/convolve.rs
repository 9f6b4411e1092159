//! Gaussian detection filter.

/// A square, normalized convolution kernel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Kernel {
    pub radius: usize,
    pub weights: Vec<f32>,
}

impl Kernel {
    /// Gaussian kernel for a star FWHM in (working-plane) pixels.
    ///
    /// Radius `ceil(0.6·fwhm)`, weights `exp(-4 ln2 r² / fwhm²)`, summing to 1.
    /// Returns `None` for a non-positive FWHM.
    pub fn from_fwhm(fwhm: f32) -> Option<Self> {
        if !(fwhm > 0.0) || !fwhm.is_finite() {
            return None;
        }
        let radius = (0.6 * fwhm).ceil().max(1.0) as usize;
        let size = 2 * radius + 1;
        let k = -4.0 * std::f32::consts::LN_2 / (fwhm * fwhm);
        let mut weights = Vec::with_capacity(size * size);
        for dy in 0..size {
            for dx in 0..size {
                let rx = dx as f32 - radius as f32;
                let ry = dy as f32 - radius as f32;
                weights.push((k * (rx * rx + ry * ry)).exp());
            }
        }
        let sum: f32 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= sum);
        Some(Self { radius, weights })
    }

    /// Convolve a plane. Pixels beyond the edge are excluded and the remaining
    /// weights renormalized.
    pub fn apply(&self, data: &[f32], width: usize, height: usize) -> Vec<f32> {
        let r = self.radius as isize;
        let size = 2 * self.radius + 1;
        let mut out = vec![0.0f32; data.len()];
        for y in 0..height as isize {
            for x in 0..width as isize {
                let mut acc = 0.0f32;
                let mut norm = 0.0f32;
                for ky in -r..=r {
                    let yy = y + ky;
                    if yy < 0 || yy >= height as isize {
                        continue;
                    }
                    for kx in -r..=r {
                        let xx = x + kx;
                        if xx < 0 || xx >= width as isize {
                            continue;
                        }
                        let w = self.weights[(ky + r) as usize * size + (kx + r) as usize];
                        acc += w * data[yy as usize * width + xx as usize];
                        norm += w;
                    }
                }
                out[y as usize * width + x as usize] = if norm > 0.0 { acc / norm } else { 0.0 };
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_shape() {
        let k = Kernel::from_fwhm(2.0).unwrap();
        assert_eq!(k.radius, 2);
        assert_eq!(k.weights.len(), 25);
        let sum: f32 = k.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        // Centre is the maximum and the weight at r = fwhm/2 is half of it.
        let centre = k.weights[12];
        assert!(k.weights.iter().all(|&w| w <= centre));
        let at_one = k.weights[13];
        assert!((at_one / centre - 0.5).abs() < 1e-5);
        assert!(Kernel::from_fwhm(0.0).is_none());
        assert!(Kernel::from_fwhm(f32::NAN).is_none());
    }

    #[test]
    fn flat_plane_is_unchanged() {
        let k = Kernel::from_fwhm(4.0).unwrap();
        let data = vec![3.0f32; 20 * 15];
        let out = k.apply(&data, 20, 15);
        assert!(out.iter().all(|&v| (v - 3.0).abs() < 1e-5));
    }

    #[test]
    fn impulse_spreads_symmetrically() {
        let k = Kernel::from_fwhm(2.0).unwrap();
        let mut data = vec![0.0f32; 11 * 11];
        data[5 * 11 + 5] = 1.0;
        let out = k.apply(&data, 11, 11);
        assert!((out[5 * 11 + 4] - out[5 * 11 + 6]).abs() < 1e-7);
        assert!((out[4 * 11 + 5] - out[6 * 11 + 5]).abs() < 1e-7);
        assert!(out[5 * 11 + 5] > out[5 * 11 + 6]);
    }
}
