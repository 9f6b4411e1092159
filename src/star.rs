//! Extracted point sources.

/// A point source measured on the image.
///
/// Positions are full-image pixel coordinates with the origin at the centre of
/// the top-left pixel, `+x` right and `+y` down.
#[derive(Debug, Clone, PartialEq)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    /// Background-subtracted flux summed over the blob.
    pub flux: f64,
    /// Largest raw sample in the blob.
    pub peak: f64,
    /// Local background level under the star.
    pub background: f64,
    /// Semi-major axis (pixels, 1σ of the flux distribution).
    pub a: f64,
    /// Semi-minor axis (pixels).
    pub b: f64,
    /// Position angle of the major axis, degrees counter-clockwise from `+x`.
    pub theta_deg: f64,
    /// Half-flux radius in pixels; zero when not computed.
    pub hfr: f64,
    /// Instrumental magnitude, `magzero - 2.5 log10(flux)`.
    pub mag: f64,
    pub num_pixels: usize,
    /// The blob touches the edge of the working plane.
    pub border: bool,
}

impl Star {
    /// `1 - b/a`, zero for a round source.
    pub fn ellipticity(&self) -> f64 {
        if self.a > 0.0 {
            1.0 - self.b / self.a
        } else {
            0.0
        }
    }

    /// Axis ratio `a/b`, at least 1.
    pub fn elongation(&self) -> f64 {
        if self.b > 0.0 {
            (self.a / self.b).max(1.0)
        } else if self.a > 0.0 {
            f64::INFINITY
        } else {
            1.0
        }
    }

    /// Signal-to-noise ratio for a detector `gain` in e⁻/ADU.
    ///
    /// `flux·g / sqrt(flux·g + n·background·g)`; sky noise is summed over the
    /// blob's pixel count.
    pub fn snr(&self, gain: f64) -> f64 {
        let signal = self.flux * gain;
        let sky = self.num_pixels as f64 * self.background.max(0.0) * gain;
        let variance = signal.max(0.0) + sky;
        if variance > 0.0 {
            signal / variance.sqrt()
        } else {
            0.0
        }
    }

    pub(crate) fn distance_sq(&self, x: f64, y: f64) -> f64 {
        (self.x - x).powi(2) + (self.y - y).powi(2)
    }
}

/// An ordered list of stars; the order is the ranking chosen by the filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarList {
    stars: Vec<Star>,
}

impl StarList {
    pub fn new(stars: Vec<Star>) -> Self {
        Self { stars }
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Star> {
        self.stars.iter()
    }

    pub fn as_slice(&self) -> &[Star] {
        &self.stars
    }

    pub fn get(&self, idx: usize) -> Option<&Star> {
        self.stars.get(idx)
    }

    pub fn into_vec(self) -> Vec<Star> {
        self.stars
    }

    /// Pixel positions in list order.
    pub fn positions(&self) -> Vec<(f64, f64)> {
        self.stars.iter().map(|s| (s.x, s.y)).collect()
    }
}

impl From<Vec<Star>> for StarList {
    fn from(stars: Vec<Star>) -> Self {
        Self::new(stars)
    }
}

impl FromIterator<Star> for StarList {
    fn from_iter<I: IntoIterator<Item = Star>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a StarList {
    type Item = &'a Star;
    type IntoIter = std::slice::Iter<'a, Star>;

    fn into_iter(self) -> Self::IntoIter {
        self.stars.iter()
    }
}

impl IntoIterator for StarList {
    type Item = Star;
    type IntoIter = std::vec::IntoIter<Star>;

    fn into_iter(self) -> Self::IntoIter {
        self.stars.into_iter()
    }
}

#[cfg(test)]
pub(crate) fn test_star(x: f64, y: f64, flux: f64) -> Star {
    Star {
        x,
        y,
        flux,
        peak: flux / 10.0,
        background: 100.0,
        a: 1.5,
        b: 1.5,
        theta_deg: 0.0,
        hfr: 1.2,
        mag: 20.0 - 2.5 * flux.log10(),
        num_pixels: 20,
        border: false,
    }
}
