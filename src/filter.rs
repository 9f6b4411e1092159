//! Rejection and re-ranking of extracted stars.

use tracing::debug;

use crate::star::{Star, StarList};

/// How many stars to trim from one end of the brightness ranking.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Trim {
    #[default]
    None,
    Count(usize),
    /// Percentage of the stars surviving the earlier filters.
    Percent(f64),
}

impl Trim {
    fn count(&self, n: usize) -> usize {
        match *self {
            Trim::None => 0,
            Trim::Count(c) => c.min(n),
            Trim::Percent(p) => ((p.clamp(0.0, 100.0) / 100.0) * n as f64).floor() as usize,
        }
    }
}

/// Ranking applied after rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Flux, brightest first.
    #[default]
    Flux,
    /// Half-flux radius, smallest first.
    Hfr,
}

/// Star rejection and ranking policy.
///
/// Every criterion is optional; the default keeps everything and ranks by
/// flux.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StarFilter {
    /// Drop stars whose peak reaches this percentage of the saturation level.
    pub saturation_limit_percent: Option<f64>,
    /// Maximum axis ratio `a/b`.
    pub max_ellipse: Option<f64>,
    /// Maximum ellipticity `1 - b/a`.
    pub max_ellipticity: Option<f64>,
    /// Semi-major axis bounds in pixels.
    pub min_size: Option<f64>,
    pub max_size: Option<f64>,
    pub remove_brightest: Trim,
    pub remove_dimmest: Trim,
    pub sort_by: SortKey,
    /// Keep at most this many stars after ranking.
    pub keep_num: Option<usize>,
}

impl StarFilter {
    /// Apply the policy. `saturation_level` is the full-scale sample value of
    /// the source buffer.
    pub fn apply(&self, stars: &StarList, saturation_level: f64) -> StarList {
        let total = stars.len();
        let mut kept: Vec<&Star> = stars
            .iter()
            .filter(|s| self.accepts(s, saturation_level))
            .collect();
        let rejected = total - kept.len();

        // Brightness trimming works on a flux ranking regardless of the final order.
        kept.sort_by(|a, b| b.flux.total_cmp(&a.flux));
        let top = self.remove_brightest.count(kept.len());
        let bottom = self.remove_dimmest.count(kept.len() - top);
        let mut kept: Vec<&Star> = kept[top..kept.len() - bottom].to_vec();

        match self.sort_by {
            SortKey::Flux => kept.sort_by(|a, b| {
                a.border
                    .cmp(&b.border)
                    .then_with(|| b.flux.total_cmp(&a.flux))
            }),
            SortKey::Hfr => kept.sort_by(|a, b| {
                a.border
                    .cmp(&b.border)
                    .then_with(|| a.hfr.total_cmp(&b.hfr))
            }),
        }
        if let Some(n) = self.keep_num {
            kept.truncate(n);
        }

        debug!(
            "Filter: {} in, {} rejected, {} trimmed bright, {} trimmed dim, {} out",
            total,
            rejected,
            top,
            bottom,
            kept.len()
        );
        kept.into_iter().cloned().collect()
    }

    fn accepts(&self, star: &Star, saturation_level: f64) -> bool {
        if let Some(pct) = self.saturation_limit_percent {
            if saturation_level > 0.0 && star.peak >= pct / 100.0 * saturation_level {
                return false;
            }
        }
        if let Some(max) = self.max_ellipse {
            if star.elongation() > max {
                return false;
            }
        }
        if let Some(max) = self.max_ellipticity {
            if star.ellipticity() > max {
                return false;
            }
        }
        if self.min_size.is_some_and(|m| star.a < m) {
            return false;
        }
        if self.max_size.is_some_and(|m| star.a > m) {
            return false;
        }
        true
    }
}
