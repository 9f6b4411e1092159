//! Multi-threshold deblending of merged blobs.

use super::label::{group_pixels, label_components};

#[derive(Debug, Clone, Copy)]
pub(crate) struct DeblendConfig {
    pub nthresh: usize,
    pub contrast: f64,
}

/// Split one blob into its point sources.
///
/// `pixels` are plane indices of the blob and `values` is the detection image.
/// Returns one pixel list per child; a blob that does not split comes back
/// whole.
pub(crate) fn deblend(
    pixels: &[usize],
    values: &[f32],
    width: usize,
    config: &DeblendConfig,
) -> Vec<Vec<usize>> {
    if config.nthresh < 2 || pixels.len() < 3 {
        return vec![pixels.to_vec()];
    }
    let local = LocalBlob::new(pixels, values, width);
    let (base, peak) = local.range();
    if !(peak > base) {
        return vec![pixels.to_vec()];
    }
    let total: f64 = local.values.iter().map(|&v| v.max(0.0) as f64).sum();
    if total <= 0.0 {
        return vec![pixels.to_vec()];
    }

    // Scan levels upward, keeping the lowest level with the most significant
    // components.
    let mut best: Vec<Vec<usize>> = Vec::new();
    for i in 1..config.nthresh {
        let level = threshold_level(base, peak, i, config.nthresh);
        let components = local.components_above(level);
        let significant: Vec<Vec<usize>> = components
            .into_iter()
            .filter(|c| {
                let flux: f64 = c.iter().map(|&p| local.values[p].max(0.0) as f64).sum();
                flux >= config.contrast * total
            })
            .collect();
        if significant.len() > best.len() {
            best = significant;
        }
    }
    if best.len() <= 1 {
        return vec![pixels.to_vec()];
    }

    local
        .flood(&best)
        .into_iter()
        .map(|child| child.into_iter().map(|p| local.global[p]).collect())
        .collect()
}

/// Exponentially spaced levels between base and peak; linear when the base is
/// not positive.
fn threshold_level(base: f32, peak: f32, i: usize, n: usize) -> f32 {
    let t = i as f32 / n as f32;
    if base > 0.0 {
        base * (peak / base).powf(t)
    } else {
        base + (peak - base) * t
    }
}

/// A blob cut out onto its bounding box.
struct LocalBlob {
    w: usize,
    h: usize,
    /// Local index -> global plane index, for blob pixels only.
    global: Vec<usize>,
    /// Local grid index of each blob pixel (parallel to `global`).
    cell: Vec<usize>,
    /// Detection value of each blob pixel (parallel to `global`).
    values: Vec<f32>,
    /// Grid cell -> blob pixel, if any.
    grid: Vec<Option<usize>>,
}

impl LocalBlob {
    fn new(pixels: &[usize], values: &[f32], width: usize) -> Self {
        let (mut x0, mut y0, mut x1, mut y1) = (usize::MAX, usize::MAX, 0, 0);
        for &p in pixels {
            let (x, y) = (p % width, p / width);
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let w = x1 - x0 + 1;
        let h = y1 - y0 + 1;
        let mut grid = vec![None; w * h];
        let mut cell = Vec::with_capacity(pixels.len());
        for (k, &p) in pixels.iter().enumerate() {
            let c = (p / width - y0) * w + (p % width - x0);
            grid[c] = Some(k);
            cell.push(c);
        }
        Self {
            w,
            h,
            global: pixels.to_vec(),
            cell,
            values: pixels.iter().map(|&p| values[p]).collect(),
            grid,
        }
    }

    fn range(&self) -> (f32, f32) {
        self.values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Connected groups of blob pixels strictly above `level`.
    fn components_above(&self, level: f32) -> Vec<Vec<usize>> {
        let mask: Vec<bool> = self
            .grid
            .iter()
            .map(|g| g.is_some_and(|k| self.values[k] > level))
            .collect();
        let (labels, count) = label_components(&mask, self.w, self.h);
        group_pixels(&labels, count)
            .into_iter()
            .map(|cells| cells.into_iter().filter_map(|c| self.grid[c]).collect())
            .collect()
    }

    /// Grow the seed components over the rest of the blob, brightest pixels
    /// first, each pixel joining the brightest already-assigned neighbour.
    fn flood(&self, seeds: &[Vec<usize>]) -> Vec<Vec<usize>> {
        let n = self.global.len();
        let mut owner: Vec<Option<usize>> = vec![None; n];
        for (s, seed) in seeds.iter().enumerate() {
            for &k in seed {
                owner[k] = Some(s);
            }
        }

        let mut order: Vec<usize> = (0..n).filter(|&k| owner[k].is_none()).collect();
        order.sort_by(|&a, &b| self.values[b].total_cmp(&self.values[a]).then(a.cmp(&b)));

        // Pixels reachable only through lower neighbours resolve on later passes.
        loop {
            let mut progressed = false;
            for &k in &order {
                if owner[k].is_some() {
                    continue;
                }
                if let Some(s) = self.brightest_owned_neighbour(k, &owner) {
                    owner[k] = Some(s);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        // Anything still unowned is disconnected from every seed inside the
        // blob; give it to the nearest seed peak.
        let peaks: Vec<(f64, f64)> = seeds
            .iter()
            .map(|seed| {
                let top = seed
                    .iter()
                    .copied()
                    .max_by(|&a, &b| self.values[a].total_cmp(&self.values[b]))
                    .unwrap_or(0);
                self.xy(top)
            })
            .collect();
        for k in 0..n {
            if owner[k].is_none() {
                let (x, y) = self.xy(k);
                owner[k] = peaks
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        let da = (a.0 - x).powi(2) + (a.1 - y).powi(2);
                        let db = (b.0 - x).powi(2) + (b.1 - y).powi(2);
                        da.total_cmp(&db)
                    })
                    .map(|(s, _)| s);
            }
        }

        let mut children = vec![Vec::new(); seeds.len()];
        for (k, o) in owner.iter().enumerate() {
            if let Some(s) = o {
                children[*s].push(k);
            }
        }
        for child in children.iter_mut() {
            child.sort_by_key(|&k| self.global[k]);
        }
        children
    }

    fn brightest_owned_neighbour(&self, k: usize, owner: &[Option<usize>]) -> Option<usize> {
        let c = self.cell[k];
        let (cx, cy) = ((c % self.w) as isize, (c / self.w) as isize);
        let mut best: Option<(f32, usize)> = None;
        for dy in -1..=1isize {
            for dx in -1..=1isize {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (nx, ny) = (cx + dx, cy + dy);
                if nx < 0 || ny < 0 || nx >= self.w as isize || ny >= self.h as isize {
                    continue;
                }
                let Some(nk) = self.grid[ny as usize * self.w + nx as usize] else {
                    continue;
                };
                if let Some(s) = owner[nk] {
                    let v = self.values[nk];
                    if best.map_or(true, |(bv, _)| v > bv) {
                        best = Some((v, s));
                    }
                }
            }
        }
        best.map(|(_, s)| s)
    }

    fn xy(&self, k: usize) -> (f64, f64) {
        let c = self.cell[k];
        ((c % self.w) as f64, (c / self.w) as f64)
    }
}
