//! Four-star geometric codes and the quadratic-probing pattern table.
//!
//! A code is built from the 6 pairwise edges of a 4-star pattern. The edges
//! are sorted, the 5 smaller ones are divided by the largest, and the resulting
//! ratios are quantized into `bins` per dimension to form the key. Ratios are
//! invariant to scale, rotation and mirroring, so the same code describes an
//! image quad measured in pixels and an index quad measured in radians.

use nalgebra::Vector3;

use crate::starcatalog::angular_distance;

/// Number of stars in each pattern.
pub const PATTERN_SIZE: usize = 4;
/// Number of pairwise edges: C(4,2) = 6.
pub const NUM_EDGES: usize = 6;
/// Number of edge ratios (every edge but the largest).
pub const NUM_RATIOS: usize = 5;

/// Knuth's golden-ratio multiplier.
const MAGIC_RAND: u64 = 2654435761;

/// Marks an unused table slot. A real pattern has 4 distinct star indices and
/// can never be all zeros.
pub const EMPTY_SLOT: [u32; PATTERN_SIZE] = [0; PATTERN_SIZE];

/// Quantization bins for a ratio tolerance: `round(0.25 / max_error)`.
pub fn bins_for_error(pattern_max_error: f64) -> u32 {
    (0.25 / pattern_max_error).round().max(1.0) as u32
}

// ── Codes ───────────────────────────────────────────────────────────────────

/// Edge ratios and scale of one 4-star pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricCode {
    /// The 5 smaller edges over the largest, ascending.
    pub ratios: [f64; NUM_RATIOS],
    /// Length of the largest edge, in pixels or radians.
    pub largest_edge: f64,
}

impl GeometricCode {
    /// Code from 6 edge lengths in any order. `None` for a degenerate pattern.
    pub fn from_edges(mut edges: [f64; NUM_EDGES]) -> Option<Self> {
        if edges.iter().any(|e| !e.is_finite()) {
            return None;
        }
        edges.sort_unstable_by(|a, b| a.total_cmp(b));
        let largest_edge = edges[NUM_EDGES - 1];
        if !(largest_edge > 0.0) {
            return None;
        }
        let ratios = std::array::from_fn(|i| edges[i] / largest_edge);
        Some(Self {
            ratios,
            largest_edge,
        })
    }

    /// Code of 4 image positions, using pixel distances.
    pub fn from_pixels(points: &[(f64, f64); PATTERN_SIZE]) -> Option<Self> {
        Self::from_edges(pairwise(points, |a, b| {
            ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
        }))
    }

    /// Code of 4 sky directions, using great-circle angles.
    pub fn from_vectors(vectors: &[Vector3<f64>; PATTERN_SIZE]) -> Option<Self> {
        Self::from_edges(pairwise(vectors, angular_distance))
    }

    /// Quantized key.
    pub fn key(&self, bins: u32) -> [u32; NUM_RATIOS] {
        std::array::from_fn(|i| quantize(self.ratios[i], bins))
    }

    /// Whether every ratio of `other` lies strictly within `max_error` of ours.
    pub fn agrees_with(&self, other: &GeometricCode, max_error: f64) -> bool {
        self.ratios
            .iter()
            .zip(other.ratios.iter())
            .all(|(a, b)| (a - b).abs() < max_error)
    }

    /// All keys whose cells intersect `ratios ± max_error`, nearest key first.
    pub fn key_range(&self, bins: u32, max_error: f64) -> Vec<[u32; NUM_RATIOS]> {
        let centre = self.key(bins);
        let lo: [u32; NUM_RATIOS] =
            std::array::from_fn(|i| quantize((self.ratios[i] - max_error).max(0.0), bins));
        let hi: [u32; NUM_RATIOS] = std::array::from_fn(|i| quantize(self.ratios[i] + max_error, bins));

        let mut keys: Vec<(u32, [u32; NUM_RATIOS])> = Vec::new();
        let mut current = [0u32; NUM_RATIOS];
        collect_keys(&lo, &hi, &centre, 0, &mut current, &mut keys);
        // Stable sort keeps lexicographic order among equal distances.
        keys.sort_by_key(|&(dist, _)| dist);
        keys.into_iter().map(|(_, k)| k).collect()
    }
}

fn quantize(ratio: f64, bins: u32) -> u32 {
    ((ratio * bins as f64).max(0.0) as u32).min(bins)
}

fn pairwise<T>(points: &[T; PATTERN_SIZE], dist: impl Fn(&T, &T) -> f64) -> [f64; NUM_EDGES] {
    let mut edges = [0.0; NUM_EDGES];
    let mut k = 0;
    for i in 0..PATTERN_SIZE {
        for j in (i + 1)..PATTERN_SIZE {
            edges[k] = dist(&points[i], &points[j]);
            k += 1;
        }
    }
    edges
}

fn collect_keys(
    lo: &[u32; NUM_RATIOS],
    hi: &[u32; NUM_RATIOS],
    centre: &[u32; NUM_RATIOS],
    dim: usize,
    current: &mut [u32; NUM_RATIOS],
    out: &mut Vec<(u32, [u32; NUM_RATIOS])>,
) {
    if dim == NUM_RATIOS {
        let dist_sq = (0..NUM_RATIOS)
            .map(|i| {
                let d = current[i] as i64 - centre[i] as i64;
                (d * d) as u32
            })
            .sum();
        out.push((dist_sq, *current));
        return;
    }
    for v in lo[dim]..=hi[dim] {
        current[dim] = v;
        collect_keys(lo, hi, centre, dim + 1, current, out);
    }
}

// ── Hashing ─────────────────────────────────────────────────────────────────

/// Polynomial key hash, `sum(key[i] · bins^i)` in wrapping arithmetic.
pub fn key_hash(key: &[u32; NUM_RATIOS], bins: u32) -> u64 {
    let mut hash = 0u64;
    let mut factor = 1u64;
    for &k in key {
        hash = hash.wrapping_add((k as u64).wrapping_mul(factor));
        factor = factor.wrapping_mul(bins as u64);
    }
    hash
}

/// The 16-bit prefilter stored next to each table slot.
pub fn short_hash(hash: u64) -> u16 {
    (hash & 0xFFFF) as u16
}

/// Home slot of a key hash.
pub fn hash_to_index(hash: u64, table_size: usize) -> usize {
    (hash.wrapping_mul(MAGIC_RAND) % table_size.max(1) as u64) as usize
}

fn probe(home: usize, c: u64, table_size: usize) -> usize {
    ((home as u64).wrapping_add(c.wrapping_mul(c)) % table_size as u64) as usize
}

/// Store `pattern` in the first free slot of the probe sequence from `home`.
/// `None` when no free slot was reachable.
pub fn insert_pattern(
    pattern: [u32; PATTERN_SIZE],
    home: usize,
    table: &mut [[u32; PATTERN_SIZE]],
) -> Option<usize> {
    let size = table.len();
    for c in 0..size as u64 {
        let i = probe(home, c, size);
        if table[i] == EMPTY_SLOT {
            table[i] = pattern;
            return Some(i);
        }
    }
    None
}

/// Occupied slots on the probe chain from `home`, up to the first empty slot.
pub fn probe_chain(home: usize, table: &[[u32; PATTERN_SIZE]]) -> Vec<usize> {
    let size = table.len();
    let mut found = Vec::new();
    for c in 0..size as u64 {
        let i = probe(home, c, size);
        if table[i] == EMPTY_SLOT {
            break;
        }
        found.push(i);
    }
    found
}

// ── Canonical order ─────────────────────────────────────────────────────────

/// Reorder `pattern` by each member's distance from the pattern centroid, so
/// corresponding stars of an image quad and an index quad line up.
pub fn canonical_order<T: Copy, const D: usize>(
    pattern: &mut [T; PATTERN_SIZE],
    coords: impl Fn(T) -> [f64; D],
) {
    let pts: [[f64; D]; PATTERN_SIZE] = std::array::from_fn(|i| coords(pattern[i]));
    let mut centroid = [0.0; D];
    for p in &pts {
        for d in 0..D {
            centroid[d] += p[d] / PATTERN_SIZE as f64;
        }
    }
    let dist: [f64; PATTERN_SIZE] = std::array::from_fn(|i| {
        (0..D).map(|d| (pts[i][d] - centroid[d]).powi(2)).sum::<f64>()
    });
    let mut order = [0usize, 1, 2, 3];
    order.sort_by(|&a, &b| dist[a].total_cmp(&dist[b]));
    let original = *pattern;
    for (slot, &o) in order.iter().enumerate() {
        pattern[slot] = original[o];
    }
}

// ── Table sizing ────────────────────────────────────────────────────────────

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// Smallest prime not below `n`.
pub fn next_prime(n: u64) -> u64 {
    if n <= 2 {
        return 2;
    }
    let mut candidate = n | 1;
    while !is_prime(candidate) {
        candidate += 2;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::starcatalog::radec_to_uvec;

    fn quad() -> [(f64, f64); 4] {
        [(10.0, 12.0), (140.0, 30.0), (60.0, 170.0), (95.0, 80.0)]
    }

    #[test]
    fn code_is_similarity_and_mirror_invariant() {
        let base = GeometricCode::from_pixels(&quad()).unwrap();
        let (s, c) = (0.7f64.sin(), 0.7f64.cos());
        let moved = quad().map(|(x, y)| (3.1 * (c * x - s * y) + 500.0, 3.1 * (s * x + c * y) - 20.0));
        let mirrored = quad().map(|(x, y)| (-x, y));
        let a = GeometricCode::from_pixels(&moved).unwrap();
        let b = GeometricCode::from_pixels(&mirrored).unwrap();
        for i in 0..NUM_RATIOS {
            assert!((a.ratios[i] - base.ratios[i]).abs() < 1e-12);
            assert!((b.ratios[i] - base.ratios[i]).abs() < 1e-12);
        }
        assert!((a.largest_edge / base.largest_edge - 3.1).abs() < 1e-12);
        assert!(base.ratios.windows(2).all(|w| w[0] <= w[1]));
        assert!(base.ratios.iter().all(|&r| (0.0..=1.0).contains(&r)));
    }

    #[test]
    fn degenerate_patterns_have_no_code() {
        assert!(GeometricCode::from_pixels(&[(1.0, 1.0); 4]).is_none());
        assert!(GeometricCode::from_pixels(&[(0.0, 0.0), (1.0, 0.0), (f64::NAN, 0.0), (2.0, 2.0)]).is_none());
    }

    #[test]
    fn pixel_and_angular_codes_agree_on_small_fields() {
        let scale = (1.0f64 / 3600.0).to_radians();
        let centre = (1.2f64, 0.4f64);
        let vectors = quad().map(|(x, y)| {
            let ra = centre.0 + x * scale / centre.1.cos();
            let dec = centre.1 + y * scale;
            radec_to_uvec(ra, dec)
        });
        let pix = GeometricCode::from_pixels(&quad()).unwrap();
        let sky = GeometricCode::from_vectors(&vectors).unwrap();
        assert!(pix.agrees_with(&sky, 1e-3));
        assert!((sky.largest_edge / pix.largest_edge / scale - 1.0).abs() < 1e-2);
    }

    #[test]
    fn key_range_starts_at_own_key() {
        let code = GeometricCode::from_pixels(&quad()).unwrap();
        let bins = bins_for_error(0.001);
        assert_eq!(bins, 250);
        let keys = code.key_range(bins, 0.001);
        assert_eq!(keys[0], code.key(bins));
        assert!(keys.len() >= 1 && keys.len() <= 32);
        for k in &keys {
            for i in 0..NUM_RATIOS {
                assert!(k[i].abs_diff(code.key(bins)[i]) <= 1);
            }
        }
    }

    #[test]
    fn table_insert_and_probe() {
        let mut table = vec![EMPTY_SLOT; next_prime(7) as usize];
        assert_eq!(table.len(), 7);
        let home = hash_to_index(12345, table.len());
        let a = insert_pattern([1, 2, 3, 4], home, &mut table).unwrap();
        let b = insert_pattern([5, 6, 7, 8], home, &mut table).unwrap();
        assert_ne!(a, b);
        assert_eq!(probe_chain(home, &table), vec![a, b]);

        let mut full = vec![[1, 2, 3, 4]; 3];
        assert!(insert_pattern([4, 5, 6, 7], 0, &mut full).is_none());
        assert_eq!(probe_chain(0, &full).len(), 3);
    }

    #[test]
    fn canonical_order_is_input_order_independent() {
        let pts = quad();
        let mut a = [0usize, 1, 2, 3];
        let mut b = [3usize, 1, 0, 2];
        canonical_order(&mut a, |i| [pts[i].0, pts[i].1]);
        canonical_order(&mut b, |i| [pts[i].0, pts[i].1]);
        assert_eq!(a, b);
    }

    #[test]
    fn primes() {
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(8), 11);
        assert_eq!(next_prime(13), 13);
        assert_eq!(next_prime(200), 211);
    }

    #[test]
    fn polynomial_hash() {
        assert_eq!(key_hash(&[1, 2, 0, 0, 0], 10), 21);
        assert_eq!(short_hash(0x1_2345), 0x2345);
    }
}
