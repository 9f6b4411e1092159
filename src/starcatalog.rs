//! Reference stars and a spatial catalog for cone searches.
//!
//! Stars are binned on the sphere into `3·nside` bands of equal `z = sin(dec)`
//! by `4·nside` right-ascension sectors. A cone query visits only the cells the
//! cone can touch, then applies an exact dot-product test, so its cost follows
//! local star density rather than catalog size.

use std::f64::consts::{PI, TAU};

use nalgebra::Vector3;
use rkyv::{Archive, Deserialize, Serialize};

/// A catalog star at the observation epoch.
///
/// `mag` is only used for brightness ordering; its photometric band depends on
/// the source catalog.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ReferenceStar {
    pub id: u64,
    pub ra_rad: f64,
    pub dec_rad: f64,
    pub mag: f32,
}

impl ReferenceStar {
    /// Convenience constructor from degrees.
    pub fn from_degrees(id: u64, ra_deg: f64, dec_deg: f64, mag: f32) -> Self {
        Self {
            id,
            ra_rad: ra_deg.to_radians(),
            dec_rad: dec_deg.to_radians(),
            mag,
        }
    }

    /// Unit vector on the celestial sphere.
    pub fn uvec(&self) -> Vector3<f64> {
        radec_to_uvec(self.ra_rad, self.dec_rad)
    }
}

/// Stars plus a flattened cell index (`cell_offsets` delimits each cell's
/// slice of `members`).
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct StarCatalog {
    nside: u32,
    stars: Vec<ReferenceStar>,
    cell_offsets: Vec<u32>,
    members: Vec<u32>,
}

impl StarCatalog {
    /// Index `stars`. An `nside` of zero is treated as 1.
    pub fn new(nside: u32, stars: Vec<ReferenceStar>) -> Self {
        let nside = nside.max(1);
        let (n_lat, n_lon) = (3 * nside, 4 * nside);
        let n_cells = (n_lat * n_lon) as usize;

        let mut counts = vec![0u32; n_cells + 1];
        let cells: Vec<usize> = stars
            .iter()
            .map(|s| cell_of(n_lat, n_lon, s.ra_rad, s.dec_rad))
            .collect();
        for &c in &cells {
            counts[c + 1] += 1;
        }
        for i in 0..n_cells {
            counts[i + 1] += counts[i];
        }
        let cell_offsets = counts.clone();
        let mut cursor = counts;
        let mut members = vec![0u32; stars.len()];
        for (star_idx, &c) in cells.iter().enumerate() {
            members[cursor[c] as usize] = star_idx as u32;
            cursor[c] += 1;
        }

        Self {
            nside,
            stars,
            cell_offsets,
            members,
        }
    }

    pub fn nside(&self) -> u32 {
        self.nside
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn stars(&self) -> &[ReferenceStar] {
        &self.stars
    }

    pub fn get(&self, idx: usize) -> Option<&ReferenceStar> {
        self.stars.get(idx)
    }

    /// Indices of stars within `radius_rad` of `dir`, ascending.
    ///
    /// `dir` need not be normalized; the radius is clamped to `[0, π]`.
    pub fn cone(&self, dir: &Vector3<f64>, radius_rad: f64) -> Vec<usize> {
        let norm = dir.norm();
        if self.is_empty() || norm == 0.0 || !norm.is_finite() {
            return Vec::new();
        }
        let dir = dir / norm;
        let radius = radius_rad.clamp(0.0, PI);
        let cos_radius = radius.cos();
        let (n_lat, n_lon) = (3 * self.nside, 4 * self.nside);
        let lon_step = TAU / n_lon as f64;

        // Declination band of the cone, then the z range it spans.
        let dec_c = dir.z.clamp(-1.0, 1.0).asin();
        let dec_lo = (dec_c - radius).max(-PI / 2.0);
        let dec_hi = (dec_c + radius).min(PI / 2.0);
        let lat_lo = lat_bin(n_lat, dec_lo.sin());
        let lat_hi = lat_bin(n_lat, dec_hi.sin());
        // Widest RA extent of a cone that does not contain a pole.
        let cos_dec_c = dec_c.cos();
        let half_span = if radius.sin() >= cos_dec_c || dec_hi >= PI / 2.0 || dec_lo <= -PI / 2.0 {
            PI
        } else {
            (radius.sin() / cos_dec_c).asin() + lon_step
        };

        let phi = dir.y.atan2(dir.x).rem_euclid(TAU);
        let mut out = Vec::new();
        for lat in lat_lo..=lat_hi {
            if half_span >= PI {
                for lon in 0..n_lon {
                    self.scan_cell(lat, lon, &dir, cos_radius, &mut out);
                }
                continue;
            }
            let first = lon_bin(n_lon, (phi - half_span).rem_euclid(TAU));
            let last = lon_bin(n_lon, (phi + half_span).rem_euclid(TAU));
            let mut lon = first;
            loop {
                self.scan_cell(lat, lon, &dir, cos_radius, &mut out);
                if lon == last {
                    break;
                }
                lon = (lon + 1) % n_lon;
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Check that the cell index is consistent with the stars, for catalogs
    /// read from disk.
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.nside > 0, "star catalog nside is zero");
        let n_cells = 12 * (self.nside as u64).pow(2);
        anyhow::ensure!(
            self.cell_offsets.len() as u64 == n_cells + 1,
            "star catalog has {} cell offsets, nside {} needs {}",
            self.cell_offsets.len(),
            self.nside,
            n_cells + 1
        );
        anyhow::ensure!(
            self.cell_offsets.first() == Some(&0) && self.cell_offsets.windows(2).all(|w| w[0] <= w[1]),
            "star catalog cell offsets are not ascending from zero"
        );
        anyhow::ensure!(
            self.members.len() == self.stars.len()
                && self.cell_offsets.last().map(|&o| o as usize) == Some(self.members.len()),
            "star catalog cells hold {} members for {} stars",
            self.members.len(),
            self.stars.len()
        );
        anyhow::ensure!(
            self.members.iter().all(|&m| (m as usize) < self.stars.len()),
            "star catalog cell member out of range"
        );
        Ok(())
    }

    /// Stars within `radius_rad` of the given position.
    pub fn cone_radec(&self, ra_rad: f64, dec_rad: f64, radius_rad: f64) -> Vec<&ReferenceStar> {
        self.cone(&radec_to_uvec(ra_rad, dec_rad), radius_rad)
            .into_iter()
            .map(|i| &self.stars[i])
            .collect()
    }

    fn scan_cell(
        &self,
        lat: u32,
        lon: u32,
        dir: &Vector3<f64>,
        cos_radius: f64,
        out: &mut Vec<usize>,
    ) {
        let cell = (lat * 4 * self.nside + lon) as usize;
        let range = self.cell_offsets[cell] as usize..self.cell_offsets[cell + 1] as usize;
        for &m in &self.members[range] {
            let idx = m as usize;
            if dir.dot(&self.stars[idx].uvec()) >= cos_radius {
                out.push(idx);
            }
        }
    }
}

fn cell_of(n_lat: u32, n_lon: u32, ra_rad: f64, dec_rad: f64) -> usize {
    let lat = lat_bin(n_lat, dec_rad.sin());
    let lon = lon_bin(n_lon, ra_rad.rem_euclid(TAU));
    (lat * n_lon + lon) as usize
}

fn lat_bin(n_lat: u32, z: f64) -> u32 {
    let u = (z.clamp(-1.0, 1.0) + 1.0) * 0.5;
    ((u * n_lat as f64).floor() as u32).min(n_lat - 1)
}

fn lon_bin(n_lon: u32, phi: f64) -> u32 {
    ((phi / TAU * n_lon as f64).floor() as u32).min(n_lon - 1)
}

/// Unit vector for a sky position in radians.
pub fn radec_to_uvec(ra_rad: f64, dec_rad: f64) -> Vector3<f64> {
    let (sin_ra, cos_ra) = ra_rad.sin_cos();
    let (sin_dec, cos_dec) = dec_rad.sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}

/// Sky position in radians, RA wrapped to `[0, 2π)`.
pub fn uvec_to_radec(v: &Vector3<f64>) -> (f64, f64) {
    let n = v.norm();
    let ra = v.y.atan2(v.x).rem_euclid(TAU);
    let dec = (v.z / n).clamp(-1.0, 1.0).asin();
    (ra, dec)
}

/// Great-circle separation of two unit vectors in radians.
pub fn angular_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    // atan2 form stays accurate for both tiny and near-antipodal separations.
    a.cross(b).norm().atan2(a.dot(b))
}
