//! Index files: reference stars plus a hash table of 4-star pattern codes.
//!
//! An index covers one band of pattern scales (largest-edge angles) over one
//! region of sky. Files are built once with [`IndexFile::build`], saved with
//! rkyv, and shared read-only between solver workers through an
//! [`IndexCatalog`].

pub mod build;
pub mod catalog;
pub mod combinations;
pub mod pattern;

pub use build::BuildIndexConfig;
pub use catalog::{CatalogQuery, IndexCatalog};

use std::path::Path;

use nalgebra::Vector3;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::starcatalog::{angular_distance, StarCatalog};
use pattern::{hash_to_index, key_hash, probe_chain, short_hash, GeometricCode, NUM_RATIOS, PATTERN_SIZE};

/// How an index was built and what it covers.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct IndexProperties {
    /// Quantization bins per ratio, `round(0.25 / pattern_max_error)`.
    pub pattern_bins: u32,
    /// Ratio tolerance used when matching against this index.
    pub pattern_max_error: f64,
    /// Smallest largest-edge angle over all stored patterns (radians).
    pub min_scale_rad: f64,
    /// Largest largest-edge angle over all stored patterns (radians).
    pub max_scale_rad: f64,
    pub min_fov_rad: f64,
    pub max_fov_rad: f64,
    pub num_patterns: u32,
    /// Faintest magnitude kept.
    pub star_max_magnitude: f32,
    /// Target star density per field, used for cluster busting.
    pub stars_per_fov: u32,
    pub patterns_per_field: u32,
    /// Normalized mean direction of the stars.
    pub coverage_centre: [f64; 3],
    /// Largest distance of any star from `coverage_centre` (radians).
    pub coverage_radius_rad: f64,
}

/// A complete index, serializable with rkyv.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct IndexFile {
    pub(crate) name: String,
    /// Stars sorted brightest first; index order is brightness order.
    pub(crate) star_catalog: StarCatalog,
    /// Unit vectors parallel to the catalog's stars.
    pub(crate) star_vectors: Vec<[f64; 3]>,
    /// Open-addressing table of canonical-order patterns; empty slots are
    /// [`pattern::EMPTY_SLOT`].
    pub(crate) pattern_catalog: Vec<[u32; PATTERN_SIZE]>,
    /// Largest edge angle of each slot's pattern (radians).
    pub(crate) pattern_largest_edge: Vec<f64>,
    /// Low 16 bits of each slot's key hash.
    pub(crate) pattern_key_hashes: Vec<u16>,
    pub(crate) props: IndexProperties,
}

impl IndexFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn props(&self) -> &IndexProperties {
        &self.props
    }

    pub fn star_catalog(&self) -> &StarCatalog {
        &self.star_catalog
    }

    pub fn num_stars(&self) -> usize {
        self.star_vectors.len()
    }

    pub fn table_size(&self) -> usize {
        self.pattern_catalog.len()
    }

    pub fn star_vector(&self, idx: usize) -> Vector3<f64> {
        let v = self.star_vectors[idx];
        Vector3::new(v[0], v[1], v[2])
    }

    pub fn pattern(&self, slot: usize) -> [u32; PATTERN_SIZE] {
        self.pattern_catalog[slot]
    }

    pub fn pattern_largest_edge(&self, slot: usize) -> f64 {
        self.pattern_largest_edge[slot]
    }

    /// Code of the pattern stored in `slot`, recomputed from its stars.
    pub fn pattern_code(&self, slot: usize) -> Option<GeometricCode> {
        let pat = self.pattern_catalog[slot];
        GeometricCode::from_vectors(&pat.map(|i| self.star_vector(i as usize)))
    }

    /// Occupied slots reachable from `key` whose 16-bit hash matches.
    pub fn slots_for_key(&self, key: &[u32; NUM_RATIOS]) -> Vec<usize> {
        if self.pattern_catalog.is_empty() {
            return Vec::new();
        }
        let hash = key_hash(key, self.props.pattern_bins);
        let short = short_hash(hash);
        probe_chain(hash_to_index(hash, self.pattern_catalog.len()), &self.pattern_catalog)
            .into_iter()
            .filter(|&slot| self.pattern_key_hashes[slot] == short)
            .collect()
    }

    /// Whether the pattern-scale band overlaps `[lo_rad, hi_rad]`.
    pub fn scale_overlaps(&self, lo_rad: f64, hi_rad: f64) -> bool {
        self.props.num_patterns > 0 && lo_rad <= self.props.max_scale_rad && hi_rad >= self.props.min_scale_rad
    }

    /// Whether the sky coverage intersects a cone.
    pub fn covers(&self, dir: &Vector3<f64>, radius_rad: f64) -> bool {
        let c = self.props.coverage_centre;
        let centre = Vector3::new(c[0], c[1], c[2]);
        angular_distance(&centre, dir) <= self.props.coverage_radius_rad + radius_rad
    }

    // ── Serialization ───────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {e}"))?;
        Ok(bytes.to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        // Archived data must be aligned; a plain Vec<u8> is not guaranteed to be.
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let index = rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {e}"))?;
        index.validate()?;
        Ok(index)
    }

    /// Check that the parallel arrays agree and that every stored pattern
    /// refers to a stored star.
    pub fn validate(&self) -> anyhow::Result<()> {
        let num_stars = self.star_vectors.len();
        anyhow::ensure!(
            num_stars == self.star_catalog.len(),
            "index '{}' has {} star vectors for {} catalog stars",
            self.name,
            num_stars,
            self.star_catalog.len()
        );
        self.star_catalog.validate()?;

        let slots = self.pattern_catalog.len();
        anyhow::ensure!(
            self.pattern_largest_edge.len() == slots && self.pattern_key_hashes.len() == slots,
            "index '{}' pattern arrays disagree: {} slots, {} edges, {} hashes",
            self.name,
            slots,
            self.pattern_largest_edge.len(),
            self.pattern_key_hashes.len()
        );

        let mut occupied = 0usize;
        for (slot, pattern) in self.pattern_catalog.iter().enumerate() {
            if *pattern == pattern::EMPTY_SLOT {
                continue;
            }
            occupied += 1;
            if let Some(&bad) = pattern.iter().find(|&&s| s as usize >= num_stars) {
                anyhow::bail!(
                    "index '{}' slot {} refers to star {} of {}",
                    self.name,
                    slot,
                    bad,
                    num_stars
                );
            }
        }
        anyhow::ensure!(
            occupied == self.props.num_patterns as usize,
            "index '{}' claims {} patterns but its table holds {}",
            self.name,
            self.props.num_patterns,
            occupied
        );
        anyhow::ensure!(
            occupied == 0 || self.props.pattern_bins > 0,
            "index '{}' has zero pattern bins",
            self.name
        );
        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        std::fs::write(path, &bytes)?;
        info!("Saved index '{}' to {} ({} bytes)", self.name, path.display(), bytes.len());
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let index = Self::from_bytes(&bytes)?;
        info!(
            "Loaded index '{}': {} stars, {} patterns",
            index.name,
            index.num_stars(),
            index.props.num_patterns
        );
        Ok(index)
    }
}
