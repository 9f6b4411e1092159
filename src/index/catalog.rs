//! The set of loaded index files and candidate selection for a solve.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::{info, warn};

use super::IndexFile;

/// What a solve needs from an index: a pattern-scale band and, optionally, a
/// patch of sky.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    /// Pixel scale bounds in radians per pixel.
    pub scale_rad_per_px: (f64, f64),
    /// Image size in pixels.
    pub image_size: (u32, u32),
    /// Smallest usable quad, as a fraction of the image diagonal.
    pub min_quad_fraction: f64,
    /// Search cone: direction and radius in radians.
    pub position: Option<(Vector3<f64>, f64)>,
}

impl CatalogQuery {
    pub fn diagonal_px(&self) -> f64 {
        (self.image_size.0 as f64).hypot(self.image_size.1 as f64)
    }

    /// Largest-edge angles a quad from this image can have.
    pub fn pattern_scale_band(&self) -> (f64, f64) {
        let d = self.diagonal_px();
        let (lo, hi) = self.scale_rad_per_px;
        (lo * self.min_quad_fraction * d, hi * d)
    }
}

/// Read-only collection of index files, shared between solves as
/// `Arc<IndexCatalog>`.
#[derive(Debug, Default)]
pub struct IndexCatalog {
    files: Vec<Arc<IndexFile>>,
    skipped: Vec<(PathBuf, String)>,
}

impl IndexCatalog {
    pub fn new(files: Vec<IndexFile>) -> Self {
        Self {
            files: files.into_iter().map(Arc::new).collect(),
            skipped: Vec::new(),
        }
    }

    /// Load index files. Directories contribute their `*.rkyv` files in
    /// sorted order. Files that fail to load are logged and recorded in
    /// [`skipped`](Self::skipped).
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut catalog = Self::default();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                match index_files_in(path) {
                    Ok(files) => {
                        for file in files {
                            catalog.load_one(&file);
                        }
                    }
                    Err(e) => catalog.skip(path, e.to_string()),
                }
            } else {
                catalog.load_one(path);
            }
        }
        info!(
            "Index catalog: {} file(s) loaded, {} skipped",
            catalog.files.len(),
            catalog.skipped.len()
        );
        catalog
    }

    fn load_one(&mut self, path: &Path) {
        match IndexFile::load_from_file(path) {
            Ok(index) => self.files.push(Arc::new(index)),
            Err(e) => self.skip(path, format!("{e:#}")),
        }
    }

    fn skip(&mut self, path: &Path, reason: String) {
        warn!("Skipping index {}: {}", path.display(), reason);
        self.skipped.push((path.to_path_buf(), reason));
    }

    /// Split a path-list environment variable (`:`-separated on Unix).
    /// An unset variable gives no paths.
    pub fn paths_from_env(var: impl AsRef<OsStr>) -> Vec<PathBuf> {
        std::env::var_os(var)
            .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn files(&self) -> &[Arc<IndexFile>] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn skipped(&self) -> &[(PathBuf, String)] {
        &self.skipped
    }

    /// Files able to serve `query`, in catalog order.
    pub fn candidates(&self, query: &CatalogQuery) -> Vec<Arc<IndexFile>> {
        let (lo, hi) = query.pattern_scale_band();
        let half_diagonal = query.scale_rad_per_px.1 * query.diagonal_px() / 2.0;
        self.files
            .iter()
            .filter(|f| f.scale_overlaps(lo, hi))
            .filter(|f| match &query.position {
                Some((dir, radius)) => f.covers(dir, radius + half_diagonal),
                None => true,
            })
            .cloned()
            .collect()
    }
}

fn index_files_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "rkyv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
