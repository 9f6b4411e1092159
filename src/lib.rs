//! # skysolve
//!
//! Star extraction and **blind astrometric plate solving** in Rust.
//!
//! Given the pixels of an astronomical image, `skysolve` finds the stars,
//! matches their geometry against precomputed index files and returns where
//! on the sky the image points: centre, pixel scale, orientation, parity and a
//! TAN world coordinate system.
//!
//! ## Features
//!
//! - **Extraction**: background mesh, matched-filter detection, multi-threshold
//!   deblending, moments, half-flux radii and a configurable star filter
//! - **Blind solving**: geometric hashing of 4-star patterns searched
//!   brightest-first, with scale and position priors when available
//! - **Statistical verification**: log-odds of the hypothesis against a
//!   random-field model, with accept / stop / refine thresholds
//! - **Parallel search**: work units split by scale or star depth on a rayon
//!   pool, sharing one deadline, one step budget and one abort flag
//! - **Zero-copy index files**: indexes serialize with [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skysolve::{
//!     IndexCatalog, ParametersProfile, PixelBuffer, PlateSolver, SampleData,
//!     ScaleBounds, ScaleUnits,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Index files built with `IndexFile::build` and saved with `save_to_file`.
//! let catalog = Arc::new(IndexCatalog::load(&IndexCatalog::paths_from_env("SKYSOLVE_INDEX_PATH")));
//!
//! let samples: Vec<u16> = vec![0; 1024 * 1024]; // decoded elsewhere
//! let buffer = PixelBuffer::new(SampleData::U16(&samples), 1024, 1024, 1)?;
//!
//! let mut params = ParametersProfile::ParallelSolving.parameters();
//! params.scale = Some(ScaleBounds { low: 0.8, high: 1.2, units: ScaleUnits::ArcsecPerPixel });
//!
//! let solver = PlateSolver::new(&buffer, catalog);
//! let solution = solver.solve(&params)?;
//! println!("{}", solution.summary());
//! # Ok(())
//! # }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Extraction**: estimate the sky, detect and measure sources, then rank
//!    and trim them into a [`StarList`]
//! 2. **Quads**: draw 4-star subsets brightest-first and reduce each to five
//!    edge ratios, invariant to position, scale and rotation
//! 3. **Hash lookup**: quantize the ratios and probe the index's pattern table
//!    for every key within tolerance
//! 4. **Hypothesis**: fit a TAN projection to the 4 star pairs
//! 5. **Verification**: score how well the projected index stars explain the
//!    field, refit while the score improves and keep the best
//! 6. **Fit**: refine over all matched stars with outlier clipping

pub mod background;
pub mod controller;
pub mod error;
pub mod extraction;
pub mod filter;
pub mod index;
pub mod params;
pub mod pixel_buffer;
pub mod solver;
pub mod star;
pub mod starcatalog;

pub use background::{Background, BackgroundConfig};
pub use controller::{PlateSolver, SolverState};
pub use error::{ExtractionError, SolveError};
pub use extraction::{extract, extract_stars, Extraction, ExtractionProfile};
pub use filter::{SortKey, StarFilter, Trim};
pub use index::{BuildIndexConfig, CatalogQuery, IndexCatalog, IndexFile, IndexProperties};
pub use params::{
    LogOddsThresholds, Parallelism, ParametersProfile, ScaleBounds, ScaleUnits, SearchPartition,
    SearchPosition, SolveParameters,
};
pub use pixel_buffer::{ChannelStats, PixelBuffer, SampleData, Subframe};
pub use solver::{
    solve_star_list, CancelToken, MatchedStar, Parity, SearchReport, Solution, TanWcs,
};
pub use star::{Star, StarList};
pub use starcatalog::{ReferenceStar, StarCatalog};
