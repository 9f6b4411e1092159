//! Synthetic sky, index and field builders shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use skysolve::{
    BuildIndexConfig, IndexCatalog, IndexFile, Parallelism, ReferenceStar, ScaleBounds, ScaleUnits,
    SearchPartition, SolveParameters, Star, StarList, TanWcs,
};

pub const CENTRE_RA_DEG: f64 = 83.0;
pub const CENTRE_DEC_DEG: f64 = 22.0;
pub const IMAGE_SIZE: (u32, u32) = (1024, 1024);
pub const SCALE_ARCSEC: f64 = 1.0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// About 2000 stars of magnitude 8 to 13 within a degree of the centre.
pub fn sky() -> &'static [ReferenceStar] {
    static SKY: OnceLock<Vec<ReferenceStar>> = OnceLock::new();
    SKY.get_or_init(|| random_sky(7, 2000, CENTRE_RA_DEG, CENTRE_DEC_DEG, 1.0))
}

/// Stars uniformly scattered on the tangent plane around a centre.
pub fn random_sky(seed: u64, count: usize, ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<ReferenceStar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let r = radius_deg.to_radians();
    let centre = TanWcs {
        crval: [ra_deg.to_radians(), dec_deg.to_radians()],
        crpix: [0.0, 0.0],
        cd: [[-1.0, 0.0], [0.0, -1.0]],
        image_size: (1, 1),
    };
    let mut stars = Vec::with_capacity(count);
    while stars.len() < count {
        let (x, y) = (rng.random_range(-r..r), rng.random_range(-r..r));
        if x.hypot(y) > r {
            continue;
        }
        let (ra, dec) = centre.pixel_to_sky(x, y);
        let mag = rng.random_range(8.0f32..13.0);
        stars.push(ReferenceStar { id: 1000 + stars.len() as u64, ra_rad: ra, dec_rad: dec, mag });
    }
    stars
}

pub fn index_config() -> BuildIndexConfig {
    BuildIndexConfig {
        max_fov_deg: 0.45,
        min_fov_deg: Some(0.2),
        star_max_magnitude: Some(99.0),
        pattern_max_error: 0.002,
        patterns_per_field: 50,
        stars_per_fov: 30,
        catalog_nside: 64,
        ..Default::default()
    }
}

/// The index over [`sky`], built once per test binary.
pub fn index() -> Arc<IndexFile> {
    static INDEX: OnceLock<Arc<IndexFile>> = OnceLock::new();
    INDEX
        .get_or_init(|| Arc::new(IndexFile::build("synthetic", sky(), &index_config()).unwrap()))
        .clone()
}

pub fn catalog() -> Arc<IndexCatalog> {
    Arc::new(IndexCatalog::new(vec![(*index()).clone()]))
}

/// A TAN WCS with "up" `rotation_deg` east of north, optionally mirrored.
pub fn truth_wcs(rotation_deg: f64, mirrored: bool) -> TanWcs {
    let s = (SCALE_ARCSEC / 3600.0).to_radians();
    let (sn, cs) = rotation_deg.to_radians().sin_cos();
    let m = if mirrored { -1.0 } else { 1.0 };
    TanWcs {
        crval: [CENTRE_RA_DEG.to_radians(), CENTRE_DEC_DEG.to_radians()],
        crpix: TanWcs::image_centre(IMAGE_SIZE),
        cd: [[-s * cs * m, -s * sn], [s * sn * m, -s * cs]],
        image_size: IMAGE_SIZE,
    }
}

/// The brightest `max` sky stars that land on the image.
pub fn visible_sky(wcs: &TanWcs, sky: &[ReferenceStar], max: usize) -> Vec<ReferenceStar> {
    let mut visible: Vec<&ReferenceStar> = sky
        .iter()
        .filter(|s| wcs.sky_to_pixel(s.ra_rad, s.dec_rad).is_some_and(|(x, y)| wcs.contains(x, y)))
        .collect();
    visible.sort_by(|a, b| a.mag.total_cmp(&b.mag));
    visible.into_iter().take(max).cloned().collect()
}

/// The brightest `max` sky stars on the image, with Gaussian position noise.
pub fn field_stars(wcs: &TanWcs, sky: &[ReferenceStar], max: usize, noise_px: f64, seed: u64) -> StarList {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_px.max(1e-12)).unwrap();
    visible_sky(wcs, sky, max)
        .iter()
        .filter_map(|s| {
            let (x, y) = wcs.sky_to_pixel(s.ra_rad, s.dec_rad)?;
            let flux = 10f64.powf(-0.4 * (s.mag as f64 - 20.0));
            Some(star(x + noise.sample(&mut rng), y + noise.sample(&mut rng), flux))
        })
        .collect()
}

pub fn star(x: f64, y: f64, flux: f64) -> Star {
    Star {
        x,
        y,
        flux,
        peak: flux / 20.0,
        background: 0.0,
        a: 1.3,
        b: 1.2,
        theta_deg: 0.0,
        hfr: 1.5,
        mag: 20.0 - 2.5 * flux.log10(),
        num_pixels: 25,
        border: false,
    }
}

/// Parameters with a scale prior around the true scale, searched on the
/// calling thread.
pub fn params() -> SolveParameters {
    SolveParameters {
        scale: Some(ScaleBounds { low: 0.9, high: 1.1, units: ScaleUnits::ArcsecPerPixel }),
        parallelism: Parallelism::Sequential,
        partition: SearchPartition::None,
        time_limit: Duration::from_secs(120),
        ..Default::default()
    }
}

/// Render stars as Gaussian profiles of `fwhm` pixels over a noisy sky.
pub fn render(stars: &StarList, size: (u32, u32), fwhm: f64, sky_level: f64, sky_noise: f64, seed: u64) -> Vec<u16> {
    let (w, h) = (size.0 as usize, size.1 as usize);
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, sky_noise).unwrap();
    let mut image: Vec<f64> = (0..w * h).map(|_| sky_level + noise.sample(&mut rng)).collect();

    let sigma = fwhm / 2.354_820_045;
    let reach = (4.0 * sigma).ceil() as i64;
    let max_flux = stars.iter().map(|s| s.flux).fold(0.0, f64::max);
    for s in stars.iter() {
        // Brightest star peaks at 30000 counts.
        let peak = 30_000.0 * s.flux / max_flux;
        let (cx, cy) = (s.x.round() as i64, s.y.round() as i64);
        for py in (cy - reach).max(0)..=(cy + reach).min(h as i64 - 1) {
            for px in (cx - reach).max(0)..=(cx + reach).min(w as i64 - 1) {
                let d2 = (px as f64 - s.x).powi(2) + (py as f64 - s.y).powi(2);
                image[py as usize * w + px as usize] += peak * (-d2 / (2.0 * sigma * sigma)).exp();
            }
        }
    }
    image.into_iter().map(|v| v.round().clamp(0.0, 65535.0) as u16).collect()
}

/// Angular distance in arcseconds between two positions given in degrees.
pub fn separation_arcsec(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let a = skysolve::starcatalog::radec_to_uvec(ra1.to_radians(), dec1.to_radians());
    let b = skysolve::starcatalog::radec_to_uvec(ra2.to_radians(), dec2.to_radians());
    skysolve::starcatalog::angular_distance(&a, &b).to_degrees() * 3600.0
}
