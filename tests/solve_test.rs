//! Solve synthetic star lists drawn from a known sky through a known WCS and
//! check that the solution recovers it.

mod common;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use common::*;
use skysolve::solver::Search;
use skysolve::{
    solve_star_list, CancelToken, IndexCatalog, IndexFile, Parallelism, Parity, SearchPartition, SearchPosition,
    SolveError, StarList,
};

#[test]
fn recovers_scale_rotation_and_parity() {
    init_tracing();
    let wcs = truth_wcs(0.0, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 1);
    assert_eq!(stars.len(), 50);

    let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params(), &CancelToken::new()).unwrap();
    println!("{}", solution.summary());

    assert_relative_eq!(solution.pixel_scale_arcsec, SCALE_ARCSEC, max_relative = 1e-3);
    assert!(solution.orientation_deg.abs() < 0.01, "orientation {}", solution.orientation_deg);
    assert_eq!(solution.parity, Parity::Normal);
    assert!(separation_arcsec(solution.ra_deg, solution.dec_deg, CENTRE_RA_DEG, CENTRE_DEC_DEG) < 0.5);
    assert_relative_eq!(solution.field_width_arcmin, 1024.0 / 60.0, max_relative = 1e-3);
    assert!(solution.num_matches >= 20, "{} matches", solution.num_matches);
    assert!(solution.log_odds >= params().log_odds.to_solve);
    assert_eq!(solution.index_name, "synthetic");
    assert!(solution.rms_residual_px < 0.2);
    assert!(solution.position_error_arcsec.is_none());
}

#[test]
fn index_of_the_field_stars_alone() {
    init_tracing();
    for (rotation, mirrored, parity) in [(0.0, false, Parity::Normal), (30.0, true, Parity::Flipped)] {
        let wcs = truth_wcs(rotation, mirrored);
        let fifty = visible_sky(&wcs, sky(), 50);
        assert_eq!(fifty.len(), 50);
        let catalog = IndexCatalog::new(vec![IndexFile::build("fifty", &fifty, &index_config()).unwrap()]);

        let stars = field_stars(&wcs, &fifty, 50, 0.05, 20);
        assert_eq!(stars.len(), 50);
        let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog, &params(), &CancelToken::new()).unwrap();
        println!("{}", solution.summary());

        assert_eq!(solution.parity, parity);
        assert_relative_eq!(solution.pixel_scale_arcsec, SCALE_ARCSEC, max_relative = 1e-3);
        assert!(separation_arcsec(solution.ra_deg, solution.dec_deg, CENTRE_RA_DEG, CENTRE_DEC_DEG) < 0.5);
        if !mirrored {
            assert!(solution.orientation_deg.abs() < 0.01, "orientation {}", solution.orientation_deg);
        }
        assert_eq!(solution.index_name, "fifty");
    }
}

#[test]
fn rotated_field() {
    init_tracing();
    let wcs = truth_wcs(-117.5, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 2);
    let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params(), &CancelToken::new()).unwrap();
    assert!((solution.orientation_deg + 117.5).abs() < 0.01, "orientation {}", solution.orientation_deg);
    assert_eq!(solution.parity, Parity::Normal);
}

#[test]
fn mirrored_field_is_flipped() {
    init_tracing();
    let wcs = truth_wcs(30.0, true);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 3);
    let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params(), &CancelToken::new()).unwrap();
    assert_eq!(solution.parity, Parity::Flipped);
    assert_relative_eq!(solution.pixel_scale_arcsec, SCALE_ARCSEC, max_relative = 1e-3);
    assert!(separation_arcsec(solution.ra_deg, solution.dec_deg, CENTRE_RA_DEG, CENTRE_DEC_DEG) < 0.5);
}

#[test]
fn sequential_solves_are_identical() {
    init_tracing();
    let wcs = truth_wcs(12.0, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 4);
    let catalog = catalog();
    let first = solve_star_list(&stars, IMAGE_SIZE, &catalog, &params(), &CancelToken::new()).unwrap();
    let second = solve_star_list(&stars, IMAGE_SIZE, &catalog, &params(), &CancelToken::new()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn matched_stars_round_trip() {
    init_tracing();
    let wcs = truth_wcs(45.0, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 5);
    let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params(), &CancelToken::new()).unwrap();

    for m in &solution.matched_stars {
        let (x, y) = solution.sky_to_pixel(m.ra_deg, m.dec_deg).unwrap();
        assert!((x - m.x).hypot(y - m.y) < 0.3, "star {} off by {:.3} px", m.star_index, m.residual_px);
        let (ra, dec) = solution.pixel_to_sky(m.x, m.y);
        assert!(separation_arcsec(ra, dec, m.ra_deg, m.dec_deg) < 0.3);
        assert!(m.reference_id >= 1000);
    }

    // Every star lands within a fraction of a pixel of where the truth puts it.
    let positions = solution.sky_positions(&stars);
    assert_eq!(positions.len(), stars.len());
    for (star, (ra, dec)) in stars.iter().zip(positions) {
        let (tx, ty) = wcs.sky_to_pixel(ra.to_radians(), dec.to_radians()).unwrap();
        assert!((tx - star.x).hypot(ty - star.y) < 0.5);
    }
}

#[test]
fn best_score_only_increases() {
    init_tracing();
    let wcs = truth_wcs(0.0, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 6);
    let catalog = catalog();
    let params = params();
    let search = Search::new(&stars, IMAGE_SIZE, &catalog, &params, &CancelToken::new()).unwrap();
    let report = search.run();
    assert!(!report.aborted);
    assert!(!report.score_history.is_empty());
    assert!(report.score_history.windows(2).all(|w| w[1] > w[0]));
    let best = report.best.as_ref().unwrap();
    assert_eq!(best.log_odds, *report.score_history.last().unwrap());
    assert!(best.log_odds >= search.thresholds().to_solve);
    assert!(report.quads_tried > 0);
}

#[test]
fn parallel_depth_search() {
    init_tracing();
    let wcs = truth_wcs(-60.0, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 7);
    let mut params = params();
    params.parallelism = Parallelism::Threads(4);
    params.partition = SearchPartition::Auto;

    let search = Search::new(&stars, IMAGE_SIZE, &catalog(), &params, &CancelToken::new()).unwrap();
    // Scale prior only: the search is split by star depth.
    assert_eq!(search.units().len(), 5);

    let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params, &CancelToken::new()).unwrap();
    assert!((solution.orientation_deg + 60.0).abs() < 0.01);
    assert!(separation_arcsec(solution.ra_deg, solution.dec_deg, CENTRE_RA_DEG, CENTRE_DEC_DEG) < 0.5);
}

#[test]
fn position_prior_reports_the_offset() {
    init_tracing();
    let wcs = truth_wcs(90.0, false);
    let stars = field_stars(&wcs, sky(), 50, 0.05, 8);
    let mut params = params();
    params.search_position = Some(SearchPosition {
        ra_deg: CENTRE_RA_DEG + 0.01,
        dec_deg: CENTRE_DEC_DEG - 0.02,
        radius_deg: 0.5,
    });
    let solution = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params, &CancelToken::new()).unwrap();
    let (dra, ddec) = solution.position_error_arcsec.unwrap();
    assert!((dra + 0.01 * 3600.0 * CENTRE_DEC_DEG.to_radians().cos()).abs() < 1.0, "dra {dra}");
    assert!((ddec - 0.02 * 3600.0).abs() < 1.0, "ddec {ddec}");
}

#[test]
fn empty_field_has_no_solution() {
    init_tracing();
    let result = solve_star_list(&StarList::default(), IMAGE_SIZE, &catalog(), &params(), &CancelToken::new());
    assert_eq!(result, Err(SolveError::NoSolution));
}

#[test]
fn unrelated_stars_have_no_solution() {
    init_tracing();
    let mut params = params();
    params.max_quads = Some(20_000);
    let mut rng = StdRng::seed_from_u64(99);
    let stars: StarList = (0..40)
        .map(|i| star(rng.random_range(0.0..1023.0), rng.random_range(0.0..1023.0), 1e6 / (i + 1) as f64))
        .collect();
    let result = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params, &CancelToken::new());
    assert_eq!(result, Err(SolveError::NoSolution));
}

#[test]
fn uncovered_position_is_index_unavailable() {
    init_tracing();
    let stars = field_stars(&truth_wcs(0.0, false), sky(), 50, 0.05, 9);
    let mut params = params();
    params.search_position = Some(SearchPosition { ra_deg: 250.0, dec_deg: -40.0, radius_deg: 1.0 });
    let result = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params, &CancelToken::new());
    assert!(matches!(result, Err(SolveError::IndexUnavailable(_))), "{result:?}");
}

#[test]
fn cancelled_search_is_aborted() {
    init_tracing();
    let stars = field_stars(&truth_wcs(0.0, false), sky(), 50, 0.05, 10);
    let token = CancelToken::new();
    token.cancel();
    let result = solve_star_list(&stars, IMAGE_SIZE, &catalog(), &params(), &token);
    assert_eq!(result, Err(SolveError::Aborted));
}
