//! Start pose for the local search.

use log::debug;
use nalgebra::{Matrix2, Vector2};

use super::{PoseBounds, PoseGrid};
use crate::eye::EyePose;
use crate::geometry::{fit_ellipse, rms_distance, Ellipse};
use crate::scene::SceneGeometry;

/// Neighbour counts tried against the grid.
const GRID_NEIGHBOURS: [usize; 3] = [1, 4, 8];

/// Stop radius of the reference projection, mm.
const REFERENCE_RADIUS: f64 = 2.0;

/// Rotation used for the finite-difference sensitivities, degrees.
const SENSITIVITY_STEP: f64 = 1.0;

/// Guesses a pose for `observed` that lies inside `bounds` with `headroom`.
///
/// With a grid, the inverse-distance weighted poses of the nearest entries
/// are scored by their fit to the observed points and blended by inverse
/// error. Otherwise the observed ellipse centre is mapped back through the
/// azimuth and elevation sensitivities around the primary position, and the
/// stop radius is scaled from the reference semi-major axis. When nothing can
/// be projected the bounds midpoint is returned.
pub fn initial_guess(
    scene: &SceneGeometry,
    observed: &[Vector2<f64>],
    bounds: &PoseBounds,
    grid: Option<&PoseGrid>,
    headroom: f64,
) -> EyePose {
    let ellipse = fit_ellipse(observed);
    if let (Some(grid), Some(ellipse)) = (grid, ellipse.as_ref()) {
        if let Some(pose) = from_grid(scene, observed, ellipse, grid, bounds, headroom) {
            debug!("Grid start pose {:?}", pose.to_array());
            return pose;
        }
    }
    match analytic(scene, observed, ellipse.as_ref(), bounds, headroom) {
        Some(pose) => {
            debug!("Analytic start pose {:?}", pose.to_array());
            pose
        }
        None => {
            debug!("No projectable reference pose, starting from the bounds midpoint");
            midpoint(bounds)
        }
    }
}

fn midpoint(bounds: &PoseBounds) -> EyePose {
    EyePose::from_array(std::array::from_fn(|i| {
        0.5 * (bounds.lower[i] + bounds.upper[i])
    }))
}

fn from_grid(
    scene: &SceneGeometry,
    observed: &[Vector2<f64>],
    ellipse: &Ellipse,
    grid: &PoseGrid,
    bounds: &PoseBounds,
    headroom: f64,
) -> Option<EyePose> {
    let mut candidates = Vec::with_capacity(GRID_NEIGHBOURS.len());
    for k in GRID_NEIGHBOURS {
        let Some(pose) = grid.weighted_pose(ellipse, k) else {
            continue;
        };
        let pose = bounds.clamp_with_headroom(&pose, headroom);
        let Ok(projection) = scene.project_pose(&pose) else {
            continue;
        };
        let error = rms_distance(&projection.ellipse, observed);
        if !error.is_finite() {
            continue;
        }
        if error == 0.0 {
            return Some(pose);
        }
        candidates.push((pose, error));
    }
    if candidates.is_empty() {
        return None;
    }

    let mut sum = [0.0; 4];
    let mut total = 0.0;
    for (pose, error) in &candidates {
        let weight = 1.0 / error;
        for (s, v) in sum.iter_mut().zip(pose.to_array()) {
            *s += weight * v;
        }
        total += weight;
    }
    Some(EyePose::from_array(sum.map(|s| s / total)))
}

fn analytic(
    scene: &SceneGeometry,
    observed: &[Vector2<f64>],
    ellipse: Option<&Ellipse>,
    bounds: &PoseBounds,
    headroom: f64,
) -> Option<EyePose> {
    let radius = {
        let (lo, hi) = bounds.shrunk(3, headroom);
        if (lo..=hi).contains(&REFERENCE_RADIUS) {
            REFERENCE_RADIUS
        } else {
            0.5 * (lo + hi)
        }
    };
    let torsion = {
        let (lo, hi) = bounds.shrunk(2, headroom);
        0.5 * (lo + hi)
    };
    let reference = bounds.clamp_with_headroom(&EyePose::new(0.0, 0.0, torsion, radius), headroom);

    let project = |pose: &EyePose| scene.project_pose(pose).ok().map(|p| p.ellipse);
    let base = project(&reference)?;
    let shifted = |d_az: f64, d_el: f64| {
        project(&EyePose::new(
            reference.azimuth + d_az,
            reference.elevation + d_el,
            reference.torsion,
            reference.stop_radius,
        ))
    };
    let by_azimuth = shifted(SENSITIVITY_STEP, 0.0)?;
    let by_elevation = shifted(0.0, SENSITIVITY_STEP)?;

    let sensitivity = Matrix2::from_columns(&[
        (by_azimuth.center() - base.center()) / SENSITIVITY_STEP,
        (by_elevation.center() - base.center()) / SENSITIVITY_STEP,
    ]);
    let target = match ellipse {
        Some(e) => e.center(),
        None => observed.iter().sum::<Vector2<f64>>() / observed.len().max(1) as f64,
    };
    let angles = sensitivity.lu().solve(&(target - base.center()))?;

    let stop_radius = match ellipse {
        Some(e) if base.semi_major > 0.0 => reference.stop_radius * e.semi_major / base.semi_major,
        _ => reference.stop_radius,
    };

    let guess = EyePose::new(
        reference.azimuth + angles.x,
        reference.elevation + angles.y,
        reference.torsion,
        stop_radius,
    );
    guess
        .is_finite()
        .then(|| bounds.clamp_with_headroom(&guess, headroom))
}
