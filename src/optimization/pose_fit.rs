//! Eye pose estimation from observed stop boundary points.
//!
//! The objective is the orthogonal distance from each observed point to the
//! ellipse fitted through the forward-projected stop perimeter, scaled by
//! [`FitSettings::objective_scale`] to keep the solver's stopping tests away
//! from round-off. Local searches run [`minimize_bounded`]; when the best
//! RMSE stays above the repeat threshold the search restarts from seeded
//! random points inside the bounds.

use log::{info, warn};
use nalgebra::{DVector, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    initial_guess, minimize_bounded, Bounds, Evaluation, IterationObserver, LeastSquaresProblem,
    LmSettings, ObserverAction, PoseGrid,
};
use crate::eye::EyePose;
use crate::geometry::{distances_to_ellipse, Ellipse};
use crate::optics::OpticsError;
use crate::scene::SceneGeometry;

/// Free parameters closer than this to a bound count as on it.
const AT_BOUND_TOLERANCE: f64 = 1e-4;

/// Box constraints on `[azimuth, elevation, torsion, stop_radius]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseBounds {
    pub lower: [f64; 4],
    pub upper: [f64; 4],
}

impl Default for PoseBounds {
    /// Torsion pinned at zero.
    fn default() -> Self {
        PoseBounds {
            lower: [-40.0, -35.0, 0.0, 0.5],
            upper: [40.0, 35.0, 0.0, 4.5],
        }
    }
}

impl PoseBounds {
    pub fn new(lower: [f64; 4], upper: [f64; 4]) -> Self {
        PoseBounds { lower, upper }
    }

    pub fn has_nan(&self) -> bool {
        self.lower.iter().chain(self.upper.iter()).any(|v| v.is_nan())
    }

    pub fn is_pinned(&self, i: usize) -> bool {
        self.lower[i] == self.upper[i]
    }

    /// True when none of azimuth, elevation or torsion is pinned.
    pub fn is_underconstrained(&self) -> bool {
        (0..3).all(|i| !self.is_pinned(i))
    }

    pub fn to_bounds(&self) -> Result<Bounds, OpticsError> {
        Bounds::new(
            DVector::from_row_slice(&self.lower),
            DVector::from_row_slice(&self.upper),
        )
    }

    /// Interval of parameter `i` shrunk by `headroom` of its width on each
    /// side. `headroom` is capped at one half.
    pub fn shrunk(&self, i: usize, headroom: f64) -> (f64, f64) {
        let margin = headroom.clamp(0.0, 0.5) * (self.upper[i] - self.lower[i]);
        (self.lower[i] + margin, self.upper[i] - margin)
    }

    /// Clamps `pose` into the bounds, keeping `headroom` away from each side.
    pub fn clamp_with_headroom(&self, pose: &EyePose, headroom: f64) -> EyePose {
        let values = pose.to_array();
        EyePose::from_array(std::array::from_fn(|i| {
            let (lo, hi) = self.shrunk(i, headroom);
            values[i].clamp(lo, hi)
        }))
    }

    /// Uniform draw inside the bounds with `headroom`.
    pub fn sample<R: Rng>(&self, rng: &mut R, headroom: f64) -> EyePose {
        EyePose::from_array(std::array::from_fn(|i| {
            let (lo, hi) = self.shrunk(i, headroom);
            if hi > lo {
                rng.gen_range(lo..=hi)
            } else {
                lo
            }
        }))
    }
}

/// Knobs of the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    /// Iteration limit of each local search.
    pub max_iterations: usize,
    /// Relative finite-difference step.
    pub fd_step: f64,
    /// Seed of the restart draws.
    pub seed: u64,
    /// Fraction of each bound interval kept clear by start points.
    pub headroom: f64,
    /// Residual multiplier.
    pub objective_scale: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        FitSettings {
            max_iterations: 50,
            fd_step: 1e-4,
            seed: 42,
            headroom: 0.05,
            objective_scale: 1e4,
        }
    }
}

/// Outcome of [`fit_pose`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub pose: EyePose,
    /// RMS orthogonal distance in pixels, unscaled.
    pub rmse: f64,
    pub ellipse: Option<Ellipse>,
    /// Some free parameter ended within 1e-4 of a bound.
    pub at_bound: bool,
    pub restarts: usize,
    pub evaluations: usize,
    /// No rotational parameter was pinned.
    pub underconstrained: bool,
    /// False when no candidate could be evaluated or the inputs were NaN.
    pub valid: bool,
}

impl FitResult {
    pub fn invalid() -> Self {
        FitResult {
            pose: EyePose::from_array([f64::NAN; 4]),
            rmse: f64::NAN,
            ellipse: None,
            at_bound: false,
            restarts: 0,
            evaluations: 0,
            underconstrained: false,
            valid: false,
        }
    }
}

/// Distances from observed points to the projected stop, scaled.
struct PoseProblem {
    scene: SceneGeometry,
    observed: Vec<Vector2<f64>>,
    scale: f64,
}

impl LeastSquaresProblem for PoseProblem {
    type Output = Ellipse;

    fn evaluate(&self, params: &DVector<f64>) -> Option<Evaluation<Ellipse>> {
        let pose = EyePose::new(params[0], params[1], params[2], params[3]);
        let ellipse = self.scene.project_pose(&pose).ok()?.ellipse;
        let distances = distances_to_ellipse(&ellipse, &self.observed);
        Some(Evaluation {
            residuals: DVector::from_iterator(distances.len(), distances.into_iter().map(|d| d * self.scale)),
            output: ellipse,
        })
    }
}

/// Best iterate seen by one local search, which need not be its last.
struct BestFit {
    params: DVector<f64>,
    rmse: f64,
    ellipse: Ellipse,
}

struct FitObserver {
    points: usize,
    scale: f64,
    rmse_thresh: f64,
    best: Option<BestFit>,
}

impl FitObserver {
    fn new(points: usize, scale: f64, rmse_thresh: f64) -> Self {
        FitObserver {
            points,
            scale,
            rmse_thresh,
            best: None,
        }
    }
}

impl IterationObserver<Ellipse> for FitObserver {
    fn observe(&mut self, _: usize, params: &DVector<f64>, cost: f64, ellipse: &Ellipse) -> ObserverAction {
        let rmse = (cost / self.points as f64).sqrt() / self.scale;
        if self.best.as_ref().map_or(true, |best| rmse < best.rmse) {
            self.best = Some(BestFit {
                params: params.clone(),
                rmse,
                ellipse: *ellipse,
            });
        }
        if rmse < self.rmse_thresh {
            ObserverAction::Stop
        } else {
            ObserverAction::Continue
        }
    }
}

/// Multi-start pose estimator bound to one scene.
pub struct PoseFitter<'a> {
    scene: &'a SceneGeometry,
    settings: FitSettings,
    grid: Option<&'a PoseGrid>,
}

impl<'a> PoseFitter<'a> {
    pub fn new(scene: &'a SceneGeometry) -> Self {
        PoseFitter {
            scene,
            settings: FitSettings::default(),
            grid: None,
        }
    }

    pub fn with_settings(mut self, settings: FitSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `grid` for nearest-neighbour start points.
    pub fn with_grid(mut self, grid: &'a PoseGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }

    /// Fits a pose to `observed`.
    ///
    /// Searches start from `x0` when given, else from [`initial_guess`];
    /// further starts are drawn while the best RMSE exceeds `repeat_thresh`,
    /// at most `max_restarts` times. A search ends early once its RMSE drops
    /// below `rmse_thresh`.
    ///
    /// # Errors
    ///
    /// [`OpticsError::DegenerateBounds`] when some lower bound exceeds its
    /// upper bound, and [`OpticsError::InvalidParams`] without observed
    /// points. NaN bounds or start values give [`FitResult::invalid`].
    pub fn fit(
        &self,
        observed: &[Vector2<f64>],
        bounds: &PoseBounds,
        x0: Option<&EyePose>,
        rmse_thresh: f64,
        repeat_thresh: f64,
        max_restarts: usize,
    ) -> Result<FitResult, OpticsError> {
        if bounds.has_nan() || x0.is_some_and(|pose| pose.to_array().iter().any(|v| v.is_nan())) {
            warn!("NaN in bounds or start pose, returning an invalid fit");
            return Ok(FitResult::invalid());
        }
        let box_bounds = bounds.to_bounds()?;
        if observed.is_empty() {
            return Err(OpticsError::InvalidParams(
                "no observed points to fit".to_string(),
            ));
        }

        let underconstrained = bounds.is_underconstrained();
        if underconstrained {
            warn!("No rotation axis is pinned, the pose search is under-constrained");
        }

        let problem = Arc::new(PoseProblem {
            scene: self.scene.clone(),
            observed: observed.to_vec(),
            scale: self.settings.objective_scale,
        });
        let lm_settings = LmSettings {
            max_iterations: self.settings.max_iterations,
            fd_step: self.settings.fd_step,
            ..LmSettings::default()
        };

        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let mut start = match x0 {
            Some(pose) => bounds.clamp_with_headroom(pose, 0.0),
            None => initial_guess(self.scene, observed, bounds, self.grid, self.settings.headroom),
        };

        let mut best: Option<BestFit> = None;
        let mut restarts = 0;
        let mut evaluations = 0;
        loop {
            let mut observer = FitObserver::new(observed.len(), self.settings.objective_scale, rmse_thresh);
            let start_params = DVector::from_row_slice(&start.to_array());
            match minimize_bounded(Arc::clone(&problem), &box_bounds, &start_params, &lm_settings, &mut observer) {
                Some(summary) => evaluations += summary.evaluations,
                None => {
                    evaluations += 1;
                    warn!("Start pose {:?} cannot be projected", start.to_array());
                }
            }
            if let Some(candidate) = observer.best {
                if best.as_ref().map_or(true, |b| candidate.rmse < b.rmse) {
                    best = Some(candidate);
                }
            }

            let best_rmse = best.as_ref().map_or(f64::INFINITY, |b| b.rmse);
            if best_rmse <= repeat_thresh || restarts >= max_restarts {
                break;
            }
            restarts += 1;
            start = bounds.sample(&mut rng, self.settings.headroom);
            info!(
                "Restart {restarts}/{max_restarts}: best RMSE {best_rmse:.4} px above {repeat_thresh}, starting from {:?}",
                start.to_array()
            );
        }

        let Some(best) = best else {
            warn!("No candidate pose could be evaluated");
            return Ok(FitResult {
                restarts,
                evaluations,
                underconstrained,
                ..FitResult::invalid()
            });
        };

        let at_bound = (0..4).any(|i| {
            !bounds.is_pinned(i)
                && (best.params[i] - bounds.lower[i] < AT_BOUND_TOLERANCE
                    || bounds.upper[i] - best.params[i] < AT_BOUND_TOLERANCE)
        });
        let pose = EyePose::new(best.params[0], best.params[1], best.params[2], best.params[3]);
        info!(
            "Fitted pose {:?}, RMSE {:.4} px, {} restarts, {} evaluations",
            pose.to_array(),
            best.rmse,
            restarts,
            evaluations
        );
        Ok(FitResult {
            pose,
            rmse: best.rmse,
            ellipse: Some(best.ellipse),
            at_bound,
            restarts,
            evaluations,
            underconstrained,
            valid: true,
        })
    }
}

/// Fits a pose with default settings; see [`PoseFitter::fit`].
pub fn fit_pose(
    observed: &[Vector2<f64>],
    scene: &SceneGeometry,
    bounds: &PoseBounds,
    x0: Option<&EyePose>,
    rmse_thresh: f64,
    repeat_thresh: f64,
    max_restarts: usize,
) -> Result<FitResult, OpticsError> {
    PoseFitter::new(scene).fit(observed, bounds, x0, rmse_thresh, repeat_thresh, max_restarts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eye::EyeModel;
    use crate::scene::SceneConfig;
    use approx::assert_relative_eq;

    fn scene() -> SceneGeometry {
        let eye = EyeModel::load_from_yaml("samples/emmetropic_eye.yaml").unwrap();
        let config = SceneConfig::load_from_yaml("samples/scene.yaml").unwrap();
        SceneGeometry::new(eye, config).unwrap()
    }

    /// Points on the projected stop ellipse of `pose`.
    fn observe(scene: &SceneGeometry, pose: &EyePose) -> Vec<Vector2<f64>> {
        scene.project_pose(pose).unwrap().ellipse.sample(24)
    }

    #[test]
    fn test_recovers_pose() {
        let scene = scene();
        let truth = EyePose::new(12.0, -8.0, 0.0, 2.2);
        let observed = observe(&scene, &truth);

        let result = fit_pose(&observed, &scene, &PoseBounds::default(), None, 1e-3, 1e-2, 2).unwrap();
        assert!(result.valid);
        assert!(result.rmse < 1e-2);
        assert!(!result.at_bound);
        assert!(!result.underconstrained);
        assert_relative_eq!(result.pose.azimuth, truth.azimuth, epsilon = 1.0);
        assert_relative_eq!(result.pose.elevation, truth.elevation, epsilon = 1.0);
        assert_eq!(result.pose.torsion, 0.0);
        assert_relative_eq!(result.pose.stop_radius, truth.stop_radius, epsilon = 0.05);
    }

    #[test]
    fn test_recovers_poses_across_bounds() {
        let scene = scene();
        let truths = [
            EyePose::new(-30.0, 25.0, 0.0, 1.0),
            EyePose::new(30.0, -25.0, 0.0, 4.0),
            EyePose::new(-20.0, -15.0, 0.0, 3.0),
            EyePose::new(25.0, 20.0, 0.0, 1.5),
            EyePose::new(0.0, 0.0, 0.0, 2.5),
        ];
        for truth in truths {
            let observed = observe(&scene, &truth);
            let result = fit_pose(&observed, &scene, &PoseBounds::default(), None, 1e-3, 1e-2, 3).unwrap();
            assert!(result.valid, "{:?}", truth.to_array());
            assert!(result.rmse < 1e-2, "{:?}: rmse {}", truth.to_array(), result.rmse);
            assert_relative_eq!(result.pose.azimuth, truth.azimuth, epsilon = 1.0);
            assert_relative_eq!(result.pose.elevation, truth.elevation, epsilon = 1.0);
            assert_relative_eq!(result.pose.stop_radius, truth.stop_radius, epsilon = 0.05);
        }
    }

    #[test]
    fn test_unprojectable_start_recovers_through_restarts() {
        let scene = scene();
        let observed = observe(&scene, &EyePose::new(5.0, -5.0, 0.0, 2.5));
        let bounds = PoseBounds::new([-40.0, -35.0, 0.0, 0.5], [40.0, 35.0, 0.0, 8.8]);
        // Wider than the posterior cornea, so nothing reaches the camera.
        let start = EyePose::new(0.0, 0.0, 0.0, 8.5);
        assert!(scene.project_pose(&start).is_err());

        let result = fit_pose(&observed, &scene, &bounds, Some(&start), 1e-3, 1e-1, 8).unwrap();
        assert!(result.valid);
        assert!(result.restarts >= 1);
        assert!(result.rmse.is_finite());
    }

    #[test]
    fn test_solution_outside_bounds_lands_on_bound() {
        let scene = scene();
        let observed = observe(&scene, &EyePose::new(10.0, 0.0, 0.0, 2.0));
        let bounds = PoseBounds::new([-5.0, -5.0, 0.0, 0.5], [5.0, 5.0, 0.0, 4.5]);

        let result = fit_pose(&observed, &scene, &bounds, None, 1e-3, f64::INFINITY, 0).unwrap();
        assert!(result.valid);
        assert!(result.at_bound);
        assert_relative_eq!(result.pose.azimuth, 5.0, epsilon = AT_BOUND_TOLERANCE);
        assert!(result.pose.azimuth <= 5.0);
    }

    #[test]
    fn test_restarts_never_worsen_the_fit() {
        let scene = scene();
        let observed = observe(&scene, &EyePose::new(-15.0, 10.0, 0.0, 3.0));
        let start = EyePose::new(30.0, -25.0, 0.0, 1.0);
        let fitter = PoseFitter::new(&scene).with_settings(FitSettings {
            max_iterations: 2,
            ..FitSettings::default()
        });
        let bounds = PoseBounds::default();

        let single = fitter.fit(&observed, &bounds, Some(&start), 1e-6, 0.0, 0).unwrap();
        let restarted = fitter.fit(&observed, &bounds, Some(&start), 1e-6, 0.0, 3).unwrap();
        assert_eq!(single.restarts, 0);
        assert_eq!(restarted.restarts, 3);
        assert!(restarted.rmse <= single.rmse);
        assert!(restarted.evaluations > single.evaluations);
    }

    #[test]
    fn test_nan_inputs_give_invalid_result() {
        let scene = scene();
        let observed = observe(&scene, &EyePose::new(0.0, 0.0, 0.0, 2.0));
        let mut bounds = PoseBounds::default();
        bounds.lower[0] = f64::NAN;
        let result = fit_pose(&observed, &scene, &bounds, None, 1e-3, 1e-2, 1).unwrap();
        assert!(!result.valid);
        assert!(result.rmse.is_nan());

        let x0 = EyePose::new(0.0, f64::NAN, 0.0, 2.0);
        let result = fit_pose(&observed, &scene, &PoseBounds::default(), Some(&x0), 1e-3, 1e-2, 1).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_inverted_bounds_are_an_error() {
        let scene = scene();
        let observed = observe(&scene, &EyePose::new(0.0, 0.0, 0.0, 2.0));
        let bounds = PoseBounds::new([0.0, 0.0, 0.0, 3.0], [10.0, 10.0, 0.0, 1.0]);
        let result = fit_pose(&observed, &scene, &bounds, None, 1e-3, 1e-2, 1);
        assert!(matches!(result, Err(OpticsError::DegenerateBounds(_))));
    }

    #[test]
    fn test_free_torsion_is_flagged() {
        let scene = scene();
        let truth = EyePose::new(5.0, 5.0, 0.0, 2.0);
        let observed = observe(&scene, &truth);
        let bounds = PoseBounds::new([-20.0, -20.0, -10.0, 0.5], [20.0, 20.0, 10.0, 4.5]);
        let result = fit_pose(&observed, &scene, &bounds, Some(&truth), 1e-3, 1e-2, 0).unwrap();
        assert!(result.underconstrained);
        assert!(result.valid);
    }

    #[test]
    fn test_clamp_and_sample_respect_headroom() {
        let bounds = PoseBounds::default();
        let clamped = bounds.clamp_with_headroom(&EyePose::new(100.0, -100.0, 5.0, 0.0), 0.05);
        assert_relative_eq!(clamped.azimuth, 36.0, epsilon = 1e-12);
        assert_relative_eq!(clamped.elevation, -31.5, epsilon = 1e-12);
        assert_eq!(clamped.torsion, 0.0);
        assert_relative_eq!(clamped.stop_radius, 0.7, epsilon = 1e-12);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let pose = bounds.sample(&mut rng, 0.05);
            assert!(pose.azimuth.abs() <= 36.0);
            assert_eq!(pose.torsion, 0.0);
            assert!((0.7..=4.3).contains(&pose.stop_radius));
        }
    }
}
