//! Bounded nonlinear least squares and eye pose estimation.
//!
//! [`minimize_bounded`] runs `tiny_solver`'s Levenberg-Marquardt optimizer on
//! problems that implement [`LeastSquaresProblem`]. The forward models here
//! are plain `f64` code, so each problem is wrapped in a factor that
//! linearises it with a finite-difference Jacobian. Box constraints go to the
//! solver as variable bounds and pinned parameters are fixed. The solver runs
//! a few iterations per round; after each round an [`IterationObserver`]
//! owned by the caller sees the new iterate and may stop the search.
//!
//! The pose estimator in [`pose_fit`] builds on it, with start points from
//! [`initial_guess`] and the precomputed [`grid`].

use log::debug;
use nalgebra::{DMatrix, DVector, RealField};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer, OptimizerOptions};

use crate::optics::OpticsError;

pub mod grid;
pub mod initial_guess;
pub mod pose_fit;

pub use grid::{GridEntry, PoseGrid};
pub use initial_guess::initial_guess;
pub use pose_fit::{fit_pose, FitResult, FitSettings, PoseBounds, PoseFitter};

/// Residuals of one evaluation plus whatever the problem wants observers to
/// see alongside them.
#[derive(Debug, Clone)]
pub struct Evaluation<T> {
    pub residuals: DVector<f64>,
    pub output: T,
}

impl<T> Evaluation<T> {
    /// Sum of squared residuals.
    pub fn cost(&self) -> f64 {
        self.residuals.norm_squared()
    }
}

pub trait LeastSquaresProblem {
    type Output;

    /// Evaluates the residuals at `params`; `None` marks an invalid point.
    fn evaluate(&self, params: &DVector<f64>) -> Option<Evaluation<Self::Output>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    Continue,
    Stop,
}

/// Sees every accepted iterate, including the starting point.
pub trait IterationObserver<T> {
    fn observe(&mut self, iteration: usize, params: &DVector<f64>, cost: f64, output: &T) -> ObserverAction;
}

/// Box constraints. A parameter with equal bounds is pinned.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl Bounds {
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> Result<Self, OpticsError> {
        if lower.len() != upper.len() {
            return Err(OpticsError::InvalidParams(format!(
                "bounds have {} lower and {} upper values",
                lower.len(),
                upper.len()
            )));
        }
        if let Some(i) = (0..lower.len()).find(|&i| !(lower[i] <= upper[i])) {
            return Err(OpticsError::DegenerateBounds(format!(
                "parameter {i}: lower {} exceeds upper {}",
                lower[i], upper[i]
            )));
        }
        Ok(Bounds { lower, upper })
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn is_pinned(&self, i: usize) -> bool {
        self.lower[i] == self.upper[i]
    }

    pub fn project(&self, params: &DVector<f64>) -> DVector<f64> {
        params.zip_zip_map(&self.lower, &self.upper, |x, lo, hi| x.clamp(lo, hi))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmSettings {
    /// Total solver iteration limit.
    pub max_iterations: usize,
    /// Solver iterations between observer calls.
    pub iterations_per_round: usize,
    /// Finite-difference step relative to `max(|x|, 1)`.
    pub fd_step: f64,
    /// Relative cost decrease below which the search has converged.
    pub cost_tolerance: f64,
}

impl Default for LmSettings {
    fn default() -> Self {
        LmSettings {
            max_iterations: 50,
            iterations_per_round: 2,
            fd_step: 1e-4,
            cost_tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// A round no longer lowered the cost enough.
    Converged,
    MaxIterations,
    /// The solver returned no parameters.
    Stalled,
    Observer,
}

#[derive(Debug, Clone)]
pub struct LmSummary {
    pub params: DVector<f64>,
    pub cost: f64,
    /// Solver iterations spent.
    pub iterations: usize,
    /// Forward model evaluations, finite differences included.
    pub evaluations: usize,
    pub termination: Termination,
}

const PARAMS_KEY: &str = "params";

/// Smallest residual reported for points the problem cannot evaluate.
const INVALID_RESIDUAL: f64 = 1e6;

/// Forward-difference Jacobian, switching to backward differences where the
/// forward step would leave the box. Pinned parameters get a zero column.
fn jacobian<P: LeastSquaresProblem>(
    problem: &P,
    bounds: &Bounds,
    params: &DVector<f64>,
    residuals: &DVector<f64>,
    fd_step: f64,
    evaluations: &AtomicUsize,
) -> DMatrix<f64> {
    let mut jacobian = DMatrix::zeros(residuals.len(), params.len());
    for j in 0..params.len() {
        if bounds.is_pinned(j) {
            continue;
        }
        let h = fd_step * params[j].abs().max(1.0);
        let steps = if params[j] + h <= bounds.upper[j] { [h, -h] } else { [-h, h] };
        for step in steps {
            let mut shifted = params.clone();
            shifted[j] += step;
            if shifted[j] < bounds.lower[j] || shifted[j] > bounds.upper[j] {
                continue;
            }
            evaluations.fetch_add(1, Ordering::Relaxed);
            if let Some(evaluation) = problem.evaluate(&shifted) {
                if evaluation.residuals.len() == residuals.len() {
                    jacobian.set_column(j, &((evaluation.residuals - residuals) / step));
                    break;
                }
            }
        }
    }
    jacobian
}

#[derive(Debug, Clone)]
struct Linearization {
    params: DVector<f64>,
    residuals: DVector<f64>,
    jacobian: DMatrix<f64>,
}

/// Presents a [`LeastSquaresProblem`] to `tiny_solver` as a single factor.
///
/// Residuals are expanded to first order around the real part of the
/// parameters, so dual-number evaluations carry the finite-difference
/// Jacobian. Points the problem cannot evaluate get a constant residual of
/// `penalty` with a zero Jacobian.
struct NumericFactor<P> {
    problem: Arc<P>,
    bounds: Bounds,
    fd_step: f64,
    num_residuals: usize,
    penalty: f64,
    evaluations: Arc<AtomicUsize>,
    last: Mutex<Option<Linearization>>,
}

impl<P: LeastSquaresProblem> NumericFactor<P> {
    fn linearize(&self, params: &DVector<f64>) -> Linearization {
        if let Ok(last) = self.last.lock() {
            if let Some(cached) = last.as_ref().filter(|l| l.params == *params) {
                return cached.clone();
            }
        }

        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let linearization = match self.problem.evaluate(params) {
            Some(evaluation) if evaluation.residuals.len() == self.num_residuals => Linearization {
                params: params.clone(),
                jacobian: jacobian(
                    self.problem.as_ref(),
                    &self.bounds,
                    params,
                    &evaluation.residuals,
                    self.fd_step,
                    &self.evaluations,
                ),
                residuals: evaluation.residuals,
            },
            _ => Linearization {
                params: params.clone(),
                residuals: DVector::from_element(self.num_residuals, self.penalty),
                jacobian: DMatrix::zeros(self.num_residuals, params.len()),
            },
        };

        if let Ok(mut last) = self.last.lock() {
            *last = Some(linearization.clone());
        }
        linearization
    }
}

impl<P, T> Factor<T> for NumericFactor<P>
where
    P: LeastSquaresProblem + Send + Sync,
    T: RealField,
{
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let values = &params[0];
        let x: DVector<f64> = values.map(|v| -> f64 { v.to_subset_unchecked() });
        let linearization = self.linearize(&x);

        let dx: Vec<T> = (0..x.len())
            .map(|j| values[j].clone() - nalgebra::convert::<f64, T>(x[j]))
            .collect();
        DVector::from_fn(linearization.residuals.len(), |i, _| {
            dx.iter().enumerate().fold(
                nalgebra::convert::<f64, T>(linearization.residuals[i]),
                |acc, (j, d)| acc + nalgebra::convert::<f64, T>(linearization.jacobian[(i, j)]) * d.clone(),
            )
        })
    }
}

/// Minimises the sum of squared residuals of `problem` inside `bounds`,
/// starting from `start` projected into the box.
///
/// Only rounds that lower the cost are accepted, so an invalid point is
/// never returned. Returns `None` when the start point cannot be evaluated.
pub fn minimize_bounded<P, O>(
    problem: Arc<P>,
    bounds: &Bounds,
    start: &DVector<f64>,
    settings: &LmSettings,
    observer: &mut O,
) -> Option<LmSummary>
where
    P: LeastSquaresProblem + Send + Sync + 'static,
    O: IterationObserver<P::Output>,
{
    let mut params = bounds.project(start);
    let evaluations = Arc::new(AtomicUsize::new(1));
    let first = problem.evaluate(&params)?;
    let mut cost = first.cost();

    let summary = |params: DVector<f64>, cost, iterations, termination| LmSummary {
        params,
        cost,
        iterations,
        evaluations: evaluations.load(Ordering::Relaxed),
        termination,
    };

    if observer.observe(0, &params, cost, &first.output) == ObserverAction::Stop {
        return Some(summary(params, cost, 0, Termination::Observer));
    }

    let factor = NumericFactor {
        problem: Arc::clone(&problem),
        bounds: bounds.clone(),
        fd_step: settings.fd_step,
        num_residuals: first.residuals.len(),
        penalty: (10.0 * first.residuals.norm()).max(INVALID_RESIDUAL),
        evaluations: Arc::clone(&evaluations),
        last: Mutex::new(None),
    };
    let mut solver_problem = tiny_solver::Problem::new();
    solver_problem.add_residual_block(first.residuals.len(), &[PARAMS_KEY], Box::new(factor), None);
    for i in 0..bounds.len() {
        if bounds.is_pinned(i) {
            solver_problem.fix_variable(PARAMS_KEY, i);
        } else {
            solver_problem.set_variable_bounds(PARAMS_KEY, i, bounds.lower[i], bounds.upper[i]);
        }
    }
    let optimizer = LevenbergMarquardtOptimizer::default();
    let per_round = settings.iterations_per_round.max(1);

    let mut iterations = 0;
    let mut round = 0;
    while iterations < settings.max_iterations {
        let budget = per_round.min(settings.max_iterations - iterations);
        iterations += budget;
        round += 1;

        let options = OptimizerOptions {
            max_iteration: budget,
            verbosity_level: 0,
            ..Default::default()
        };
        let mut initial_values = HashMap::new();
        initial_values.insert(PARAMS_KEY.to_string(), params.clone());
        let next = optimizer
            .optimize(&solver_problem, &initial_values, Some(options))
            .and_then(|mut result| result.remove(PARAMS_KEY))
            .filter(|next| next.len() == params.len())
            .map(|next| bounds.project(&next));
        let Some(next) = next else {
            debug!("LM round {round} returned no parameters");
            return Some(summary(params, cost, iterations, Termination::Stalled));
        };

        evaluations.fetch_add(1, Ordering::Relaxed);
        let evaluation = match problem.evaluate(&next) {
            Some(evaluation) if evaluation.cost() < cost => evaluation,
            _ => return Some(summary(params, cost, iterations, Termination::Converged)),
        };

        let new_cost = evaluation.cost();
        let decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
        debug!("LM round {round} ({iterations} iterations): cost {new_cost:.6e}");
        params = next;
        cost = new_cost;

        if observer.observe(round, &params, cost, &evaluation.output) == ObserverAction::Stop {
            return Some(summary(params, cost, iterations, Termination::Observer));
        }
        if decrease < settings.cost_tolerance {
            return Some(summary(params, cost, iterations, Termination::Converged));
        }
    }

    Some(summary(params, cost, iterations, Termination::MaxIterations))
}
