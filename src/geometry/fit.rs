//! Direct least-squares ellipse fitting (Fitzgibbon, Pilu and Fisher).
//!
//! The conic `A x² + B xy + C y² + D x + E y + F = 0` minimising the algebraic
//! error subject to `4AC − B² = 1` is found from a reduced 3×3 generalised
//! eigenproblem on Hartley-normalised points.

use nalgebra::{DMatrix, Matrix3, Vector2, Vector3, Vector6};

use super::{Conic, Ellipse};

/// Fewest points accepted by [`fit_ellipse`]. Five points determine a conic.
pub const MIN_FIT_POINTS: usize = 5;

/// Fits an ellipse to `points`.
///
/// Returns `None` with fewer than [`MIN_FIT_POINTS`] points, for degenerate
/// configurations (collinear points) or when the best conic is not a proper
/// ellipse.
///
/// # Examples
///
/// ```rust
/// use model_eye::geometry::{fit_ellipse, Ellipse};
///
/// let truth = Ellipse::new(320.0, 240.0, 40.0, 25.0, 0.4);
/// let fitted = fit_ellipse(&truth.sample(12)).unwrap();
/// assert!((fitted.semi_major - 40.0).abs() < 1e-6);
/// ```
pub fn fit_ellipse(points: &[Vector2<f64>]) -> Option<Ellipse> {
    fit_conic(points)?.to_ellipse()
}

/// Fits the conic coefficients; see [`fit_ellipse`].
pub fn fit_conic(points: &[Vector2<f64>]) -> Option<Conic> {
    let n = points.len();
    if n < MIN_FIT_POINTS || points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return None;
    }

    let (mean, scale) = normalization(points);

    let mut design = DMatrix::<f64>::zeros(n, 6);
    for (i, p) in points.iter().enumerate() {
        let x = (p.x - mean.x) * scale;
        let y = (p.y - mean.y) * scale;
        design[(i, 0)] = x * x;
        design[(i, 1)] = x * y;
        design[(i, 2)] = y * y;
        design[(i, 3)] = x;
        design[(i, 4)] = y;
        design[(i, 5)] = 1.0;
    }
    let scatter = design.transpose() * &design;

    let s11 = scatter.fixed_view::<3, 3>(0, 0).into_owned();
    let s12 = scatter.fixed_view::<3, 3>(0, 3).into_owned();
    let s22 = scatter.fixed_view::<3, 3>(3, 3).into_owned();
    let s22_inv = s22.try_inverse()?;

    let reduced = s11 - s12 * s22_inv * s12.transpose();
    // Inverse of the constraint matrix [[0 0 2] [0 -1 0] [2 0 0]].
    let constraint_inv = Matrix3::new(0.0, 0.0, 0.5, 0.0, -1.0, 0.0, 0.5, 0.0, 0.0);
    let quadratic = constrained_eigenvector(&(constraint_inv * reduced))?;
    let linear = -s22_inv * s12.transpose() * quadratic;

    let normalized = Vector6::new(
        quadratic[0],
        quadratic[1],
        quadratic[2],
        linear[0],
        linear[1],
        linear[2],
    );
    let conic = denormalize(&normalized, &mean, scale);
    conic.is_ellipse().then_some(conic)
}

/// Centroid and the scale that brings the mean centroid distance to √2.
fn normalization(points: &[Vector2<f64>]) -> (Vector2<f64>, f64) {
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let mean_distance = points.iter().map(|p| (p - mean).norm()).sum::<f64>() / n;
    let scale = if mean_distance > 1e-15 {
        std::f64::consts::SQRT_2 / mean_distance
    } else {
        1.0
    };
    (mean, scale)
}

/// Maps coefficients fitted in `x' = s (x − m)` coordinates back to pixels.
fn denormalize(c: &Vector6<f64>, mean: &Vector2<f64>, s: f64) -> Conic {
    let (mx, my) = (mean.x, mean.y);
    let s2 = s * s;
    let a = c[0] * s2;
    let b = c[1] * s2;
    let cc = c[2] * s2;
    let d = -2.0 * c[0] * s2 * mx - c[1] * s2 * my + c[3] * s;
    let e = -c[1] * s2 * mx - 2.0 * c[2] * s2 * my + c[4] * s;
    let f = c[0] * s2 * mx * mx + c[1] * s2 * mx * my + c[2] * s2 * my * my
        - c[3] * s * mx
        - c[4] * s * my
        + c[5];
    Conic::new([a, b, cc, d, e, f])
}

/// Eigenvector of `system` satisfying the ellipse constraint `4ac − b² > 0`.
///
/// Eigenvalues come from the characteristic cubic; each eigenvector is a row
/// of the adjugate of `system − λI`.
fn constrained_eigenvector(system: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let m = system;
    let trace = m.trace();
    let minors = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)] + m[(0, 0)] * m[(2, 2)]
        - m[(0, 2)] * m[(2, 0)]
        + m[(1, 1)] * m[(2, 2)]
        - m[(1, 2)] * m[(2, 1)];
    let det = m.determinant();

    let mut best: Option<(f64, Vector3<f64>)> = None;
    for eigenvalue in real_cubic_roots(-trace, minors, -det) {
        let Some(v) = null_vector(&(m - Matrix3::identity() * eigenvalue)) else {
            continue;
        };
        if 4.0 * v[0] * v[2] - v[1] * v[1] <= 0.0 {
            continue;
        }
        if best.map_or(true, |(value, _)| eigenvalue.abs() < value) {
            best = Some((eigenvalue.abs(), v));
        }
    }
    best.map(|(_, v)| v)
}

fn null_vector(m: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let rows = [
        m.row(1).transpose().cross(&m.row(2).transpose()),
        m.row(2).transpose().cross(&m.row(0).transpose()),
        m.row(0).transpose().cross(&m.row(1).transpose()),
    ];
    let best = rows
        .iter()
        .max_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))?;
    let norm = best.norm();
    (norm > 1e-300).then(|| best / norm)
}

/// Real roots of `x³ + b x² + c x + d`.
fn real_cubic_roots(b: f64, c: f64, d: f64) -> Vec<f64> {
    let p = c - b * b / 3.0;
    let q = 2.0 * b * b * b / 27.0 - b * c / 3.0 + d;
    let shift = -b / 3.0;
    let discriminant = -4.0 * p * p * p - 27.0 * q * q;

    if discriminant >= 0.0 {
        let r = (-p / 3.0).max(0.0).sqrt();
        let cos_arg = if r < 1e-15 {
            0.0
        } else {
            (-q / (2.0 * r * r * r)).clamp(-1.0, 1.0)
        };
        let theta = cos_arg.acos();
        (0..3)
            .map(|k| {
                2.0 * r * ((theta + 2.0 * std::f64::consts::PI * k as f64) / 3.0).cos() + shift
            })
            .collect()
    } else {
        let root = (q * q / 4.0 + p * p * p / 27.0).sqrt();
        vec![(-q / 2.0 + root).cbrt() + (-q / 2.0 - root).cbrt() + shift]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_recovers_ellipse() {
        let truth = Ellipse::new(310.0, 255.0, 42.0, 17.0, 0.3);
        let fitted = fit_ellipse(&truth.sample(30)).unwrap();
        assert_relative_eq!(fitted.center_x, 310.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.center_y, 255.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.semi_major, 42.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.semi_minor, 17.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.angle, 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_fit_with_five_points() {
        let truth = Ellipse::new(-4.0, 9.0, 6.0, 5.0, -1.0);
        let fitted = fit_ellipse(&truth.sample(5)).unwrap();
        assert_relative_eq!(fitted.semi_major, 6.0, epsilon = 1e-6);
        assert_relative_eq!(fitted.semi_minor, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_fit_rejects_degenerate_input() {
        assert!(fit_ellipse(&Ellipse::new(0.0, 0.0, 2.0, 1.0, 0.0).sample(4)).is_none());
        let collinear: Vec<_> = (0..8).map(|i| Vector2::new(i as f64, 2.0 * i as f64)).collect();
        assert!(fit_ellipse(&collinear).is_none());
    }

    #[test]
    fn test_circle_fit() {
        let points: Vec<_> = (0..16)
            .map(|i| {
                let t = i as f64 * std::f64::consts::PI / 8.0;
                Vector2::new(10.0 + 3.0 * t.cos(), -2.0 + 3.0 * t.sin())
            })
            .collect();
        let fitted = fit_ellipse(&points).unwrap();
        assert_relative_eq!(fitted.semi_major, 3.0, epsilon = 1e-9);
        assert_relative_eq!(fitted.semi_minor, 3.0, epsilon = 1e-9);
    }
}
