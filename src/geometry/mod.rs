//! Image-plane ellipse geometry.
//!
//! The projected aperture stop is summarised by an [`Ellipse`]; observed
//! boundary points are compared against it with the orthogonal point-to-ellipse
//! distance.

use nalgebra::{Matrix3, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

pub mod fit;

pub use fit::{fit_conic, fit_ellipse, MIN_FIT_POINTS};

/// General conic `A x² + B xy + C y² + D x + E y + F = 0`, stored as
/// `[A, B, C, D, E, F]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conic {
    pub coefficients: [f64; 6],
}

impl Conic {
    pub fn new(coefficients: [f64; 6]) -> Self {
        Conic { coefficients }
    }

    pub fn is_ellipse(&self) -> bool {
        let [a, b, c, ..] = self.coefficients;
        b * b - 4.0 * a * c < 0.0
    }

    /// Converts to centre/axes/angle form. `None` unless the conic is a real,
    /// non-degenerate ellipse.
    pub fn to_ellipse(&self) -> Option<Ellipse> {
        let norm = self.coefficients.iter().map(|c| c * c).sum::<f64>().sqrt();
        if !norm.is_finite() || norm < f64::MIN_POSITIVE || !self.is_ellipse() {
            return None;
        }
        let [a, b, c, d, e, f] = self.coefficients.map(|v| v / norm);

        let matrix = Matrix3::new(a, b / 2.0, d / 2.0, b / 2.0, c, e / 2.0, d / 2.0, e / 2.0, f);
        if matrix.determinant().abs() < 1e-18 {
            return None;
        }

        let denom = 4.0 * a * c - b * b;
        let cx = (b * e - 2.0 * c * d) / denom;
        let cy = (b * d - 2.0 * a * e) / denom;

        let angle = if (a - c).abs() < 1e-15 && b.abs() < 1e-15 {
            0.0
        } else {
            0.5 * b.atan2(a - c)
        };

        let sum = a + c;
        let diff = ((a - c).powi(2) + b * b).sqrt();
        let lambda1 = (sum + diff) / 2.0;
        let lambda2 = (sum - diff) / 2.0;
        let f_center = a * cx * cx + b * cx * cy + c * cy * cy + d * cx + e * cy + f;

        let first = -f_center / lambda1;
        let second = -f_center / lambda2;
        if !(first > 0.0 && second > 0.0) {
            return None;
        }
        let (first, second) = (first.sqrt(), second.sqrt());

        let ellipse = if first >= second {
            Ellipse::new(cx, cy, first, second, angle)
        } else {
            Ellipse::new(cx, cy, second, first, angle + FRAC_PI_2)
        };
        ellipse.is_valid().then_some(ellipse)
    }
}

/// Ellipse in centre/axes form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    pub center_x: f64,
    pub center_y: f64,
    pub semi_major: f64,
    pub semi_minor: f64,
    /// Angle of the major axis from +x in radians, in `(−π/2, π/2]`.
    pub angle: f64,
}

impl Ellipse {
    /// Creates an ellipse. The angle is wrapped into `(−π/2, π/2]`; the axes
    /// are taken as given.
    pub fn new(center_x: f64, center_y: f64, semi_major: f64, semi_minor: f64, angle: f64) -> Self {
        Ellipse {
            center_x,
            center_y,
            semi_major,
            semi_minor,
            angle: wrap_half_turn(angle),
        }
    }

    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(self.center_x, self.center_y)
    }

    pub fn area(&self) -> f64 {
        PI * self.semi_major * self.semi_minor
    }

    /// `sqrt(1 − b²/a²)`.
    pub fn eccentricity(&self) -> f64 {
        (1.0 - (self.semi_minor / self.semi_major).powi(2)).max(0.0).sqrt()
    }

    pub fn is_valid(&self) -> bool {
        self.semi_major > 0.0
            && self.semi_minor > 0.0
            && [
                self.center_x,
                self.center_y,
                self.semi_major,
                self.semi_minor,
                self.angle,
            ]
            .iter()
            .all(|v| v.is_finite())
    }

    pub fn to_conic(&self) -> Conic {
        let (sin, cos) = self.angle.sin_cos();
        let a2 = self.semi_major * self.semi_major;
        let b2 = self.semi_minor * self.semi_minor;
        let ca = cos * cos / a2 + sin * sin / b2;
        let cb = 2.0 * cos * sin * (1.0 / a2 - 1.0 / b2);
        let cc = sin * sin / a2 + cos * cos / b2;
        let (x0, y0) = (self.center_x, self.center_y);
        Conic::new([
            ca,
            cb,
            cc,
            -2.0 * ca * x0 - cb * y0,
            -cb * x0 - 2.0 * cc * y0,
            ca * x0 * x0 + cb * x0 * y0 + cc * y0 * y0 - 1.0,
        ])
    }

    /// `n` points evenly spaced in the parametric angle.
    pub fn sample(&self, n: usize) -> Vec<Vector2<f64>> {
        let (sin, cos) = self.angle.sin_cos();
        (0..n)
            .map(|i| {
                let t = 2.0 * PI * i as f64 / n as f64;
                let u = self.semi_major * t.cos();
                let v = self.semi_minor * t.sin();
                Vector2::new(
                    self.center_x + cos * u - sin * v,
                    self.center_y + sin * u + cos * v,
                )
            })
            .collect()
    }

    /// Euclidean distance from `point` to the nearest point on the ellipse.
    ///
    /// Works in the ellipse frame, reflected into the first quadrant, and
    /// bisects the Lagrange-multiplier equation for the closest point.
    pub fn distance(&self, point: &Vector2<f64>) -> f64 {
        let (sin, cos) = self.angle.sin_cos();
        let dx = point.x - self.center_x;
        let dy = point.y - self.center_y;
        let y0 = (cos * dx + sin * dy).abs();
        let y1 = (-sin * dx + cos * dy).abs();
        let (e0, e1) = (self.semi_major, self.semi_minor);

        if y1 > 0.0 {
            if y0 > 0.0 {
                let z0 = y0 / e0;
                let z1 = y1 / e1;
                let g = z0 * z0 + z1 * z1 - 1.0;
                if g == 0.0 {
                    return 0.0;
                }
                let r0 = (e0 / e1).powi(2);
                let s = bisect_root(r0, z0, z1, g);
                let x0 = r0 * y0 / (s + r0);
                let x1 = y1 / (s + 1.0);
                return (x0 - y0).hypot(x1 - y1);
            }
            return (y1 - e1).abs();
        }

        let numer = e0 * y0;
        let denom = e0 * e0 - e1 * e1;
        if numer < denom {
            let ratio = numer / denom;
            let x0 = e0 * ratio;
            let x1 = e1 * (1.0 - ratio * ratio).max(0.0).sqrt();
            (x0 - y0).hypot(x1)
        } else {
            (y0 - e0).abs()
        }
    }
}

fn bisect_root(r0: f64, z0: f64, z1: f64, g: f64) -> f64 {
    let n0 = r0 * z0;
    let mut s0 = z1 - 1.0;
    let mut s1 = if g < 0.0 { 0.0 } else { n0.hypot(z1) - 1.0 };
    let mut s = 0.0;
    for _ in 0..200 {
        s = 0.5 * (s0 + s1);
        if s == s0 || s == s1 {
            break;
        }
        let ratio0 = n0 / (s + r0);
        let ratio1 = z1 / (s + 1.0);
        let value = ratio0 * ratio0 + ratio1 * ratio1 - 1.0;
        if value > 0.0 {
            s0 = s;
        } else if value < 0.0 {
            s1 = s;
        } else {
            break;
        }
    }
    s
}

fn wrap_half_turn(mut angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    angle %= PI;
    if angle > FRAC_PI_2 {
        angle -= PI;
    } else if angle <= -FRAC_PI_2 {
        angle += PI;
    }
    angle
}

/// Summary statistics of a set of non-negative residuals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualStats {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ResidualStats {
    /// `None` for an empty slice or any non-finite residual.
    pub fn from_residuals(residuals: &[f64]) -> Option<Self> {
        if residuals.is_empty() || residuals.iter().any(|r| !r.is_finite()) {
            return None;
        }
        let n = residuals.len() as f64;
        let mean = residuals.iter().sum::<f64>() / n;
        let variance = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let rmse = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
        let min = residuals.iter().copied().fold(f64::INFINITY, f64::min);
        let max = residuals.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut sorted = residuals.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(ResidualStats {
            rmse,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
            median,
        })
    }
}

/// Orthogonal distances from each of `points` to `ellipse`.
pub fn distances_to_ellipse(ellipse: &Ellipse, points: &[Vector2<f64>]) -> Vec<f64> {
    points.iter().map(|p| ellipse.distance(p)).collect()
}

/// Root mean square of the orthogonal distances; `NaN` for no points.
pub fn rms_distance(ellipse: &Ellipse, points: &[Vector2<f64>]) -> f64 {
    if points.is_empty() {
        return f64::NAN;
    }
    let sum: f64 = points.iter().map(|p| ellipse.distance(p).powi(2)).sum();
    (sum / points.len() as f64).sqrt()
}
