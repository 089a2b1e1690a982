//! Quadric surface algebra.
//!
//! A [`Quadric`] is the implicit second-degree surface
//!
//! ```text
//! A x² + B y² + C z² + 2D xy + 2E xz + 2F yz + 2G x + 2H y + 2I z + K = 0
//! ```
//!
//! stored as its 10 independent coefficients `[A B C D E F G H I K]`. The
//! equivalent symmetric 4×4 matrix in homogeneous coordinates is
//!
//! ```text
//! | A D E G |
//! | D B F H |
//! | E F C I |
//! | G H I K |
//! ```
//!
//! All transforms are pure and return a new quadric. Ray intersection lives in
//! [`intersect`] and ellipsoidal geodetic coordinates in [`geodetic`].

use nalgebra::{Matrix3, Matrix4, Rotation3, Vector3, Vector4};
use serde::{Deserialize, Serialize};

pub mod geodetic;
pub mod intersect;

pub use geodetic::{cartesian_to_geodetic, geodetic_to_cartesian, GeodeticCoordinate};
pub use intersect::{BoundingBox, Ray, Side};

/// Implicit second-degree surface in 10-coefficient form.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use model_eye::quadric::Quadric;
///
/// let sphere = Quadric::unit_sphere()
///     .scale(&Vector3::new(2.0, 2.0, 2.0))
///     .translate(&Vector3::new(0.0, 0.0, 5.0));
/// assert!(sphere.evaluate(&Vector3::new(0.0, 0.0, 7.0)).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quadric {
    coefficients: [f64; 10],
}

impl Quadric {
    /// Creates a quadric from its coefficients `[A B C D E F G H I K]`.
    pub fn new(coefficients: [f64; 10]) -> Self {
        Quadric { coefficients }
    }

    /// Builds a quadric from a 4×4 matrix. Only the upper triangle is read,
    /// so non-symmetric input is symmetrised implicitly.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        Quadric {
            coefficients: [
                m[(0, 0)],
                m[(1, 1)],
                m[(2, 2)],
                m[(0, 1)],
                m[(0, 2)],
                m[(1, 2)],
                m[(0, 3)],
                m[(1, 3)],
                m[(2, 3)],
                m[(3, 3)],
            ],
        }
    }

    /// The unit sphere `x² + y² + z² − 1 = 0`.
    pub fn unit_sphere() -> Self {
        Quadric::new([1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0])
    }

    /// The unit two-sheet hyperboloid `x² − y² − z² − 1 = 0`, opening along x.
    pub fn unit_two_sheet_hyperboloid() -> Self {
        Quadric::new([1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0])
    }

    /// Axis-aligned ellipsoid with the given semi-axes, centred at `center`.
    pub fn ellipsoid(radii: &Vector3<f64>, center: &Vector3<f64>) -> Self {
        Quadric::unit_sphere().scale(radii).translate(center)
    }

    /// The plane `normal · x = offset`.
    ///
    /// This is a degenerate quadric (zero quadratic part); intersection falls
    /// back to the linear solution for it.
    pub fn plane(normal: &Vector3<f64>, offset: f64) -> Self {
        let n = normal.normalize();
        Quadric::new([
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
            0.5 * n.x,
            0.5 * n.y,
            0.5 * n.z,
            -offset,
        ])
    }

    pub fn coefficients(&self) -> &[f64; 10] {
        &self.coefficients
    }

    /// Returns the symmetric 4×4 matrix form.
    pub fn matrix(&self) -> Matrix4<f64> {
        let [a, b, c, d, e, f, g, h, i, k] = self.coefficients;
        Matrix4::new(a, d, e, g, d, b, f, h, e, f, c, i, g, h, i, k)
    }

    /// Upper-left 3×3 block (the quadratic part).
    pub fn quadratic_part(&self) -> Matrix3<f64> {
        let [a, b, c, d, e, f, ..] = self.coefficients;
        Matrix3::new(a, d, e, d, b, f, e, f, c)
    }

    /// Linear part `[G H I]`.
    pub fn linear_part(&self) -> Vector3<f64> {
        Vector3::new(
            self.coefficients[6],
            self.coefficients[7],
            self.coefficients[8],
        )
    }

    /// Scales the surface by `factors` along x, y and z.
    pub fn scale(&self, factors: &Vector3<f64>) -> Self {
        let inverse = Matrix4::from_diagonal(&Vector4::new(
            1.0 / factors.x,
            1.0 / factors.y,
            1.0 / factors.z,
            1.0,
        ));
        self.transformed(&inverse)
    }

    /// Rotates the surface about the origin. Angles are degrees about the x,
    /// y and z axes, composed as `Rz · Ry · Rx`.
    pub fn rotate(&self, euler_deg: &Vector3<f64>) -> Self {
        let rotation = euler_rotation(euler_deg);
        let mut inverse = Matrix4::identity();
        inverse
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&rotation.matrix().transpose());
        self.transformed(&inverse)
    }

    /// Translates the surface by `offset`.
    pub fn translate(&self, offset: &Vector3<f64>) -> Self {
        let mut inverse = Matrix4::identity();
        inverse.fixed_view_mut::<3, 1>(0, 3).copy_from(&(-offset));
        self.transformed(&inverse)
    }

    /// Applies the point transform whose inverse is `inverse`:
    /// `Q' = T⁻ᵀ Q T⁻¹`.
    fn transformed(&self, inverse: &Matrix4<f64>) -> Self {
        Quadric::from_matrix(&(inverse.transpose() * self.matrix() * inverse))
    }

    /// Value of the implicit function at `point`. Zero on the surface,
    /// negative inside a (positively normalised) ellipsoid.
    pub fn evaluate(&self, point: &Vector3<f64>) -> f64 {
        let h = point.push(1.0);
        h.dot(&(self.matrix() * h))
    }

    /// True where the implicit function is negative.
    pub fn is_inside(&self, point: &Vector3<f64>) -> bool {
        self.evaluate(point) < 0.0
    }

    /// Gradient of the implicit function at `point`.
    pub fn gradient(&self, point: &Vector3<f64>) -> Vector3<f64> {
        2.0 * (self.quadratic_part() * point + self.linear_part())
    }

    /// Unit surface normal at `point`, oriented against `incident` so that
    /// `normal · incident ≤ 0`. Returns `None` where the gradient vanishes.
    pub fn normal_at(&self, point: &Vector3<f64>, incident: &Vector3<f64>) -> Option<Vector3<f64>> {
        let gradient = self.gradient(point);
        let norm = gradient.norm();
        if !norm.is_finite() || norm < f64::EPSILON {
            return None;
        }
        let normal = gradient / norm;
        if normal.dot(incident) > 0.0 {
            Some(-normal)
        } else {
            Some(normal)
        }
    }

    /// True when every coefficient is finite.
    pub fn is_finite(&self) -> bool {
        self.coefficients.iter().all(|c| c.is_finite())
    }
}

/// Rotation matrix `Rz · Ry · Rx` from angles in degrees about x, y and z.
pub fn euler_rotation(euler_deg: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::from_euler_angles(
        euler_deg.x.to_radians(),
        euler_deg.y.to_radians(),
        euler_deg.z.to_radians(),
    )
}
