//! Ellipsoidal geodetic coordinates for a centred, axis-aligned ellipsoid.
//!
//! Latitude and longitude describe the direction of the surface normal at the
//! foot point (the point on the ellipsoid whose normal passes through the
//! query point); elevation is the signed distance along that normal.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

const MAX_ITERATIONS: usize = 20;
const PERTURBATION: f64 = 1e-6;
const STEP_TOLERANCE: f64 = 1e-13;

/// Position relative to an ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeodeticCoordinate {
    /// Degrees in `[-90, 90]`.
    pub latitude: f64,
    /// Degrees in `[-180, 180]`.
    pub longitude: f64,
    /// Signed distance from the surface, positive outside.
    pub elevation: f64,
}

fn radii_are_valid(radii: &Vector3<f64>) -> bool {
    radii.iter().all(|r| r.is_finite() && *r > 0.0)
}

/// Converts a Cartesian point to geodetic coordinates on the ellipsoid with
/// semi-axes `radii`.
///
/// The foot point is found by Newton iteration on the three conditions
/// "`X − X₀` is parallel to the normal at `X₀`" (two cross-product components)
/// and "`X₀` is on the ellipsoid". Coordinates of `point` smaller than `1e-6`
/// in magnitude are nudged away from zero while iterating, since the
/// cross-product conditions degenerate there, and the foot point is rescaled
/// afterwards.
///
/// Returns `None` for non-finite input or non-positive radii.
///
/// # Examples
///
/// ```rust
/// use nalgebra::Vector3;
/// use model_eye::quadric::{cartesian_to_geodetic, geodetic_to_cartesian};
///
/// let radii = Vector3::new(3.0, 4.0, 5.0);
/// let point = Vector3::new(1.0, 2.0, 6.0);
/// let geo = cartesian_to_geodetic(&point, &radii).unwrap();
/// let back = geodetic_to_cartesian(&geo, &radii).unwrap();
/// assert!((back - point).norm() < 1e-6);
/// ```
pub fn cartesian_to_geodetic(
    point: &Vector3<f64>,
    radii: &Vector3<f64>,
) -> Option<GeodeticCoordinate> {
    if !radii_are_valid(radii) || !point.iter().all(|v| v.is_finite()) {
        return None;
    }
    let (a2, b2, c2) = (radii.x * radii.x, radii.y * radii.y, radii.z * radii.z);

    let mut perturbed = [false; 3];
    let mut work = *point;
    for i in 0..3 {
        if work[i].abs() < PERTURBATION {
            work[i] = if work[i] < 0.0 { -PERTURBATION } else { PERTURBATION };
            perturbed[i] = true;
        }
    }
    let (x, y, z) = (work.x, work.y, work.z);

    let mut foot = radii.component_mul(&work) / work.norm();
    for _ in 0..MAX_ITERATIONS {
        let (x0, y0, z0) = (foot.x, foot.y, foot.z);
        let residual = Vector3::new(
            (x - x0) * y0 / b2 - (y - y0) * x0 / a2,
            (x - x0) * z0 / c2 - (z - z0) * x0 / a2,
            x0 * x0 / a2 + y0 * y0 / b2 + z0 * z0 / c2 - 1.0,
        );
        let jacobian = Matrix3::new(
            -y0 / b2 - (y - y0) / a2,
            (x - x0) / b2 + x0 / a2,
            0.0,
            -z0 / c2 - (z - z0) / a2,
            0.0,
            (x - x0) / c2 + x0 / a2,
            2.0 * x0 / a2,
            2.0 * y0 / b2,
            2.0 * z0 / c2,
        );
        let Some(step) = jacobian.lu().solve(&residual) else {
            break;
        };
        foot -= step;
        if step.norm() <= STEP_TOLERANCE * radii.max() {
            break;
        }
    }

    // Undo the nudge for foot coordinates that only followed it.
    for i in 0..3 {
        if perturbed[i] && foot[i].abs() < 1e-3 * radii[i] {
            foot[i] *= point[i] / work[i];
        }
    }
    let on_surface = (foot.x * foot.x / a2 + foot.y * foot.y / b2 + foot.z * foot.z / c2).sqrt();
    if !on_surface.is_finite() || on_surface <= 0.0 {
        return None;
    }
    foot /= on_surface;

    let normal = Vector3::new(foot.x / a2, foot.y / b2, foot.z / c2).normalize();
    let latitude = normal.z.atan2(normal.x.hypot(normal.y)).to_degrees();
    let longitude = normal.y.atan2(normal.x).to_degrees();
    let elevation = (point - foot).dot(&normal);

    Some(GeodeticCoordinate {
        latitude,
        longitude,
        elevation,
    })
}

/// Converts geodetic coordinates back to a Cartesian point. Closed form: the
/// foot point is recovered from the normal direction and offset by the
/// elevation along it.
pub fn geodetic_to_cartesian(
    coordinate: &GeodeticCoordinate,
    radii: &Vector3<f64>,
) -> Option<Vector3<f64>> {
    if !radii_are_valid(radii) {
        return None;
    }
    let lat = coordinate.latitude.to_radians();
    let lon = coordinate.longitude.to_radians();
    let normal = Vector3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin());

    let squared = radii.component_mul(radii);
    let k = squared.component_mul(&normal).dot(&normal).sqrt();
    let foot = squared.component_mul(&normal) / k;
    let point = foot + normal * coordinate.elevation;
    point.iter().all(|v| v.is_finite()).then_some(point)
}
