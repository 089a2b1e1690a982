//! Ray/quadric intersection constrained by root side and bounding box.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::Quadric;

/// Roots closer than this behind the ray origin still count as forward hits,
/// so a ray that starts on a surface can re-intersect it at `t ≈ 0`.
pub const FORWARD_TOLERANCE: f64 = 1e-6;

/// Slack applied to bounding-box comparisons.
pub const BOUNDING_BOX_TOLERANCE: f64 = 1e-9;

/// A half-line `origin + t · direction` with unit `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ray {
    pub origin: Vector3<f64>,
    pub direction: Vector3<f64>,
}

impl Ray {
    /// Creates a ray, normalising `direction`.
    pub fn new(origin: Vector3<f64>, direction: Vector3<f64>) -> Self {
        Ray {
            origin,
            direction: direction.normalize(),
        }
    }

    /// Point at parameter `t`.
    pub fn at(&self, t: f64) -> Vector3<f64> {
        self.origin + self.direction * t
    }

    /// The same line travelled in the opposite direction from `origin`.
    pub fn reversed(&self) -> Self {
        Ray {
            origin: self.origin,
            direction: -self.direction,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.origin.iter().chain(self.direction.iter()).all(|v| v.is_finite())
            && self.direction.norm() > f64::EPSILON
    }
}

/// Which root of the ray/quadric quadratic is preferred.
///
/// `Positive` picks `(-b + √Δ) / 2a`, `Negative` picks `(-b − √Δ) / 2a`.
/// For ellipsoids (`a > 0`) these are the far and near crossings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Side {
    Negative,
    Positive,
}

impl Side {
    pub fn flipped(self) -> Self {
        match self {
            Side::Negative => Side::Positive,
            Side::Positive => Side::Negative,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Side::Negative => -1.0,
            Side::Positive => 1.0,
        }
    }
}

impl From<Side> for i8 {
    fn from(side: Side) -> Self {
        match side {
            Side::Negative => -1,
            Side::Positive => 1,
        }
    }
}

impl TryFrom<i8> for Side {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Side::Negative),
            1 => Ok(Side::Positive),
            other => Err(format!("side must be -1 or 1, got {other}")),
        }
    }
}

/// Axis-aligned box limiting where a surface physically exists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        BoundingBox { min, max }
    }

    /// Builds a box from the flat `[x_min, x_max, y_min, y_max, z_min, z_max]`
    /// layout.
    pub fn from_bounds(bounds: [f64; 6]) -> Self {
        BoundingBox {
            min: [bounds[0], bounds[2], bounds[4]],
            max: [bounds[1], bounds[3], bounds[5]],
        }
    }

    pub fn to_bounds(&self) -> [f64; 6] {
        [
            self.min[0],
            self.max[0],
            self.min[1],
            self.max[1],
            self.min[2],
            self.max[2],
        ]
    }

    /// A box with no limits.
    pub fn unbounded() -> Self {
        BoundingBox {
            min: [f64::NEG_INFINITY; 3],
            max: [f64::INFINITY; 3],
        }
    }

    pub fn contains(&self, point: &Vector3<f64>) -> bool {
        (0..3).all(|i| {
            point[i] >= self.min[i] - BOUNDING_BOX_TOLERANCE
                && point[i] <= self.max[i] + BOUNDING_BOX_TOLERANCE
        })
    }

    /// True when every `min` is at most the matching `max` and no bound is NaN.
    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.min[i] <= self.max[i])
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        BoundingBox::unbounded()
    }
}

impl Quadric {
    /// Intersects `ray` with the surface.
    ///
    /// The root selected by `side` is tried first; if its point lies outside
    /// `bounding_box` or behind the ray origin, the other root is tried.
    /// Returns the intersection point and its ray parameter, or `None` when
    /// the ray misses (negative discriminant or both roots rejected).
    pub fn intersect_ray(
        &self,
        ray: &Ray,
        side: Side,
        bounding_box: &BoundingBox,
    ) -> Option<(Vector3<f64>, f64)> {
        let q3 = self.quadratic_part();
        let p = ray.origin;
        let u = ray.direction;

        let a = u.dot(&(q3 * u));
        let b = 2.0 * u.dot(&(q3 * p + self.linear_part()));
        let c = self.evaluate(&p);

        let accept = |t: f64| -> Option<(Vector3<f64>, f64)> {
            if !t.is_finite() || t < -FORWARD_TOLERANCE {
                return None;
            }
            let point = ray.at(t);
            bounding_box.contains(&point).then_some((point, t))
        };

        let scale = q3.norm().max(self.linear_part().norm()).max(f64::MIN_POSITIVE);
        if a.abs() <= 1e-12 * scale {
            // Planar (or asymptotic) direction: the equation is linear.
            if b.abs() <= f64::EPSILON * scale {
                return None;
            }
            return accept(-c / b);
        }

        let discriminant = b * b - 4.0 * a * c;
        if discriminant < 0.0 {
            return None;
        }
        let root = discriminant.sqrt();
        let t_positive = (-b + root) / (2.0 * a);
        let t_negative = (-b - root) / (2.0 * a);
        let (preferred, other) = match side {
            Side::Positive => (t_positive, t_negative),
            Side::Negative => (t_negative, t_positive),
        };

        accept(preferred).or_else(|| accept(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sphere() -> Quadric {
        Quadric::ellipsoid(&Vector3::new(2.0, 2.0, 2.0), &Vector3::zeros())
    }

    #[test]
    fn test_side_selects_root() {
        let ray = Ray::new(Vector3::new(0.0, 0.0, -10.0), Vector3::new(0.0, 0.0, 1.0));
        let unbounded = BoundingBox::unbounded();

        let (near, t_near) = sphere()
            .intersect_ray(&ray, Side::Negative, &unbounded)
            .unwrap();
        assert_relative_eq!(near, Vector3::new(0.0, 0.0, -2.0), epsilon = 1e-12);
        assert_relative_eq!(t_near, 8.0, epsilon = 1e-12);

        let (far, _) = sphere()
            .intersect_ray(&ray, Side::Positive, &unbounded)
            .unwrap();
        assert_relative_eq!(far, Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_bounding_box_falls_back_to_other_root() {
        let ray = Ray::new(Vector3::new(0.0, 0.0, -10.0), Vector3::new(0.0, 0.0, 1.0));
        // Only the back half (z > 0) exists.
        let back_half = BoundingBox::new([-5.0, -5.0, 0.0], [5.0, 5.0, 5.0]);
        let (point, _) = sphere()
            .intersect_ray(&ray, Side::Negative, &back_half)
            .unwrap();
        assert_relative_eq!(point, Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-12);

        let tiny = BoundingBox::new([-5.0, -5.0, -1.0], [5.0, 5.0, 1.0]);
        assert!(sphere().intersect_ray(&ray, Side::Negative, &tiny).is_none());
    }

    #[test]
    fn test_miss_and_behind() {
        let unbounded = BoundingBox::unbounded();
        let miss = Ray::new(Vector3::new(0.0, 3.0, -10.0), Vector3::new(0.0, 0.0, 1.0));
        assert!(sphere().intersect_ray(&miss, Side::Negative, &unbounded).is_none());

        let away = Ray::new(Vector3::new(0.0, 0.0, -10.0), Vector3::new(0.0, 0.0, -1.0));
        assert!(sphere().intersect_ray(&away, Side::Negative, &unbounded).is_none());
    }

    #[test]
    fn test_ray_from_inside_exits() {
        let ray = Ray::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        let (point, t) = sphere()
            .intersect_ray(&ray, Side::Negative, &BoundingBox::unbounded())
            .unwrap();
        // The negative root is behind the origin, so the forward one is used.
        assert_relative_eq!(point, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(t, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_plane_intersection() {
        let plane = Quadric::plane(&Vector3::new(0.0, 0.0, 1.0), 1.5);
        let ray = Ray::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 1.0));
        let (point, _) = plane
            .intersect_ray(&ray, Side::Positive, &BoundingBox::unbounded())
            .unwrap();
        assert_relative_eq!(point, Vector3::new(1.5, 0.0, 1.5), epsilon = 1e-12);

        let parallel = Ray::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        assert!(plane
            .intersect_ray(&parallel, Side::Positive, &BoundingBox::unbounded())
            .is_none());
    }

    #[test]
    fn test_bounds_layout() {
        let bbox = BoundingBox::from_bounds([-1.0, 1.0, -2.0, 2.0, -3.0, 3.0]);
        assert_eq!(bbox.min, [-1.0, -2.0, -3.0]);
        assert_eq!(bbox.to_bounds(), [-1.0, 1.0, -2.0, 2.0, -3.0, 3.0]);
        assert!(bbox.contains(&Vector3::new(0.5, -1.5, 2.9)));
        assert!(!bbox.contains(&Vector3::new(1.5, 0.0, 0.0)));
    }

    #[test]
    fn test_side_round_trips_through_i8() {
        assert_eq!(Side::try_from(-1i8).unwrap(), Side::Negative);
        assert_eq!(i8::from(Side::Positive), 1);
        assert!(Side::try_from(0i8).is_err());
        assert_eq!(Side::Positive.flipped(), Side::Negative);
    }
}
