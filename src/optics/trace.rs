//! Sequential ray propagation.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{Interaction, OpticalSystem};
use crate::quadric::Ray;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("Ray has a non-finite origin or a zero direction")]
    InvalidRay,
    #[error("Ray missed mandatory surface {surface} ({label})")]
    MandatorySurfaceMissed { surface: usize, label: String },
    #[error("Total internal reflection at surface {surface} ({label})")]
    TotalInternalReflection { surface: usize, label: String },
    #[error("Surface normal is undefined at the hit on surface {surface} ({label})")]
    DegenerateNormal { surface: usize, label: String },
}

/// Points visited by one ray, starting with its origin, and the direction it
/// leaves each point with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RayPath {
    pub points: Vec<Vector3<f64>>,
    pub directions: Vec<Vector3<f64>>,
}

impl RayPath {
    fn start(ray: &Ray) -> Self {
        RayPath {
            points: vec![ray.origin],
            directions: vec![ray.direction],
        }
    }

    fn push(&mut self, point: Vector3<f64>, direction: Vector3<f64>) {
        self.points.push(point);
        self.directions.push(direction);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Refracts unit `direction` at a surface with unit `normal` facing the
/// incoming ray (`normal · direction ≤ 0`). `eta` is `n_in / n_out`.
/// Returns `None` on total internal reflection.
pub fn refract(direction: &Vector3<f64>, normal: &Vector3<f64>, eta: f64) -> Option<Vector3<f64>> {
    let cos_i = -normal.dot(direction);
    let k = 1.0 - eta * eta * (1.0 - cos_i * cos_i);
    if k < 0.0 {
        return None;
    }
    Some((direction * eta + normal * (eta * cos_i - k.sqrt())).normalize())
}

/// Mirror reflection of `direction` about `normal`.
pub fn reflect(direction: &Vector3<f64>, normal: &Vector3<f64>) -> Vector3<f64> {
    (direction - normal * (2.0 * direction.dot(normal))).normalize()
}

/// Traces `ray` through `system`, returning the path walked so far alongside
/// the outcome. On failure the path ends at the last surface reached.
pub fn trace_with_path(ray: &Ray, system: &OpticalSystem) -> (RayPath, Result<Ray, TraceError>) {
    if !ray.is_finite() {
        return (RayPath::default(), Err(TraceError::InvalidRay));
    }
    let mut current = Ray::new(ray.origin, ray.direction);
    let mut path = RayPath::start(&current);
    let mut index = system.initial_index();

    for (i, surface) in system.surfaces().iter().enumerate() {
        let hit = surface
            .quadric
            .intersect_ray(&current, surface.side, &surface.bounding_box);
        let Some((point, _)) = hit else {
            if surface.mandatory {
                let error = TraceError::MandatorySurfaceMissed {
                    surface: i,
                    label: surface.label.clone(),
                };
                return (path, Err(error));
            }
            continue;
        };

        let Some(normal) = surface.quadric.normal_at(&point, &current.direction) else {
            let error = TraceError::DegenerateNormal {
                surface: i,
                label: surface.label.clone(),
            };
            return (path, Err(error));
        };

        let direction = match surface.interaction {
            Interaction::Reflect => reflect(&current.direction, &normal),
            Interaction::Refract => {
                match refract(&current.direction, &normal, index / surface.refractive_index) {
                    Some(direction) => direction,
                    None => {
                        path.push(point, current.direction);
                        let error = TraceError::TotalInternalReflection {
                            surface: i,
                            label: surface.label.clone(),
                        };
                        return (path, Err(error));
                    }
                }
            }
        };

        index = surface.refractive_index;
        current = Ray {
            origin: point,
            direction,
        };
        path.push(point, direction);
    }

    (path, Ok(current))
}

/// Traces `ray` through `system`. The output ray starts at the last
/// intersection and carries the final direction.
pub fn trace(ray: &Ray, system: &OpticalSystem) -> Result<(Ray, RayPath), TraceError> {
    let (path, outcome) = trace_with_path(ray, system);
    outcome.map(|output| (output, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optics::SurfaceRecord;
    use crate::quadric::{BoundingBox, Quadric, Side};
    use approx::assert_relative_eq;

    fn plane_system(n_in: f64, n_out: f64) -> OpticalSystem {
        let plane = Quadric::plane(&Vector3::new(0.0, 0.0, 1.0), 0.0);
        OpticalSystem::new(
            n_in,
            vec![SurfaceRecord::refracting(
                "interface",
                plane,
                Side::Positive,
                BoundingBox::unbounded(),
                true,
                n_out,
            )],
        )
        .unwrap()
    }

    fn lens_system() -> OpticalSystem {
        // Biconvex lens spanning z = -2 to z = 4, then an ellipsoidal cap.
        let front = Quadric::ellipsoid(&Vector3::new(10.0, 10.0, 10.0), &Vector3::new(0.0, 0.0, 8.0));
        let back = Quadric::ellipsoid(&Vector3::new(12.0, 12.0, 12.0), &Vector3::new(0.0, 0.0, -8.0));
        let cap = Quadric::ellipsoid(&Vector3::new(9.0, 9.0, 14.0), &Vector3::new(0.0, 0.0, 10.0));
        OpticalSystem::new(
            1.0,
            vec![
                SurfaceRecord::refracting("front", front, Side::Negative, BoundingBox::unbounded(), true, 1.5),
                SurfaceRecord::refracting("back", back, Side::Positive, BoundingBox::unbounded(), true, 1.33),
                SurfaceRecord::refracting("cap", cap, Side::Positive, BoundingBox::unbounded(), true, 1.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_snell_at_plane() {
        let system = plane_system(1.0, 1.5);
        let incidence = 30.0_f64.to_radians();
        let ray = Ray::new(
            Vector3::new(0.0, -incidence.tan(), -1.0),
            Vector3::new(0.0, incidence.sin(), incidence.cos()),
        );
        let (output, path) = trace(&ray, &system).unwrap();
        assert_relative_eq!(output.origin, Vector3::zeros(), epsilon = 1e-12);
        let sin_t = output.direction.y / output.direction.norm();
        assert_relative_eq!(1.0 * incidence.sin(), 1.5 * sin_t, epsilon = 1e-12);
        assert_relative_eq!(output.direction.norm(), 1.0, epsilon = 1e-12);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_total_internal_reflection() {
        let system = plane_system(1.5, 1.0);
        let incidence = 60.0_f64.to_radians();
        let ray = Ray::new(
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(0.0, incidence.sin(), incidence.cos()),
        );
        let (path, outcome) = trace_with_path(&ray, &system);
        assert!(matches!(
            outcome,
            Err(TraceError::TotalInternalReflection { surface: 0, .. })
        ));
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_reflection() {
        let mirror = SurfaceRecord {
            interaction: Interaction::Reflect,
            ..plane_system(1.0, 1.0).surfaces()[0].clone()
        };
        let system = OpticalSystem::new(1.0, vec![mirror]).unwrap();
        let ray = Ray::new(Vector3::new(-1.0, 0.0, -1.0), Vector3::new(1.0, 0.0, 1.0));
        let (output, _) = trace(&ray, &system).unwrap();
        assert_relative_eq!(
            output.direction,
            Vector3::new(1.0, 0.0, -1.0).normalize(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mandatory_miss_aborts() {
        let system = lens_system();
        let ray = Ray::new(Vector3::new(0.0, 50.0, -5.0), Vector3::new(0.0, 0.0, 1.0));
        let (path, outcome) = trace_with_path(&ray, &system);
        assert_eq!(
            outcome,
            Err(TraceError::MandatorySurfaceMissed {
                surface: 0,
                label: "front".to_string()
            })
        );
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_optional_miss_is_skipped() {
        let mut system = lens_system();
        let far_away = Quadric::ellipsoid(&Vector3::new(1.0, 1.0, 1.0), &Vector3::new(100.0, 0.0, 0.0));
        let optional = SurfaceRecord::refracting(
            "elsewhere",
            far_away,
            Side::Negative,
            BoundingBox::unbounded(),
            false,
            1.5,
        );
        let mut surfaces = system.surfaces().to_vec();
        surfaces.insert(1, optional);
        system = OpticalSystem::new(1.0, surfaces).unwrap();

        let ray = Ray::new(Vector3::new(0.0, 1.0, -5.0), Vector3::new(0.0, 0.0, 1.0));
        let (_, path) = trace(&ray, &system).unwrap();
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn test_reversal_regenerates_path() {
        let system = lens_system();
        let ray = Ray::new(
            Vector3::new(0.5, 1.5, -5.0),
            Vector3::new(0.01, -0.02, 1.0),
        );
        let (output, forward) = trace(&ray, &system).unwrap();

        let back_ray = Ray::new(output.origin, -output.direction);
        let (returned, backward) = trace(&back_ray, &system.reversed()).unwrap();

        assert_eq!(forward.len(), backward.len());
        for (a, b) in forward.points[1..].iter().zip(backward.points.iter().rev()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_relative_eq!(returned.direction, -ray.direction, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_ray() {
        let ray = Ray {
            origin: Vector3::new(f64::NAN, 0.0, 0.0),
            direction: Vector3::new(0.0, 0.0, 1.0),
        };
        assert_eq!(trace(&ray, &lens_system()).unwrap_err(), TraceError::InvalidRay);
    }
}
