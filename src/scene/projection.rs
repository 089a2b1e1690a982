//! Forward projection of eye features into the scene camera.
//!
//! Every feature is imaged by finding the ray that leaves it, crosses a
//! [`Route`] of optical systems and then passes through the camera centre.
//! That ray is found by a damped Newton search on two angular offsets of the
//! launch direction. Searches run in scene coordinates; eye-fixed legs of a
//! route are traced in the rotated eye frame.

use log::{debug, warn};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::{EyeFrame, SceneGeometry};
use crate::eye::EyePose;
use crate::geometry::fit::{fit_ellipse, MIN_FIT_POINTS};
use crate::geometry::Ellipse;
use crate::optics::{trace, OpticalSystem, RayPath};
use crate::quadric::Ray;

/// Largest allowed distance in mm between the exit ray and its target.
const AIM_TOLERANCE: f64 = 1e-9;
const AIM_MAX_ITERATIONS: usize = 20;
const AIM_FD_STEP: f64 = 1e-7;
const AIM_MAX_HALVINGS: usize = 10;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("Only {found} perimeter points reached the camera, {needed} needed")]
    InsufficientBoundaryPoints { found: usize, needed: usize },
    #[error("Projected perimeter does not fit an ellipse")]
    EllipseFit,
    #[error("Pose must be finite with a positive stop radius")]
    InvalidPose,
    #[error("No ray from the feature reaches the camera")]
    Unreachable,
}

/// Image of the stop for one pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopProjection {
    /// Pixels of the perimeter points that reached the camera.
    pub points: Vec<Vector2<f64>>,
    pub ellipse: Ellipse,
}

/// Frame a leg of a [`Route`] is fixed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mount {
    Eye,
    Scene,
}

/// Optical systems crossed one after another. Rays enter and leave in scene
/// coordinates.
pub(crate) struct Route<'a> {
    frame: EyeFrame,
    legs: Vec<(Mount, &'a OpticalSystem)>,
}

impl<'a> Route<'a> {
    pub(crate) fn new(frame: EyeFrame) -> Self {
        Route {
            frame,
            legs: Vec::new(),
        }
    }

    /// Appends `system` unless it is absent or empty.
    pub(crate) fn then(mut self, mount: Mount, system: Option<&'a OpticalSystem>) -> Self {
        if let Some(system) = system.filter(|s| !s.is_empty()) {
            self.legs.push((mount, system));
        }
        self
    }

    /// Traces `ray` through every leg. The path is in scene coordinates.
    pub(crate) fn trace(&self, ray: &Ray) -> Option<(Ray, RayPath)> {
        let mut current = *ray;
        let mut path = RayPath {
            points: vec![ray.origin],
            directions: vec![ray.direction],
        };
        for (mount, system) in &self.legs {
            let (exit, leg) = match mount {
                Mount::Scene => trace(&current, system).ok()?,
                Mount::Eye => {
                    let local = Ray {
                        origin: self.frame.to_eye_point(&current.origin),
                        direction: self.frame.to_eye_direction(&current.direction),
                    };
                    let (exit, leg) = trace(&local, system).ok()?;
                    let exit = Ray {
                        origin: self.frame.to_world_point(&exit.origin),
                        direction: self.frame.to_world_direction(&exit.direction),
                    };
                    let leg = RayPath {
                        points: leg.points.iter().map(|p| self.frame.to_world_point(p)).collect(),
                        directions: leg.directions.iter().map(|d| self.frame.to_world_direction(d)).collect(),
                    };
                    (exit, leg)
                }
            };
            path.points.extend(leg.points.into_iter().skip(1));
            path.directions.extend(leg.directions.into_iter().skip(1));
            current = exit;
        }
        Some((current, path))
    }
}

/// Exit ray of `route` for a ray launched from `origin` with `direction`,
/// and the perpendicular miss vector from that ray to `target`.
fn miss(
    route: &Route,
    origin: &Vector3<f64>,
    direction: &Vector3<f64>,
    target: &Vector3<f64>,
) -> Option<(Vector3<f64>, RayPath)> {
    let (exit, path) = route.trace(&Ray::new(*origin, *direction))?;
    let to_target = target - exit.origin;
    let along = to_target.dot(&exit.direction);
    if along <= 0.0 {
        return None;
    }
    Some((to_target - exit.direction * along, path))
}

/// Launch direction from `origin` whose exit ray through `route` passes
/// within [`AIM_TOLERANCE`] of `target`, starting the search at `initial`.
///
/// Returns the launch direction and the traced path, or `None` when the
/// search does not converge.
pub(crate) fn aim(
    route: &Route,
    origin: &Vector3<f64>,
    initial: &Vector3<f64>,
    target: &Vector3<f64>,
) -> Option<(Vector3<f64>, RayPath)> {
    let d0 = initial.try_normalize(f64::EPSILON)?;
    let helper = if d0.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let e1 = d0.cross(&helper).normalize();
    let e2 = d0.cross(&e1);

    let direction = |offset: &Vector2<f64>| (d0 + e1 * offset.x + e2 * offset.y).normalize();
    let residual = |offset: &Vector2<f64>| {
        miss(route, origin, &direction(offset), target)
            .map(|(m, path)| (Vector2::new(m.dot(&e1), m.dot(&e2)), m.norm(), path))
    };

    let mut offset = Vector2::zeros();
    let (mut r, mut distance, mut path) = residual(&offset)?;
    for _ in 0..AIM_MAX_ITERATIONS {
        if distance < AIM_TOLERANCE {
            return Some((direction(&offset), path));
        }

        let mut jacobian = Matrix2::zeros();
        for k in 0..2 {
            let mut shifted = offset;
            shifted[k] += AIM_FD_STEP;
            let (r_k, _, _) = residual(&shifted)?;
            jacobian.set_column(k, &((r_k - r) / AIM_FD_STEP));
        }
        let step = jacobian.lu().solve(&(-r))?;

        let mut scale = 1.0;
        let mut accepted = false;
        for _ in 0..AIM_MAX_HALVINGS {
            let candidate = offset + step * scale;
            if let Some((r_new, d_new, p_new)) = residual(&candidate) {
                if d_new < distance {
                    offset = candidate;
                    r = r_new;
                    distance = d_new;
                    path = p_new;
                    accepted = true;
                    break;
                }
            }
            scale *= 0.5;
        }
        if !accepted {
            break;
        }
    }
    (distance < AIM_TOLERANCE).then(|| (direction(&offset), path))
}

impl SceneGeometry {
    /// Stop outwards through the rotated cornea, then the spectacles.
    pub(crate) fn stop_route(&self, frame: EyeFrame) -> Route<'_> {
        Route::new(frame)
            .then(Mount::Eye, Some(self.stop_to_camera()))
            .then(Mount::Scene, self.spectacles())
    }

    /// Projects the stop perimeter of `pose` into the camera and fits an
    /// ellipse to it.
    ///
    /// Perimeter points whose ray cannot be aimed at the camera, or that land
    /// outside the image, are dropped.
    pub fn project_pose(&self, pose: &EyePose) -> Result<StopProjection, ProjectionError> {
        if !pose.is_finite() || pose.stop_radius <= 0.0 {
            return Err(ProjectionError::InvalidPose);
        }
        let frame = self.frame(pose);
        let route = self.stop_route(frame);
        let camera = &self.config().camera;
        let target = camera.position();
        let perimeter = self
            .eye()
            .stop
            .perimeter(pose.stop_radius, self.config().perimeter_points);

        let points: Vec<Vector2<f64>> = perimeter
            .iter()
            .filter_map(|point| {
                let origin = frame.to_world_point(point);
                let (_, path) = aim(&route, &origin, &(target - origin), &target)?;
                let exit = path.directions.last()?;
                let pixel = camera.project_direction(&-exit).ok()?;
                camera.is_in_image(&pixel).then_some(pixel)
            })
            .collect();

        let dropped = perimeter.len() - points.len();
        if dropped > 0 {
            debug!("{dropped} of {} perimeter points did not reach the camera", perimeter.len());
        }
        if points.len() < MIN_FIT_POINTS {
            warn!(
                "Pose {:?} leaves {} perimeter points, cannot fit an ellipse",
                pose.to_array(),
                points.len()
            );
            return Err(ProjectionError::InsufficientBoundaryPoints {
                found: points.len(),
                needed: MIN_FIT_POINTS,
            });
        }
        let ellipse = fit_ellipse(&points).ok_or(ProjectionError::EllipseFit)?;
        Ok(StopProjection { points, ellipse })
    }

    /// Pixel of the corneal reflection of a light source at the camera
    /// centre.
    pub fn project_glint(&self, pose: &EyePose) -> Result<Vector2<f64>, ProjectionError> {
        if !pose.is_finite() {
            return Err(ProjectionError::InvalidPose);
        }
        let frame = self.frame(pose);
        let route = Route::new(frame)
            .then(Mount::Scene, self.spectacles_inward.as_ref())
            .then(Mount::Eye, Some(self.glint()))
            .then(Mount::Scene, self.spectacles());
        let camera = self.config().camera.position();
        let (launch, _) = aim(
            &route,
            &camera,
            &(frame.to_world_point(&self.corneal_center()) - camera),
            &camera,
        )
        .ok_or(ProjectionError::Unreachable)?;
        self.config()
            .camera
            .project_direction(&launch)
            .map_err(|_| ProjectionError::Unreachable)
    }

    /// Scene-frame path of the ray that leaves `retinal_point` (eye frame)
    /// and reaches the camera centre.
    pub fn retina_to_camera_path(
        &self,
        pose: &EyePose,
        retinal_point: &Vector3<f64>,
    ) -> Result<RayPath, ProjectionError> {
        if !pose.is_finite() {
            return Err(ProjectionError::InvalidPose);
        }
        let frame = self.frame(pose);
        let route = Route::new(frame)
            .then(Mount::Eye, Some(self.retina_to_camera()))
            .then(Mount::Scene, self.spectacles());
        let camera = self.config().camera.position();
        let origin = frame.to_world_point(retinal_point);
        let (_, path) = aim(&route, &origin, &(camera - origin), &camera).ok_or(ProjectionError::Unreachable)?;
        Ok(path)
    }
}
