//! Scene camera: pinhole intrinsics with two-term radial distortion.
//!
//! The camera sits in the world frame (the eye frame at zero pose) looking
//! down `−p1` towards the eye. Image `x` follows `+p2` and image `y` follows
//! `−p3` before the camera torsion is applied.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("Point is behind the camera or at its centre")]
    PointBehindCamera,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
}

fn default_translation() -> [f64; 3] {
    [100.0, 0.0, 0.0]
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneCamera {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// Radial distortion `[k1, k2]`.
    #[serde(default)]
    pub distortions: [f64; 2],
    /// Camera centre in mm: distance along `p1`, then `p2` and `p3` offsets.
    #[serde(default = "default_translation")]
    pub translation: [f64; 3],
    /// Rotation of the sensor about the viewing axis, degrees.
    #[serde(default)]
    pub torsion_deg: f64,
}

impl fmt::Debug for SceneCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SceneCamera [fx: {} fy: {} cx: {} cy: {} distortions: {:?} translation: {:?} torsion: {}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
            self.translation,
            self.torsion_deg,
        )
    }
}

impl SceneCamera {
    /// Undistorted camera 100 mm in front of the eye on the optical axis.
    pub fn new(intrinsics: Intrinsics, resolution: Resolution) -> Result<Self, CameraError> {
        let camera = SceneCamera {
            intrinsics,
            resolution,
            distortions: [0.0; 2],
            translation: default_translation(),
            torsion_deg: 0.0,
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// Camera centre in world coordinates.
    pub fn position(&self) -> Vector3<f64> {
        Vector3::from(self.translation)
    }

    /// Projects the world-frame direction `ray` (from the camera centre
    /// towards the scene) to pixel coordinates.
    pub fn project_direction(&self, ray: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        let x = ray.y;
        let y = -ray.z;
        let z = -ray.x;
        if z < f64::EPSILON.sqrt() * ray.norm() {
            return Err(CameraError::PointBehindCamera);
        }

        let (sin, cos) = self.torsion_deg.to_radians().sin_cos();
        let x_prime = (cos * x - sin * y) / z;
        let y_prime = (sin * x + cos * y) / z;

        let [k1, k2] = self.distortions;
        let r2 = x_prime * x_prime + y_prime * y_prime;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;

        Ok(Vector2::new(
            self.intrinsics.fx * x_prime * radial + self.intrinsics.cx,
            self.intrinsics.fy * y_prime * radial + self.intrinsics.cy,
        ))
    }

    /// Projects a world point.
    pub fn project_point(&self, point: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        self.project_direction(&(point - self.position()))
    }

    pub fn is_in_image(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.x < self.resolution.width as f64
            && pixel.y >= 0.0
            && pixel.y < self.resolution.height as f64
    }

    pub fn validate_params(&self) -> Result<(), CameraError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|k| !k.is_finite()) || !self.torsion_deg.is_finite() {
            return Err(CameraError::InvalidParams(
                "distortion and torsion must be finite".to_string(),
            ));
        }
        if self.translation.iter().any(|t| !t.is_finite()) || self.translation[0] <= 0.0 {
            return Err(CameraError::InvalidParams(format!(
                "camera must sit in front of the eye, got translation {:?}",
                self.translation
            )));
        }
        Ok(())
    }
}

pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraError> {
        if !(intrinsics.fx > 0.0) || !(intrinsics.fy > 0.0) {
            return Err(CameraError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> SceneCamera {
        SceneCamera::new(
            Intrinsics {
                fx: 2000.0,
                fy: 2000.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_axis_projects_to_principal_point() {
        let pixel = camera().project_point(&Vector3::zeros()).unwrap();
        assert_relative_eq!(pixel, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn test_image_axes() {
        let camera = camera();
        let right = camera.project_point(&Vector3::new(0.0, 1.0, 0.0)).unwrap();
        assert_relative_eq!(right.x, 320.0 + 2000.0 / 100.0, epsilon = 1e-12);
        let up = camera.project_point(&Vector3::new(0.0, 0.0, 1.0)).unwrap();
        assert!(up.y < 240.0);

        let rotated = SceneCamera {
            torsion_deg: 90.0,
            ..camera.clone()
        };
        let turned = rotated.project_point(&Vector3::new(0.0, 1.0, 0.0)).unwrap();
        assert_relative_eq!(turned.x, 320.0, epsilon = 1e-9);
        assert_relative_eq!(turned.y, 240.0 + 20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_radial_distortion() {
        let distorted = SceneCamera {
            distortions: [0.5, 0.0],
            ..camera()
        };
        let pixel = distorted.project_direction(&Vector3::new(-1.0, 0.1, 0.0)).unwrap();
        assert_relative_eq!(pixel.x, 320.0 + 2000.0 * 0.1 * (1.0 + 0.5 * 0.01), epsilon = 1e-9);
    }

    #[test]
    fn test_rejects_points_behind() {
        let result = camera().project_point(&Vector3::new(200.0, 0.0, 0.0));
        assert_eq!(result, Err(CameraError::PointBehindCamera));
    }

    #[test]
    fn test_validation() {
        let mut bad = camera();
        bad.intrinsics.fx = 0.0;
        assert_eq!(bad.validate_params(), Err(CameraError::FocalLengthMustBePositive));
        let mut bad = camera();
        bad.intrinsics.cy = f64::NAN;
        assert_eq!(bad.validate_params(), Err(CameraError::PrincipalPointMustBeFinite));
        let mut bad = camera();
        bad.translation = [-5.0, 0.0, 0.0];
        assert!(bad.validate_params().is_err());
    }
}
