//! A camera looking at a model eye.
//!
//! [`SceneConfig`] describes everything outside the eye (camera, medium,
//! corrective lenses). [`SceneGeometry`] binds it to an [`EyeModel`] and
//! assembles the optical systems the forward projection needs, once.
//!
//! Ocular surfaces and contact lenses live in the eye frame and turn with the
//! eye. Spectacles and the camera live in the scene frame.

use log::info;
use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

use crate::eye::{EyeModel, EyePose};
use crate::optics::{
    assemble, spectacle_system, LensDescriptor, Medium, OpticalPath, OpticalSystem, OpticsError,
};

pub mod camera;
pub mod projection;

pub use camera::{CameraError, Intrinsics, Resolution, SceneCamera};
pub use projection::{ProjectionError, StopProjection};

fn default_perimeter_points() -> usize {
    16
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub camera: SceneCamera,
    #[serde(default)]
    pub medium: Medium,
    #[serde(default)]
    pub contact_lens: Option<LensDescriptor>,
    #[serde(default)]
    pub spectacle_lens: Option<LensDescriptor>,
    /// Points sampled on the stop edge for each projection.
    #[serde(default = "default_perimeter_points")]
    pub perimeter_points: usize,
}

impl SceneConfig {
    pub fn new(camera: SceneCamera) -> Self {
        SceneConfig {
            camera,
            medium: Medium::Air,
            contact_lens: None,
            spectacle_lens: None,
            perimeter_points: default_perimeter_points(),
        }
    }

    pub fn load_from_yaml(path: &str) -> Result<Self, OpticsError> {
        let contents = fs::read_to_string(path)?;
        let config: SceneConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), OpticsError> {
        let yaml = serde_yaml::to_string(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), OpticsError> {
        self.camera
            .validate_params()
            .map_err(|e| OpticsError::InvalidParams(e.to_string()))?;
        if self.perimeter_points < crate::geometry::fit::MIN_FIT_POINTS {
            return Err(OpticsError::InvalidParams(format!(
                "at least {} perimeter points are needed, got {}",
                crate::geometry::fit::MIN_FIT_POINTS,
                self.perimeter_points
            )));
        }
        for lens in self.contact_lens.iter().chain(self.spectacle_lens.iter()) {
            lens.validate()?;
        }
        Ok(())
    }
}

/// A rotated eye: maps between eye and scene coordinates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EyeFrame {
    rotation: Rotation3<f64>,
    center: Vector3<f64>,
}

impl EyeFrame {
    fn new(pose: &EyePose, center: Vector3<f64>) -> Self {
        EyeFrame {
            rotation: pose.rotation(),
            center,
        }
    }

    pub fn to_world_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.center + self.rotation * (point - self.center)
    }

    pub fn to_world_direction(&self, direction: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * direction
    }

    pub fn to_eye_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.center + self.rotation.inverse() * (point - self.center)
    }

    pub fn to_eye_direction(&self, direction: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.inverse() * direction
    }
}

/// An eye, a camera and the optical systems between them.
///
/// Immutable after construction and safe to share between threads.
#[derive(Debug, Clone)]
pub struct SceneGeometry {
    eye: EyeModel,
    config: SceneConfig,
    stop_to_camera: OpticalSystem,
    retina_to_camera: OpticalSystem,
    glint: OpticalSystem,
    spectacles: Option<OpticalSystem>,
    spectacles_inward: Option<OpticalSystem>,
    corneal_center: Vector3<f64>,
}

impl SceneGeometry {
    pub fn new(eye: EyeModel, config: SceneConfig) -> Result<Self, OpticsError> {
        config.validate()?;
        let contact = config.contact_lens.as_ref();
        let build = |path| assemble(&eye, path, config.medium, contact, None);
        let stop_to_camera = build(OpticalPath::StopToCamera)?;
        let retina_to_camera = build(OpticalPath::RetinaToCamera)?;
        let glint = build(OpticalPath::Glint)?;
        let spectacles = config
            .spectacle_lens
            .as_ref()
            .map(|lens| spectacle_system(&eye, config.medium, contact, lens))
            .transpose()?;
        let spectacles_inward = spectacles.as_ref().map(OpticalSystem::reversed);

        let apex = eye
            .corneal_apex()
            .ok_or_else(|| OpticsError::InvalidParams("cornea has no apex on the optical axis".to_string()))?;
        let radius = eye
            .corneal_apex_radius()
            .ok_or_else(|| OpticsError::InvalidParams("corneal apex radius is undefined".to_string()))?;
        let corneal_center = apex - Vector3::x() * radius;

        info!(
            "Scene for '{}' with camera at {:?}, medium index {}",
            eye.label,
            config.camera.translation,
            config.medium.refractive_index()
        );
        Ok(SceneGeometry {
            eye,
            config,
            stop_to_camera,
            retina_to_camera,
            glint,
            spectacles,
            spectacles_inward,
            corneal_center,
        })
    }

    pub fn eye(&self) -> &EyeModel {
        &self.eye
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Eye-fixed surfaces from the stop outwards.
    pub fn stop_to_camera(&self) -> &OpticalSystem {
        &self.stop_to_camera
    }

    /// Eye-fixed surfaces from the retina outwards.
    pub fn retina_to_camera(&self) -> &OpticalSystem {
        &self.retina_to_camera
    }

    /// Reflection at the outermost ocular surface.
    pub fn glint(&self) -> &OpticalSystem {
        &self.glint
    }

    /// Scene-fixed spectacle lens, for light leaving the eye.
    pub fn spectacles(&self) -> Option<&OpticalSystem> {
        self.spectacles.as_ref()
    }

    /// Centre of curvature of the corneal apex, eye coordinates.
    pub fn corneal_center(&self) -> Vector3<f64> {
        self.corneal_center
    }

    pub(crate) fn frame(&self, pose: &EyePose) -> EyeFrame {
        EyeFrame::new(pose, self.eye.rotation_center())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_config() -> SceneConfig {
        SceneConfig::load_from_yaml("samples/scene.yaml").unwrap()
    }

    #[test]
    fn test_load_scene() {
        let config = sample_config();
        assert_eq!(config.medium, Medium::Air);
        assert!(config.contact_lens.is_none());
        assert_eq!(config.perimeter_points, 8);
        assert_relative_eq!(config.camera.position(), Vector3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn test_scene_yaml_round_trip() {
        let mut config = sample_config();
        config.spectacle_lens = Some(LensDescriptor::new(-2.0));
        config.medium = Medium::Custom(1.2);
        let path = std::env::temp_dir().join("model_eye_scene_round_trip.yaml");
        let path = path.to_string_lossy().to_string();
        config.save_to_yaml(&path).unwrap();
        assert_eq!(SceneConfig::load_from_yaml(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_too_few_perimeter_points() {
        let mut config = sample_config();
        config.perimeter_points = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frame_counter_rotates_camera() {
        let eye = EyeModel::load_from_yaml("samples/emmetropic_eye.yaml").unwrap();
        let scene = SceneGeometry::new(eye, sample_config()).unwrap();
        let pose = EyePose::new(20.0, -5.0, 3.0, 2.0);
        let frame = scene.frame(&pose);

        // Camera distance from the rotation centre is preserved.
        let center = scene.eye().rotation_center();
        let world_camera = scene.config().camera.position();
        let camera = frame.to_eye_point(&world_camera);
        assert_relative_eq!(
            (camera - center).norm(),
            (world_camera - center).norm(),
            epsilon = 1e-9
        );
        assert_relative_eq!(frame.to_world_point(&camera), world_camera, epsilon = 1e-9);
        let direction = Vector3::new(0.3, -0.2, 0.9).normalize();
        assert_relative_eq!(
            frame.to_world_direction(&frame.to_eye_direction(&direction)),
            direction,
            epsilon = 1e-12
        );
        // Rotating the eye left moves the camera right in eye coordinates.
        assert!(camera.y < 0.0);
    }

    #[test]
    fn test_scene_assembles_systems() {
        let eye = EyeModel::load_from_yaml("samples/emmetropic_eye.yaml").unwrap();
        let mut config = sample_config();
        config.contact_lens = Some(LensDescriptor::new(-1.0));
        let scene = SceneGeometry::new(eye.clone(), config).unwrap();
        assert_eq!(scene.stop_to_camera().len(), eye.cornea.len() + 2);
        assert_eq!(scene.retina_to_camera().len(), 1 + eye.lens.len() + eye.cornea.len() + 2);
        assert_eq!(scene.glint().len(), 1);
        assert!(scene.spectacles().is_none());
        assert_relative_eq!(scene.corneal_center().x, -7.8, epsilon = 1e-3);
    }

    #[test]
    fn test_spectacles_kept_out_of_eye_systems() {
        let eye = EyeModel::load_from_yaml("samples/emmetropic_eye.yaml").unwrap();
        let mut config = sample_config();
        config.spectacle_lens = Some(LensDescriptor::new(-3.0));
        let scene = SceneGeometry::new(eye.clone(), config).unwrap();
        assert_eq!(scene.stop_to_camera().len(), eye.cornea.len());
        assert_eq!(scene.glint().len(), 1);
        assert_eq!(scene.spectacles().map(|s| s.len()), Some(2));
    }
}
