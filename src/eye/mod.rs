//! Anatomical eye model.
//!
//! Coordinates follow the eye frame: `p1` is the optical axis pointing out of
//! the eye towards the camera (corneal apex near `p1 = 0`), `p2` is
//! horizontal and `p3` vertical. The record itself comes from outside the
//! crate; this module parses, validates and queries it.

use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::io::Write;

use crate::optics::{OpticsError, SurfaceRecord};
use crate::quadric::{euler_rotation, BoundingBox, Quadric, Ray, Side};

/// Lateral offset used to measure the sagitta near the corneal apex.
const APEX_SAG_HEIGHT: f64 = 0.1;

/// Geometry of one anatomical surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SurfaceShape {
    /// Raw coefficients `[A B C D E F G H I K]`.
    Quadric { coefficients: [f64; 10] },
    /// Ellipsoid with semi-axes along `p1, p2, p3`, optionally rotated (degrees
    /// about `p1, p2, p3`) about its own centre.
    Ellipsoid {
        radii: [f64; 3],
        center: [f64; 3],
        #[serde(default)]
        rotation_deg: [f64; 3],
    },
}

impl SurfaceShape {
    pub fn quadric(&self) -> Quadric {
        match self {
            SurfaceShape::Quadric { coefficients } => Quadric::new(*coefficients),
            SurfaceShape::Ellipsoid {
                radii,
                center,
                rotation_deg,
            } => Quadric::unit_sphere()
                .scale(&Vector3::from(*radii))
                .rotate(&Vector3::from(*rotation_deg))
                .translate(&Vector3::from(*center)),
        }
    }
}

/// One refracting surface of the eye.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EyeSurface {
    pub label: String,
    pub shape: SurfaceShape,
    /// Root preference for rays travelling from the retina towards the camera.
    pub side: Side,
    pub bounding_box: BoundingBox,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    /// Index of the medium anterior to the surface. Left empty on the
    /// outermost corneal surface, whose outer medium depends on the scene.
    #[serde(default)]
    pub refractive_index: Option<f64>,
}

fn default_mandatory() -> bool {
    true
}

impl EyeSurface {
    pub fn quadric(&self) -> Quadric {
        self.shape.quadric()
    }

    /// Builds the surface record, taking `index` as the medium after the
    /// surface when given and the stored index otherwise.
    pub fn to_record(&self, index: Option<f64>) -> Result<SurfaceRecord, OpticsError> {
        let refractive_index = index.or(self.refractive_index).ok_or_else(|| {
            OpticsError::InvalidParams(format!("surface '{}' has no refractive index", self.label))
        })?;
        let record = SurfaceRecord::refracting(
            self.label.clone(),
            self.quadric(),
            self.side,
            self.bounding_box,
            self.mandatory,
            refractive_index,
        );
        record.validate()?;
        Ok(record)
    }

    fn validate(&self, needs_index: bool) -> Result<(), OpticsError> {
        match &self.shape {
            SurfaceShape::Quadric { coefficients } => {
                if coefficients.iter().any(|c| !c.is_finite()) {
                    return Err(OpticsError::InvalidParams(format!(
                        "surface '{}' has non-finite coefficients",
                        self.label
                    )));
                }
            }
            SurfaceShape::Ellipsoid {
                radii,
                center,
                rotation_deg,
            } => {
                if radii.iter().any(|r| !r.is_finite() || *r <= 0.0) {
                    return Err(OpticsError::InvalidParams(format!(
                        "surface '{}' must have positive radii, got {radii:?}",
                        self.label
                    )));
                }
                if center.iter().chain(rotation_deg.iter()).any(|v| !v.is_finite()) {
                    return Err(OpticsError::InvalidParams(format!(
                        "surface '{}' has a non-finite centre or rotation",
                        self.label
                    )));
                }
            }
        }
        if !self.bounding_box.is_valid() {
            return Err(OpticsError::InvalidParams(format!(
                "surface '{}' has min > max in its bounding box",
                self.label
            )));
        }
        match self.refractive_index {
            Some(n) if !n.is_finite() || n < 1.0 => Err(OpticsError::InvalidParams(format!(
                "surface '{}' has refractive index {n} < 1",
                self.label
            ))),
            None if needs_index => Err(OpticsError::InvalidParams(format!(
                "surface '{}' has no refractive index",
                self.label
            ))),
            _ => Ok(()),
        }
    }
}

/// Radius-dependent eccentricity of the aperture stop.
///
/// Positive values give an ellipse elongated along `theta_deg`; negative
/// values elongate it perpendicular to that, i.e. vertically by default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopEccentricity {
    Zero,
    Constant {
        value: f64,
    },
    /// `min + (max − min) / (1 + exp(−slope · (r − midpoint)))`.
    Sigmoid {
        min: f64,
        max: f64,
        midpoint: f64,
        slope: f64,
    },
}

impl StopEccentricity {
    pub fn at(&self, radius: f64) -> f64 {
        match *self {
            StopEccentricity::Zero => 0.0,
            StopEccentricity::Constant { value } => value,
            StopEccentricity::Sigmoid {
                min,
                max,
                midpoint,
                slope,
            } => min + (max - min) / (1.0 + (-slope * (radius - midpoint)).exp()),
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            StopEccentricity::Zero => true,
            StopEccentricity::Constant { value } => value.is_finite() && value.abs() < 1.0,
            StopEccentricity::Sigmoid {
                min,
                max,
                midpoint,
                slope,
            } => {
                [min, max, midpoint, slope].iter().all(|v| v.is_finite())
                    && min.abs() < 1.0
                    && max.abs() < 1.0
            }
        }
    }
}

/// The aperture stop (the physical pupil), a planar ellipse normal to `p1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    /// Position of the stop plane along `p1`.
    pub center_depth: f64,
    pub eccentricity: StopEccentricity,
    /// Tilt of the major axis in the `p2, p3` plane, degrees from `p2`.
    #[serde(default)]
    pub theta_deg: f64,
}

impl Stop {
    /// Semi-major axis, semi-minor axis and major-axis tilt (radians) of the
    /// stop ellipse with area `π radius²`.
    pub fn ellipse_axes(&self, radius: f64) -> (f64, f64, f64) {
        let e = self.eccentricity.at(radius);
        let ratio = (1.0 - e * e).max(0.0).sqrt().sqrt();
        let tilt = if e < 0.0 {
            self.theta_deg.to_radians() + PI / 2.0
        } else {
            self.theta_deg.to_radians()
        };
        (radius / ratio, radius * ratio, tilt)
    }

    /// `n` points evenly spaced in parametric angle around the stop edge.
    pub fn perimeter(&self, radius: f64, n: usize) -> Vec<Vector3<f64>> {
        let (major, minor, tilt) = self.ellipse_axes(radius);
        let (sin, cos) = tilt.sin_cos();
        (0..n)
            .map(|i| {
                let t = 2.0 * PI * i as f64 / n as f64;
                let u = major * t.cos();
                let v = minor * t.sin();
                Vector3::new(self.center_depth, cos * u - sin * v, sin * u + cos * v)
            })
            .collect()
    }
}

/// Eye rotation and stop size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyePose {
    /// Degrees, positive towards `+p2`.
    pub azimuth: f64,
    /// Degrees, positive towards `+p3`.
    pub elevation: f64,
    /// Degrees about the optical axis.
    pub torsion: f64,
    /// Radius in mm of the circle with the same area as the stop.
    pub stop_radius: f64,
}

impl EyePose {
    pub fn new(azimuth: f64, elevation: f64, torsion: f64, stop_radius: f64) -> Self {
        EyePose {
            azimuth,
            elevation,
            torsion,
            stop_radius,
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.azimuth, self.elevation, self.torsion, self.stop_radius]
    }

    pub fn from_array(values: [f64; 4]) -> Self {
        EyePose::new(values[0], values[1], values[2], values[3])
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// `Rz(azimuth) · Ry(−elevation) · Rx(torsion)`.
    pub fn rotation(&self) -> Rotation3<f64> {
        euler_rotation(&Vector3::new(self.torsion, -self.elevation, self.azimuth))
    }
}

/// Indices of the media that are not bounded by a single eye surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaIndices {
    pub vitreous: f64,
    pub aqueous: f64,
    pub tear_film: f64,
}

/// Surfaces, stop and media of one eye.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EyeModel {
    pub label: String,
    pub retina: EyeSurface,
    /// Crystalline lens surfaces from back to front, nucleus shells included.
    pub lens: Vec<EyeSurface>,
    /// Corneal surfaces from back to front.
    pub cornea: Vec<EyeSurface>,
    pub stop: Stop,
    pub rotation_center: [f64; 3],
    pub indices: MediaIndices,
}

impl EyeModel {
    pub fn load_from_yaml(path: &str) -> Result<Self, OpticsError> {
        let contents = fs::read_to_string(path)?;
        let model: EyeModel = serde_yaml::from_str(&contents)?;
        model.validate()?;
        Ok(model)
    }

    pub fn save_to_yaml(&self, path: &str) -> Result<(), OpticsError> {
        let yaml = serde_yaml::to_string(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), OpticsError> {
        if self.cornea.is_empty() {
            return Err(OpticsError::InvalidParams(
                "eye model needs at least one corneal surface".to_string(),
            ));
        }
        self.retina.validate(false)?;
        for surface in &self.lens {
            surface.validate(true)?;
        }
        let last = self.cornea.len() - 1;
        for (i, surface) in self.cornea.iter().enumerate() {
            surface.validate(i != last)?;
        }

        let MediaIndices {
            vitreous,
            aqueous,
            tear_film,
        } = self.indices;
        for (name, n) in [("vitreous", vitreous), ("aqueous", aqueous), ("tear film", tear_film)] {
            if !n.is_finite() || n < 1.0 {
                return Err(OpticsError::InvalidParams(format!(
                    "{name} index must be at least 1, got {n}"
                )));
            }
        }
        if !self.stop.center_depth.is_finite()
            || !self.stop.theta_deg.is_finite()
            || !self.stop.eccentricity.is_valid()
        {
            return Err(OpticsError::InvalidParams(
                "stop parameters must be finite with |eccentricity| < 1".to_string(),
            ));
        }
        if self.rotation_center.iter().any(|v| !v.is_finite()) {
            return Err(OpticsError::InvalidParams(
                "rotation centre must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn rotation_center(&self) -> Vector3<f64> {
        Vector3::from(self.rotation_center)
    }

    /// The corneal surface facing the outside world.
    pub fn outer_cornea(&self) -> Option<&EyeSurface> {
        self.cornea.last()
    }

    /// Where the optical axis leaves the outer cornea.
    pub fn corneal_apex(&self) -> Option<Vector3<f64>> {
        self.outer_cornea_hit(0.0)
    }

    /// Apical radius of curvature of the outer cornea, from the sagitta a
    /// short distance off axis.
    pub fn corneal_apex_radius(&self) -> Option<f64> {
        let apex = self.corneal_apex()?;
        let off_axis = self.outer_cornea_hit(APEX_SAG_HEIGHT)?;
        let sag = apex.x - off_axis.x;
        if sag <= 0.0 {
            return None;
        }
        Some((APEX_SAG_HEIGHT * APEX_SAG_HEIGHT + sag * sag) / (2.0 * sag))
    }

    /// Hit of a ray travelling down `−p1` at height `p2` on the outer cornea.
    fn outer_cornea_hit(&self, p2: f64) -> Option<Vector3<f64>> {
        let surface = self.outer_cornea()?;
        let ray = Ray::new(Vector3::new(1000.0, p2, 0.0), Vector3::new(-1.0, 0.0, 0.0));
        // The stored side is for rays leaving the eye; this ray is entering.
        let side = surface.side.flipped();
        surface
            .quadric()
            .intersect_ray(&ray, side, &surface.bounding_box)
            .map(|(point, _)| point)
    }

    /// Retina to camera order surfaces posterior to the stop, as records.
    pub(crate) fn posterior_records(&self) -> Result<Vec<SurfaceRecord>, OpticsError> {
        let mut records = vec![self.retina.to_record(Some(
            self.retina.refractive_index.unwrap_or(self.indices.vitreous),
        ))?];
        for surface in &self.lens {
            records.push(surface.to_record(None)?);
        }
        Ok(records)
    }

    /// Corneal records with the outer surface leading into `outer_index`.
    pub(crate) fn corneal_records(&self, outer_index: f64) -> Result<Vec<SurfaceRecord>, OpticsError> {
        let last = self.cornea.len().saturating_sub(1);
        self.cornea
            .iter()
            .enumerate()
            .map(|(i, surface)| surface.to_record((i == last).then_some(outer_index)))
            .collect()
    }
}

/// Sphere of radius `|radius|` whose vertex sits at `p1 = apex` on the
/// optical axis, convex towards `+p1` for positive `radius`.
///
/// Returns the quadric and the side that picks the vertex cap for rays
/// travelling towards `+p1`.
pub(crate) fn vertex_sphere(apex: f64, radius: f64) -> (Quadric, Side) {
    let r = radius.abs();
    let center = Vector3::new(apex - radius, 0.0, 0.0);
    let side = if radius > 0.0 {
        Side::Positive
    } else {
        Side::Negative
    };
    (Quadric::ellipsoid(&Vector3::new(r, r, r), &center), side)
}
