//! Corrective lenses: contact lenses and spectacles.
//!
//! Each lens contributes a back and a front spherical surface (or a plane
//! when a surface carries no power). Surface radii come from the thick-lens
//! power equation `P = P₁ + P₂ − (t / n) P₁ P₂`, with powers specified in air
//! and surface powers related to radii by `P = 1000 (n₂ − n₁) / R` (R in mm).

use log::debug;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{OpticsError, SurfaceRecord};
use crate::eye::{vertex_sphere, EyeModel};
use crate::quadric::{BoundingBox, Quadric, Side};

const CONTACT_INDEX: f64 = 1.392;
const CONTACT_THICKNESS: f64 = 0.1;
const CONTACT_SEMI_DIAMETER: f64 = 7.0;
/// Post-lens tear film thickness at the apex.
const TEAR_FILM_GAP: f64 = 0.005;
/// Contact back surfaces are fitted flatter than the cornea.
const CONTACT_BACK_FLATTENING: f64 = 0.5;

const SPECTACLE_INDEX: f64 = 1.50;
const SPECTACLE_THICKNESS: f64 = 2.0;
const SPECTACLE_VERTEX_DISTANCE: f64 = 12.0;
const SPECTACLE_SEMI_DIAMETER: f64 = 25.0;

/// Surface powers below this (diopters) are built as planes.
const PLANO_POWER: f64 = 1e-9;

/// Prescription of a corrective lens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LensDescriptor {
    /// Lens power in diopters.
    pub diopters: f64,
    #[serde(default)]
    pub refractive_index: Option<f64>,
    /// Distance in mm from the corneal apex to the back vertex. Spectacles only.
    #[serde(default)]
    pub vertex_distance: Option<f64>,
    /// Front surface power in diopters. Spectacles only; defaults to Vogel's
    /// rule.
    #[serde(default)]
    pub base_curve: Option<f64>,
}

impl LensDescriptor {
    pub fn new(diopters: f64) -> Self {
        LensDescriptor {
            diopters,
            refractive_index: None,
            vertex_distance: None,
            base_curve: None,
        }
    }

    /// Parses `[diopters, index, vertex_distance, base_curve]`, where all but
    /// the first element are optional and `NaN` stands for "use the default".
    pub fn from_slice(values: &[f64]) -> Result<Self, OpticsError> {
        if values.is_empty() || values.len() > 4 {
            return Err(OpticsError::InvalidLensDescriptor(format!(
                "expected 1 to 4 values, got {}",
                values.len()
            )));
        }
        let optional = |i: usize| values.get(i).copied().filter(|v| !v.is_nan());
        let descriptor = LensDescriptor {
            diopters: values[0],
            refractive_index: optional(1),
            vertex_distance: optional(2),
            base_curve: optional(3),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), OpticsError> {
        if !self.diopters.is_finite() {
            return Err(OpticsError::InvalidLensDescriptor(format!(
                "lens power must be finite, got {}",
                self.diopters
            )));
        }
        if let Some(n) = self.refractive_index {
            if !n.is_finite() || n <= 1.0 {
                return Err(OpticsError::InvalidLensDescriptor(format!(
                    "lens index must exceed 1, got {n}"
                )));
            }
        }
        if let Some(d) = self.vertex_distance {
            if !d.is_finite() || d <= 0.0 {
                return Err(OpticsError::InvalidLensDescriptor(format!(
                    "vertex distance must be positive, got {d}"
                )));
            }
        }
        if let Some(b) = self.base_curve {
            if !b.is_finite() {
                return Err(OpticsError::InvalidLensDescriptor(format!(
                    "base curve must be finite, got {b}"
                )));
            }
        }
        Ok(())
    }
}

/// Radius in mm of a surface with `power` diopters between media `n_from`
/// and `n_to`; `None` for a plane.
fn surface_radius(power: f64, n_from: f64, n_to: f64) -> Option<f64> {
    (power.abs() > PLANO_POWER).then(|| 1000.0 * (n_to - n_from) / power)
}

/// Power in diopters of a surface of radius `radius` mm.
fn surface_power(radius: f64, n_from: f64, n_to: f64) -> f64 {
    1000.0 * (n_to - n_from) / radius
}

/// Surface with its vertex on the optical axis at `p1 = apex`; a plane when
/// `radius` is `None`.
fn vertex_surface(
    label: &str,
    apex: f64,
    radius: Option<f64>,
    semi_diameter: f64,
    refractive_index: f64,
) -> SurfaceRecord {
    let (quadric, side, p1_range) = match radius {
        Some(r) => {
            let (quadric, side) = vertex_sphere(apex, r);
            let center = apex - r;
            let range = if r > 0.0 {
                (center.max(apex - semi_diameter), apex + 1e-3)
            } else {
                (apex - 1e-3, center.min(apex + semi_diameter))
            };
            (quadric, side, range)
        }
        None => (
            Quadric::plane(&Vector3::new(1.0, 0.0, 0.0), apex),
            Side::Positive,
            (apex - 1e-3, apex + 1e-3),
        ),
    };
    SurfaceRecord::refracting(
        label,
        quadric,
        side,
        BoundingBox::new(
            [p1_range.0, -semi_diameter, -semi_diameter],
            [p1_range.1, semi_diameter, semi_diameter],
        ),
        true,
        refractive_index,
    )
}

/// Back and front surfaces of a contact lens resting on the cornea of `eye`.
///
/// The back surface is a sphere slightly flatter than the corneal apex,
/// separated from it by a thin tear film; the front radius is solved from
/// the lens power. The front surface leads into `outer_index`.
pub fn contact_lens(
    eye: &EyeModel,
    descriptor: &LensDescriptor,
    outer_index: f64,
) -> Result<[SurfaceRecord; 2], OpticsError> {
    descriptor.validate()?;
    if descriptor.vertex_distance.is_some() || descriptor.base_curve.is_some() {
        debug!("vertex distance and base curve are ignored for contact lenses");
    }
    let n = descriptor.refractive_index.unwrap_or(CONTACT_INDEX);
    let apex = eye
        .corneal_apex()
        .ok_or_else(|| OpticsError::InvalidParams("cornea has no apex on the optical axis".to_string()))?;
    let cornea_radius = eye
        .corneal_apex_radius()
        .ok_or_else(|| OpticsError::InvalidParams("corneal apex radius is undefined".to_string()))?;

    let back_radius = cornea_radius + CONTACT_BACK_FLATTENING;
    let back_apex = apex.x + TEAR_FILM_GAP;
    let front_apex = back_apex + CONTACT_THICKNESS;

    let back_power = surface_power(back_radius, n, 1.0);
    let t = CONTACT_THICKNESS / 1000.0;
    let front_power = (descriptor.diopters - back_power) / (1.0 - t * back_power / n);
    let front_radius = surface_radius(front_power, 1.0, n);

    Ok([
        vertex_surface("contact lens back", back_apex, Some(back_radius), CONTACT_SEMI_DIAMETER, n),
        vertex_surface("contact lens front", front_apex, front_radius, CONTACT_SEMI_DIAMETER, outer_index),
    ])
}

/// Vogel's rule for the front (base) curve of a spectacle lens.
fn vogel_base_curve(diopters: f64) -> f64 {
    if diopters >= 0.0 {
        diopters + 6.0
    } else {
        diopters / 2.0 + 6.0
    }
}

/// Back and front surfaces of a spectacle lens worn in front of an eye whose
/// outermost surface has its vertex at `p1 = anterior_apex`. Both surfaces
/// are bounded by `medium_index` on their outer side.
pub fn spectacle_lens(
    anterior_apex: f64,
    descriptor: &LensDescriptor,
    medium_index: f64,
) -> Result<[SurfaceRecord; 2], OpticsError> {
    descriptor.validate()?;
    let n = descriptor.refractive_index.unwrap_or(SPECTACLE_INDEX);
    let vertex_distance = descriptor.vertex_distance.unwrap_or(SPECTACLE_VERTEX_DISTANCE);
    let front_power = descriptor
        .base_curve
        .unwrap_or_else(|| vogel_base_curve(descriptor.diopters));

    let t = SPECTACLE_THICKNESS / 1000.0;
    let denominator = 1.0 - t * front_power / n;
    if denominator.abs() < 1e-9 {
        return Err(OpticsError::InvalidLensDescriptor(format!(
            "base curve {front_power} D cannot be realised at {SPECTACLE_THICKNESS} mm thickness"
        )));
    }
    let back_power = (descriptor.diopters - front_power) / denominator;

    let back_apex = anterior_apex + vertex_distance;
    let front_apex = back_apex + SPECTACLE_THICKNESS;
    let back_radius = surface_radius(back_power, n, 1.0);
    let front_radius = surface_radius(front_power, 1.0, n);

    Ok([
        vertex_surface("spectacle lens back", back_apex, back_radius, SPECTACLE_SEMI_DIAMETER, n),
        vertex_surface(
            "spectacle lens front",
            front_apex,
            front_radius,
            SPECTACLE_SEMI_DIAMETER,
            medium_index,
        ),
    ])
}

/// Thick-lens power in air of two spherical surfaces (radii in mm, `None`
/// for planes) separated by `thickness` mm of index `n`.
pub fn thick_lens_power(front_radius: Option<f64>, back_radius: Option<f64>, thickness: f64, n: f64) -> f64 {
    let p1 = front_radius.map_or(0.0, |r| surface_power(r, 1.0, n));
    let p2 = back_radius.map_or(0.0, |r| surface_power(r, n, 1.0));
    p1 + p2 - (thickness / 1000.0 / n) * p1 * p2
}
