//! Sequential optical systems.
//!
//! An [`OpticalSystem`] is the ordered list of surfaces a ray crosses, each
//! tagged with the refractive index of the medium the ray enters, preceded by
//! the index of the medium the ray starts in. Systems are assembled from an
//! eye model in [`assemble`], traced in [`trace`], and can be extended with
//! corrective lenses from [`lens`].

use serde::{Deserialize, Serialize};

use crate::quadric::{BoundingBox, Quadric, Side};

pub mod assemble;
pub mod lens;
pub mod trace;

pub use assemble::{assemble, spectacle_system, Medium, OpticalPath};
pub use lens::LensDescriptor;
pub use trace::{trace, trace_with_path, RayPath, TraceError};

/// Number of scalars in a raw surface row: 10 quadric coefficients, side,
/// 6 bounding-box bounds, mandatory flag and refractive index.
pub const SURFACE_ROW_LEN: usize = 19;

#[derive(thiserror::Error, Debug)]
pub enum OpticsError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Invalid lens descriptor: {0}")]
    InvalidLensDescriptor(String),
    #[error("Degenerate bounds: {0}")]
    DegenerateBounds(String),
    #[error("Failed to parse YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("CSV Error: {0}")]
    CsvError(String),
    #[error("JSON Error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for OpticsError {
    fn from(err: std::io::Error) -> Self {
        OpticsError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OpticsError {
    fn from(err: serde_yaml::Error) -> Self {
        OpticsError::YamlError(err.to_string())
    }
}

impl From<csv::Error> for OpticsError {
    fn from(err: csv::Error) -> Self {
        OpticsError::CsvError(err.to_string())
    }
}

impl From<serde_json::Error> for OpticsError {
    fn from(err: serde_json::Error) -> Self {
        OpticsError::JsonError(err.to_string())
    }
}

/// What happens to a ray at a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    Refract,
    Reflect,
}

/// One surface of a sequential system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRecord {
    pub label: String,
    pub quadric: Quadric,
    pub side: Side,
    pub bounding_box: BoundingBox,
    /// A miss on a mandatory surface invalidates the trace; optional surfaces
    /// are skipped when missed.
    pub mandatory: bool,
    /// Index of the medium the ray travels in after this surface.
    pub refractive_index: f64,
    pub interaction: Interaction,
}

impl SurfaceRecord {
    pub fn refracting(
        label: impl Into<String>,
        quadric: Quadric,
        side: Side,
        bounding_box: BoundingBox,
        mandatory: bool,
        refractive_index: f64,
    ) -> Self {
        SurfaceRecord {
            label: label.into(),
            quadric,
            side,
            bounding_box,
            mandatory,
            refractive_index,
            interaction: Interaction::Refract,
        }
    }

    /// Parses a flat row `[A..K, side, x_min, x_max, y_min, y_max, z_min,
    /// z_max, mandatory, index]`. A negative index marks a reflecting surface
    /// whose medium has the absolute value of that index.
    pub fn from_row(label: impl Into<String>, row: &[f64]) -> Result<Self, OpticsError> {
        if row.len() != SURFACE_ROW_LEN {
            return Err(OpticsError::InvalidParams(format!(
                "surface row must have {SURFACE_ROW_LEN} values, got {}",
                row.len()
            )));
        }
        let mut coefficients = [0.0; 10];
        coefficients.copy_from_slice(&row[..10]);
        let side = if row[10] == 1.0 {
            Side::Positive
        } else if row[10] == -1.0 {
            Side::Negative
        } else {
            return Err(OpticsError::InvalidParams(format!(
                "side must be -1 or 1, got {}",
                row[10]
            )));
        };
        let mut bounds = [0.0; 6];
        bounds.copy_from_slice(&row[11..17]);
        let index = row[18];
        let (refractive_index, interaction) = if index < 0.0 {
            (-index, Interaction::Reflect)
        } else {
            (index, Interaction::Refract)
        };

        let record = SurfaceRecord {
            label: label.into(),
            quadric: Quadric::new(coefficients),
            side,
            bounding_box: BoundingBox::from_bounds(bounds),
            mandatory: row[17] != 0.0,
            refractive_index,
            interaction,
        };
        record.validate()?;
        Ok(record)
    }

    /// Inverse of [`SurfaceRecord::from_row`].
    pub fn to_row(&self) -> [f64; SURFACE_ROW_LEN] {
        let mut row = [0.0; SURFACE_ROW_LEN];
        row[..10].copy_from_slice(self.quadric.coefficients());
        row[10] = self.side.sign();
        row[11..17].copy_from_slice(&self.bounding_box.to_bounds());
        row[17] = if self.mandatory { 1.0 } else { 0.0 };
        row[18] = match self.interaction {
            Interaction::Refract => self.refractive_index,
            Interaction::Reflect => -self.refractive_index,
        };
        row
    }

    pub fn validate(&self) -> Result<(), OpticsError> {
        if !self.quadric.is_finite() {
            return Err(OpticsError::InvalidParams(format!(
                "surface '{}' has non-finite coefficients",
                self.label
            )));
        }
        if !self.bounding_box.is_valid() {
            return Err(OpticsError::InvalidParams(format!(
                "surface '{}' has an inverted bounding box",
                self.label
            )));
        }
        validate_index(self.refractive_index, &self.label)
    }
}

fn validate_index(index: f64, label: &str) -> Result<(), OpticsError> {
    if !index.is_finite() || index <= 0.0 {
        return Err(OpticsError::InvalidParams(format!(
            "refractive index for '{label}' must be positive and finite, got {index}"
        )));
    }
    Ok(())
}

/// Ordered surfaces plus the index of the medium the ray starts in.
///
/// Immutable once built; reverse with [`OpticalSystem::reversed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpticalSystem {
    initial_index: f64,
    surfaces: Vec<SurfaceRecord>,
}

impl OpticalSystem {
    pub fn new(initial_index: f64, surfaces: Vec<SurfaceRecord>) -> Result<Self, OpticsError> {
        validate_index(initial_index, "initial medium")?;
        for surface in &surfaces {
            surface.validate()?;
        }
        Ok(OpticalSystem {
            initial_index,
            surfaces,
        })
    }

    /// Builds a system from raw rows; see [`SurfaceRecord::from_row`].
    /// Surfaces are labelled by position.
    pub fn from_rows(initial_index: f64, rows: &[Vec<f64>]) -> Result<Self, OpticsError> {
        let surfaces = rows
            .iter()
            .enumerate()
            .map(|(i, row)| SurfaceRecord::from_row(format!("surface {i}"), row))
            .collect::<Result<Vec<_>, _>>()?;
        OpticalSystem::new(initial_index, surfaces)
    }

    pub fn initial_index(&self) -> f64 {
        self.initial_index
    }

    /// Index of the medium after the last surface.
    pub fn final_index(&self) -> f64 {
        self.surfaces
            .last()
            .map_or(self.initial_index, |s| s.refractive_index)
    }

    pub fn surfaces(&self) -> &[SurfaceRecord] {
        &self.surfaces
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// The same surfaces traversed in the opposite direction.
    ///
    /// `[n₀; (S₁, s₁, n₁); …; (S_k, s_k, n_k)]` becomes
    /// `[n_k; (S_k, −s_k, n_{k−1}); …; (S₁, −s₁, n₀)]`.
    pub fn reversed(&self) -> Self {
        let surfaces = self
            .surfaces
            .iter()
            .enumerate()
            .rev()
            .map(|(i, surface)| {
                let index_before = if i == 0 {
                    self.initial_index
                } else {
                    self.surfaces[i - 1].refractive_index
                };
                SurfaceRecord {
                    side: surface.side.flipped(),
                    refractive_index: index_before,
                    ..surface.clone()
                }
            })
            .collect();
        OpticalSystem {
            initial_index: self.final_index(),
            surfaces,
        }
    }

    /// Appends the surfaces of `other`. Its initial index is ignored, since
    /// the ray arrives in the medium after this system's last surface.
    pub fn concatenated(&self, other: &OpticalSystem) -> Self {
        let mut surfaces = self.surfaces.clone();
        surfaces.extend(other.surfaces.iter().cloned());
        OpticalSystem {
            initial_index: self.initial_index,
            surfaces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn system() -> OpticalSystem {
        let plane = Quadric::plane(&Vector3::new(0.0, 0.0, 1.0), 0.0);
        let sphere = Quadric::ellipsoid(&Vector3::new(5.0, 5.0, 5.0), &Vector3::new(0.0, 0.0, 10.0));
        OpticalSystem::new(
            1.0,
            vec![
                SurfaceRecord::refracting("a", plane, Side::Positive, BoundingBox::unbounded(), true, 1.5),
                SurfaceRecord::refracting("b", sphere, Side::Negative, BoundingBox::unbounded(), false, 1.2),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_reverse_shifts_indices() {
        let s = system();
        let r = s.reversed();
        assert_eq!(r.initial_index(), 1.2);
        assert_eq!(r.surfaces()[0].label, "b");
        assert_eq!(r.surfaces()[0].side, Side::Positive);
        assert_eq!(r.surfaces()[0].refractive_index, 1.5);
        assert_eq!(r.surfaces()[1].refractive_index, 1.0);
        assert!(!r.surfaces()[0].mandatory);
        assert_eq!(r.reversed(), s);
    }

    #[test]
    fn test_row_parsing() {
        let mut row = system().surfaces()[1].to_row().to_vec();
        let parsed = SurfaceRecord::from_row("b", &row).unwrap();
        assert_eq!(parsed, system().surfaces()[1]);

        row[18] = -1.336;
        let mirror = SurfaceRecord::from_row("mirror", &row).unwrap();
        assert_eq!(mirror.interaction, Interaction::Reflect);
        assert_eq!(mirror.refractive_index, 1.336);

        row[10] = 0.0;
        assert!(SurfaceRecord::from_row("bad", &row).is_err());
        assert!(SurfaceRecord::from_row("short", &row[..5]).is_err());
    }

    #[test]
    fn test_system_from_rows() {
        let rows: Vec<Vec<f64>> = system().surfaces().iter().map(|s| s.to_row().to_vec()).collect();
        let parsed = OpticalSystem::from_rows(1.0, &rows).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.surfaces()[1].label, "surface 1");
        assert_eq!(parsed.final_index(), 1.2);
        assert!(OpticalSystem::from_rows(1.0, &[vec![0.0; 3]]).is_err());
    }

    #[test]
    fn test_rejects_invalid_index() {
        let mut record = system().surfaces()[0].clone();
        record.refractive_index = f64::NAN;
        assert!(OpticalSystem::new(1.0, vec![record]).is_err());
        assert!(OpticalSystem::new(0.0, vec![]).is_err());
    }
}
