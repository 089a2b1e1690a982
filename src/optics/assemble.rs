//! Builds sequential optical systems from an eye model.

use log::info;
use serde::{Deserialize, Serialize};

use super::lens::{contact_lens, spectacle_lens, LensDescriptor};
use super::{Interaction, OpticalSystem, OpticsError, SurfaceRecord};
use crate::eye::EyeModel;

/// Medium surrounding the eye.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    #[default]
    Air,
    Water,
    Custom(f64),
}

impl Medium {
    pub fn refractive_index(&self) -> f64 {
        match *self {
            Medium::Air => 1.0,
            Medium::Water => 1.333,
            Medium::Custom(n) => n,
        }
    }
}

/// Which stretch of the eye a system covers, and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpticalPath {
    /// Retina through the crystalline lens to the aqueous humour.
    RetinaToStop,
    /// Aqueous humour through the cornea and any corrective lenses.
    StopToCamera,
    RetinaToCamera,
    /// [`OpticalPath::RetinaToCamera`] reversed.
    CameraToRetina,
    /// From the camera, off the outermost ocular surface and back.
    Glint,
}

/// Assembles the system for `path`.
///
/// Surfaces follow physiological order from the retina outwards, each tagged
/// with the medium it leads into: vitreous, lens cortex and nucleus shells,
/// aqueous, cornea, then tear film (when a contact lens is worn) and the
/// surrounding medium. Corrective lenses add a back and a front surface each.
/// Every surface is placed for primary gaze; a rotated eye keeps its
/// spectacles where [`spectacle_system`] puts them.
///
/// # Errors
///
/// [`OpticsError::InvalidLensDescriptor`] for malformed lens descriptors and
/// [`OpticsError::InvalidParams`] for an invalid eye model or medium.
pub fn assemble(
    eye: &EyeModel,
    path: OpticalPath,
    medium: Medium,
    contact: Option<&LensDescriptor>,
    spectacle: Option<&LensDescriptor>,
) -> Result<OpticalSystem, OpticsError> {
    eye.validate()?;
    let medium_index = checked_index(medium)?;

    let system = match path {
        OpticalPath::RetinaToStop => OpticalSystem::new(eye.indices.vitreous, eye.posterior_records()?)?,
        OpticalPath::StopToCamera => OpticalSystem::new(
            eye.indices.aqueous,
            anterior_records(eye, medium_index, contact, spectacle)?,
        )?,
        OpticalPath::RetinaToCamera => retina_to_camera(eye, medium_index, contact, spectacle)?,
        OpticalPath::CameraToRetina => retina_to_camera(eye, medium_index, contact, spectacle)?.reversed(),
        OpticalPath::Glint => glint(eye, medium_index, contact, spectacle)?,
    };

    info!(
        "Assembled {:?} system for '{}' with {} surfaces",
        path,
        eye.label,
        system.len()
    );
    Ok(system)
}

/// The spectacle lens alone, in front of the outermost ocular surface at
/// primary gaze, for light leaving the eye. Scene-fixed: it does not turn
/// with the eye.
///
/// # Errors
///
/// As for [`assemble`].
pub fn spectacle_system(
    eye: &EyeModel,
    medium: Medium,
    contact: Option<&LensDescriptor>,
    spectacle: &LensDescriptor,
) -> Result<OpticalSystem, OpticsError> {
    eye.validate()?;
    let medium_index = checked_index(medium)?;
    let (_, ocular) = ocular_records(eye, medium_index, contact)?;
    let apex = outermost_apex(std::slice::from_ref(&ocular));
    let system = OpticalSystem::new(medium_index, spectacle_lens(apex, spectacle, medium_index)?.to_vec())?;
    info!(
        "Assembled {:+.2} D spectacle system for '{}' in front of p1 = {apex:.3} mm",
        spectacle.diopters, eye.label
    );
    Ok(system)
}

fn checked_index(medium: Medium) -> Result<f64, OpticsError> {
    let index = medium.refractive_index();
    if !index.is_finite() || index < 1.0 {
        return Err(OpticsError::InvalidParams(format!(
            "medium index must be at least 1, got {index}"
        )));
    }
    Ok(index)
}

fn retina_to_camera(
    eye: &EyeModel,
    medium_index: f64,
    contact: Option<&LensDescriptor>,
    spectacle: Option<&LensDescriptor>,
) -> Result<OpticalSystem, OpticsError> {
    let mut surfaces = eye.posterior_records()?;
    surfaces.extend(anterior_records(eye, medium_index, contact, spectacle)?);
    OpticalSystem::new(eye.indices.vitreous, surfaces)
}

/// Cornea, then contact lens, then spectacle lens.
fn anterior_records(
    eye: &EyeModel,
    medium_index: f64,
    contact: Option<&LensDescriptor>,
    spectacle: Option<&LensDescriptor>,
) -> Result<Vec<SurfaceRecord>, OpticsError> {
    let (mut surfaces, ocular) = ocular_records(eye, medium_index, contact)?;
    surfaces.push(ocular);
    if let Some(descriptor) = spectacle {
        let apex = outermost_apex(&surfaces);
        surfaces.extend(spectacle_lens(apex, descriptor, medium_index)?);
    }
    Ok(surfaces)
}

/// Corneal and contact lens records, split into everything behind the
/// outermost ocular surface and that surface itself.
fn ocular_records(
    eye: &EyeModel,
    medium_index: f64,
    contact: Option<&LensDescriptor>,
) -> Result<(Vec<SurfaceRecord>, SurfaceRecord), OpticsError> {
    let mut surfaces = match contact {
        Some(descriptor) => {
            let mut records = eye.corneal_records(eye.indices.tear_film)?;
            records.extend(contact_lens(eye, descriptor, medium_index)?);
            records
        }
        None => eye.corneal_records(medium_index)?,
    };
    let outermost = surfaces
        .pop()
        .ok_or_else(|| OpticsError::InvalidParams("eye model has no cornea".to_string()))?;
    Ok((surfaces, outermost))
}

/// Vertex position along `p1` of the last surface in `surfaces`.
fn outermost_apex(surfaces: &[SurfaceRecord]) -> f64 {
    use crate::quadric::Ray;
    use nalgebra::Vector3;

    surfaces
        .last()
        .and_then(|surface| {
            let ray = Ray::new(Vector3::new(1000.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0));
            surface
                .quadric
                .intersect_ray(&ray, surface.side.flipped(), &surface.bounding_box)
        })
        .map_or(0.0, |(point, _)| point.x)
}

/// Camera → spectacle → reflection at the outermost ocular surface →
/// spectacle → camera.
fn glint(
    eye: &EyeModel,
    medium_index: f64,
    contact: Option<&LensDescriptor>,
    spectacle: Option<&LensDescriptor>,
) -> Result<OpticalSystem, OpticsError> {
    let (_, ocular) = ocular_records(eye, medium_index, contact)?;

    let outer = match spectacle {
        Some(descriptor) => {
            let apex = outermost_apex(std::slice::from_ref(&ocular));
            spectacle_lens(apex, descriptor, medium_index)?.to_vec()
        }
        None => Vec::new(),
    };
    let outer = OpticalSystem::new(medium_index, outer)?;

    let mirror = SurfaceRecord {
        label: format!("{} (reflection)", ocular.label),
        side: ocular.side.flipped(),
        refractive_index: medium_index,
        interaction: Interaction::Reflect,
        ..ocular
    };
    let mirror = OpticalSystem::new(medium_index, vec![mirror])?;

    Ok(outer.reversed().concatenated(&mirror).concatenated(&outer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optics::trace::trace;
    use crate::quadric::Ray;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn sample_eye() -> EyeModel {
        EyeModel::load_from_yaml("samples/emmetropic_eye.yaml").unwrap()
    }

    #[test]
    fn test_surface_order_and_indices() {
        let eye = sample_eye();
        let system = assemble(&eye, OpticalPath::RetinaToCamera, Medium::Air, None, None).unwrap();
        assert_eq!(system.len(), 1 + eye.lens.len() + eye.cornea.len());
        assert_eq!(system.initial_index(), eye.indices.vitreous);
        assert_eq!(system.surfaces()[0].label, eye.retina.label);
        assert_eq!(system.final_index(), 1.0);

        let stop = assemble(&eye, OpticalPath::StopToCamera, Medium::Water, None, None).unwrap();
        assert_eq!(stop.len(), eye.cornea.len());
        assert_eq!(stop.initial_index(), eye.indices.aqueous);
        assert_eq!(stop.final_index(), 1.333);

        let posterior = assemble(&eye, OpticalPath::RetinaToStop, Medium::Air, None, None).unwrap();
        assert_eq!(posterior.final_index(), eye.indices.aqueous);
    }

    #[test]
    fn test_camera_to_retina_is_reversed() {
        let eye = sample_eye();
        let forward = assemble(&eye, OpticalPath::RetinaToCamera, Medium::Air, None, None).unwrap();
        let backward = assemble(&eye, OpticalPath::CameraToRetina, Medium::Air, None, None).unwrap();
        assert_eq!(backward, forward.reversed());
    }

    #[test]
    fn test_corrective_lenses_add_surfaces() {
        let eye = sample_eye();
        let contact = LensDescriptor::new(-2.0);
        let spectacle = LensDescriptor::new(-3.0);
        let system = assemble(
            &eye,
            OpticalPath::StopToCamera,
            Medium::Air,
            Some(&contact),
            Some(&spectacle),
        )
        .unwrap();
        assert_eq!(system.len(), eye.cornea.len() + 4);
        let outer_cornea = &system.surfaces()[eye.cornea.len() - 1];
        assert_eq!(outer_cornea.refractive_index, eye.indices.tear_film);
        assert_eq!(system.final_index(), 1.0);

        // An axial ray passes straight through everything.
        let ray = Ray::new(Vector3::new(-3.5, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0));
        let (output, path) = trace(&ray, &system).unwrap();
        assert_eq!(path.len(), system.len() + 1);
        assert_relative_eq!(output.direction, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_malformed_descriptor_rejected() {
        let eye = sample_eye();
        let bad = LensDescriptor {
            refractive_index: Some(0.5),
            ..LensDescriptor::new(1.0)
        };
        let result = assemble(&eye, OpticalPath::StopToCamera, Medium::Air, Some(&bad), None);
        assert!(matches!(result, Err(OpticsError::InvalidLensDescriptor(_))));
    }

    #[test]
    fn test_glint_reflects_back_to_camera() {
        let eye = sample_eye();
        let system = assemble(&eye, OpticalPath::Glint, Medium::Air, None, None).unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system.surfaces()[0].interaction, Interaction::Reflect);

        let ray = Ray::new(Vector3::new(100.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0));
        let (output, _) = trace(&ray, &system).unwrap();
        assert_relative_eq!(output.origin, Vector3::zeros(), epsilon = 1e-9);
        assert_relative_eq!(output.direction, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);

        let spectacle = LensDescriptor::new(2.0);
        let with_glasses =
            assemble(&eye, OpticalPath::Glint, Medium::Air, None, Some(&spectacle)).unwrap();
        assert_eq!(with_glasses.len(), 5);
        let (output, _) = trace(&ray, &with_glasses).unwrap();
        assert_relative_eq!(output.direction, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_spectacle_system_matches_assembled_surfaces() {
        let eye = sample_eye();
        let spectacle = LensDescriptor::new(-3.0);
        let full = assemble(&eye, OpticalPath::StopToCamera, Medium::Air, None, Some(&spectacle)).unwrap();
        let lens = spectacle_system(&eye, Medium::Air, None, &spectacle).unwrap();
        assert_eq!(lens.len(), 2);
        assert_eq!(lens.initial_index(), 1.0);
        assert_eq!(lens.surfaces(), &full.surfaces()[eye.cornea.len()..]);
        assert!(spectacle_system(&eye, Medium::Custom(0.5), None, &spectacle).is_err());
    }

    #[test]
    fn test_rejects_sub_unity_medium() {
        let eye = sample_eye();
        let result = assemble(&eye, OpticalPath::StopToCamera, Medium::Custom(0.5), None, None);
        assert!(result.is_err());
    }
}
