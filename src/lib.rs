//! Model Eye
//!
//! Geometric optics of a schematic eye seen by a camera. The library covers:
//! - Quadric surfaces with ray intersection and geodetic coordinates
//! - Eye models with cornea, crystalline lens, retina and an elliptical stop
//! - Sequential optical systems, including contact and spectacle lenses
//! - Forward projection of the stop boundary and the corneal glint
//! - Bounded multi-start estimation of eye pose from observed pupil points

pub mod eye;
pub mod geometry;
pub mod optics;
pub mod optimization;
pub mod quadric;
pub mod scene;
pub mod util;

// Re-export commonly used types
pub use eye::{EyeModel, EyePose, EyeSurface, Stop, StopEccentricity};
pub use geometry::{fit_ellipse, Ellipse};
pub use optics::{
    assemble, trace, LensDescriptor, Medium, OpticalPath, OpticalSystem, OpticsError, RayPath,
    SurfaceRecord, TraceError,
};
pub use optimization::{fit_pose, FitResult, FitSettings, PoseBounds, PoseFitter, PoseGrid};
pub use quadric::{Quadric, Ray, Side};
pub use scene::{ProjectionError, SceneCamera, SceneConfig, SceneGeometry, StopProjection};
