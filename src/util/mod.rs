//! Result export.

use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::optics::{OpticsError, RayPath};
use crate::optimization::FitResult;

/// Creates `dir` and its parents when missing.
pub fn ensure_output_dir(dir: &Path) -> Result<(), OpticsError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            OpticsError::IOError(format!(
                "Failed to create output directory {}: {e}",
                dir.display()
            ))
        })?;
    }
    Ok(())
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), OpticsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_output_dir(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Writes a fit result as pretty JSON. Non-finite values are written as
/// `null`.
pub fn export_fit_result(result: &FitResult, path: &Path) -> Result<(), OpticsError> {
    write_json(result, path)?;
    info!(
        "Exported fit result (rmse {:.4}) to {}",
        result.rmse,
        path.display()
    );
    Ok(())
}

/// Writes the vertices and directions of a traced ray as pretty JSON.
pub fn export_ray_path(path_points: &RayPath, path: &Path) -> Result<(), OpticsError> {
    write_json(path_points, path)?;
    info!(
        "Exported ray path with {} vertices to {}",
        path_points.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eye::EyePose;
    use nalgebra::Vector3;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join("model_eye_util").join(name)
    }

    #[test]
    fn test_ensure_output_dir_creates_nested() {
        let dir = scratch_dir("nested/a/b");
        let _ = fs::remove_dir_all(&dir);
        ensure_output_dir(&dir).unwrap();
        assert!(dir.is_dir());
        // Existing directories are fine.
        ensure_output_dir(&dir).unwrap();
    }

    #[test]
    fn test_export_fit_result() {
        let result = FitResult {
            pose: EyePose::new(5.0, -3.0, 0.0, 2.0),
            rmse: 0.25,
            ellipse: None,
            at_bound: false,
            restarts: 1,
            evaluations: 40,
            underconstrained: false,
            valid: true,
        };
        let path = scratch_dir("fit").join("result.json");
        export_fit_result(&result, &path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["pose"]["azimuth"], 5.0);
        assert_eq!(json["restarts"], 1);
        assert!(json["ellipse"].is_null());
    }

    #[test]
    fn test_export_invalid_fit_writes_nulls() {
        let path = scratch_dir("fit").join("invalid.json");
        export_fit_result(&FitResult::invalid(), &path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json["rmse"].is_null());
        assert_eq!(json["valid"], false);
    }

    #[test]
    fn test_export_ray_path() {
        let ray_path = RayPath {
            points: vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)],
            directions: vec![Vector3::x(), Vector3::x()],
        };
        let path = scratch_dir("ray").join("path.json");
        export_ray_path(&ray_path, &path).unwrap();

        let loaded: RayPath = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, ray_path);
    }
}
