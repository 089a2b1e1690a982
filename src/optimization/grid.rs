//! Precomputed table of poses and their projected stop ellipses.
//!
//! Built in parallel over a regular grid of poses and persisted as CSV with
//! the header
//! `azimuth,elevation,torsion,stop_radius,center_x,center_y,semi_major,semi_minor,angle`.

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;

use crate::eye::EyePose;
use crate::geometry::Ellipse;
use crate::optics::OpticsError;
use crate::scene::SceneGeometry;

/// One pose and the ellipse it projects to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridEntry {
    pub azimuth: f64,
    pub elevation: f64,
    pub torsion: f64,
    pub stop_radius: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub semi_major: f64,
    pub semi_minor: f64,
    pub angle: f64,
}

impl GridEntry {
    pub fn new(pose: &EyePose, ellipse: &Ellipse) -> Self {
        GridEntry {
            azimuth: pose.azimuth,
            elevation: pose.elevation,
            torsion: pose.torsion,
            stop_radius: pose.stop_radius,
            center_x: ellipse.center_x,
            center_y: ellipse.center_y,
            semi_major: ellipse.semi_major,
            semi_minor: ellipse.semi_minor,
            angle: ellipse.angle,
        }
    }

    pub fn pose(&self) -> EyePose {
        EyePose::new(self.azimuth, self.elevation, self.torsion, self.stop_radius)
    }

    pub fn ellipse(&self) -> Ellipse {
        Ellipse::new(
            self.center_x,
            self.center_y,
            self.semi_major,
            self.semi_minor,
            self.angle,
        )
    }

    /// Distance in pixels between ellipses, over centre and semi-axes.
    fn feature_distance(&self, ellipse: &Ellipse) -> f64 {
        ((self.center_x - ellipse.center_x).powi(2)
            + (self.center_y - ellipse.center_y).powi(2)
            + (self.semi_major - ellipse.semi_major).powi(2)
            + (self.semi_minor - ellipse.semi_minor).powi(2))
        .sqrt()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseGrid {
    entries: Vec<GridEntry>,
}

impl PoseGrid {
    pub fn from_entries(entries: Vec<GridEntry>) -> Self {
        PoseGrid { entries }
    }

    /// Projects every combination of the given values; poses that cannot be
    /// projected are left out.
    pub fn build(
        scene: &SceneGeometry,
        azimuths: &[f64],
        elevations: &[f64],
        radii: &[f64],
        torsion: f64,
    ) -> Self {
        let poses: Vec<EyePose> = azimuths
            .iter()
            .flat_map(|&az| {
                elevations.iter().flat_map(move |&el| {
                    radii.iter().map(move |&r| EyePose::new(az, el, torsion, r))
                })
            })
            .collect();

        let entries: Vec<GridEntry> = poses
            .par_iter()
            .filter_map(|pose| {
                let projection = scene.project_pose(pose).ok()?;
                Some(GridEntry::new(pose, &projection.ellipse))
            })
            .collect();

        info!(
            "Built pose grid with {} of {} poses projectable",
            entries.len(),
            poses.len()
        );
        PoseGrid { entries }
    }

    pub fn entries(&self) -> &[GridEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save_to_csv(&self, path: &str) -> Result<(), OpticsError> {
        let mut writer = csv::Writer::from_writer(File::create(path)?);
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load_from_csv(path: &str) -> Result<Self, OpticsError> {
        let mut reader = csv::Reader::from_path(path)?;
        let entries = reader
            .deserialize()
            .collect::<Result<Vec<GridEntry>, _>>()?;
        Ok(PoseGrid { entries })
    }

    /// The `k` entries closest to `ellipse`, nearest first, with their
    /// distances.
    pub fn nearest(&self, ellipse: &Ellipse, k: usize) -> Vec<(&GridEntry, f64)> {
        let mut ranked: Vec<(&GridEntry, f64)> = self
            .entries
            .iter()
            .map(|entry| (entry, entry.feature_distance(ellipse)))
            .filter(|(_, d)| d.is_finite())
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(k);
        ranked
    }

    /// Inverse-distance weighted mean pose of the `k` nearest entries. An
    /// exact match is returned as is.
    pub fn weighted_pose(&self, ellipse: &Ellipse, k: usize) -> Option<EyePose> {
        let neighbours = self.nearest(ellipse, k);
        let (first, distance) = neighbours.first()?;
        if *distance < f64::EPSILON {
            return Some(first.pose());
        }

        let mut sum = [0.0; 4];
        let mut total = 0.0;
        for (entry, distance) in &neighbours {
            let weight = 1.0 / distance;
            for (s, v) in sum.iter_mut().zip(entry.pose().to_array()) {
                *s += weight * v;
            }
            total += weight;
        }
        Some(EyePose::from_array(sum.map(|s| s / total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eye::EyeModel;
    use crate::scene::SceneConfig;
    use approx::assert_relative_eq;

    fn scene() -> SceneGeometry {
        let eye = EyeModel::load_from_yaml("samples/emmetropic_eye.yaml").unwrap();
        let config = SceneConfig::load_from_yaml("samples/scene.yaml").unwrap();
        SceneGeometry::new(eye, config).unwrap()
    }

    fn entry(azimuth: f64, center_x: f64) -> GridEntry {
        GridEntry::new(
            &EyePose::new(azimuth, 0.0, 0.0, 2.0),
            &Ellipse::new(center_x, 240.0, 40.0, 38.0, 0.0),
        )
    }

    #[test]
    fn test_build_grid() {
        let scene = scene();
        let grid = PoseGrid::build(&scene, &[-10.0, 0.0, 10.0], &[-5.0, 5.0], &[1.5, 3.0], 0.0);
        assert_eq!(grid.len(), 12);
        let origin = grid
            .entries()
            .iter()
            .find(|e| e.azimuth == 0.0 && e.elevation == 5.0 && e.stop_radius == 3.0)
            .unwrap();
        let direct = scene.project_pose(&origin.pose()).unwrap().ellipse;
        assert_eq!(origin.ellipse(), direct);
    }

    #[test]
    fn test_csv_round_trip() {
        let grid = PoseGrid::from_entries(vec![entry(-10.0, 270.0), entry(0.0, 320.0), entry(10.0, 370.0)]);
        let path = std::env::temp_dir().join("model_eye_grid.csv");
        let path = path.to_string_lossy().to_string();
        grid.save_to_csv(&path).unwrap();

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "azimuth,elevation,torsion,stop_radius,center_x,center_y,semi_major,semi_minor,angle"
        ));
        assert_eq!(PoseGrid::load_from_csv(&path).unwrap(), grid);
    }

    #[test]
    fn test_weighted_pose() {
        let grid = PoseGrid::from_entries(vec![entry(-10.0, 270.0), entry(0.0, 320.0), entry(10.0, 370.0)]);

        let exact = grid.weighted_pose(&entry(0.0, 320.0).ellipse(), 4).unwrap();
        assert_eq!(exact.azimuth, 0.0);

        // Halfway between the two right-hand entries.
        let between = Ellipse::new(345.0, 240.0, 40.0, 38.0, 0.0);
        assert_relative_eq!(grid.weighted_pose(&between, 2).unwrap().azimuth, 5.0, epsilon = 1e-12);

        let nearest = grid.nearest(&between, 8);
        assert_eq!(nearest.len(), 3);
        assert!(PoseGrid::default().weighted_pose(&between, 1).is_none());
    }
}
