//! Pose Fitting Example
//!
//! Projects the stop of a model eye at a known pose, samples the projected
//! boundary as observations and recovers the pose with the bounded
//! multi-start estimator.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example fit_pose -- \
//!   --eye samples/emmetropic_eye.yaml \
//!   --scene samples/scene.yaml \
//!   --azimuth 12 --elevation -8 --stop-radius 2.2 \
//!   --output output/fit_result.json
//! ```

use clap::Parser;
use log::info;
use model_eye::eye::{EyeModel, EyePose};
use model_eye::geometry::{distances_to_ellipse, ResidualStats};
use model_eye::optimization::{FitSettings, PoseBounds, PoseFitter, PoseGrid};
use model_eye::scene::{SceneConfig, SceneGeometry};
use model_eye::util;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Synthesise pupil observations and fit the eye pose
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Eye model YAML
    #[arg(short = 'e', long, default_value = "samples/emmetropic_eye.yaml")]
    eye: PathBuf,

    /// Scene configuration YAML
    #[arg(short = 's', long, default_value = "samples/scene.yaml")]
    scene: PathBuf,

    /// True azimuth in degrees
    #[arg(long, default_value_t = 12.0, allow_hyphen_values = true)]
    azimuth: f64,

    /// True elevation in degrees
    #[arg(long, default_value_t = -8.0, allow_hyphen_values = true)]
    elevation: f64,

    /// True stop radius in mm
    #[arg(long, default_value_t = 2.2)]
    stop_radius: f64,

    /// Number of observed boundary points
    #[arg(short = 'n', long, default_value_t = 32)]
    num_points: usize,

    /// Maximum number of random restarts
    #[arg(long, default_value_t = 3)]
    restarts: usize,

    /// Seed a pose grid with this angular step in degrees
    #[arg(long)]
    grid_step: Option<f64>,

    /// Write the fit result as JSON
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn path_str(path: &Path) -> Result<&str, Box<dyn std::error::Error>> {
    Ok(path.to_str().ok_or("Invalid path string")?)
}

fn build_grid(scene: &SceneGeometry, bounds: &PoseBounds, step: f64) -> PoseGrid {
    let range = |lo: f64, hi: f64, step: f64| -> Vec<f64> {
        let count = ((hi - lo) / step).floor() as usize;
        (0..=count).map(|i| lo + i as f64 * step).collect()
    };
    PoseGrid::build(
        scene,
        &range(bounds.lower[0], bounds.upper[0], step),
        &range(bounds.lower[1], bounds.upper[1], step),
        &range(bounds.lower[3], bounds.upper[3], 0.5),
        bounds.lower[2],
    )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    println!("👁  MODEL EYE POSE FIT");
    println!("=====================");

    let eye = EyeModel::load_from_yaml(path_str(&cli.eye)?)?;
    let config = SceneConfig::load_from_yaml(path_str(&cli.scene)?)?;
    let scene = SceneGeometry::new(eye, config)?;
    info!("Loaded eye '{}' from {:?}", scene.eye().label, cli.eye);

    let truth = EyePose::new(cli.azimuth, cli.elevation, 0.0, cli.stop_radius);
    let projection = scene.project_pose(&truth)?;
    let observed = projection.ellipse.sample(cli.num_points);
    println!(
        "Synthesised {} points on ellipse centre ({:.2}, {:.2}), axes {:.2} x {:.2} px",
        observed.len(),
        projection.ellipse.center_x,
        projection.ellipse.center_y,
        projection.ellipse.semi_major,
        projection.ellipse.semi_minor
    );

    let bounds = PoseBounds::default();
    if cli.grid_step.is_some_and(|step| step <= 0.0) {
        return Err("Grid step must be positive".into());
    }
    let grid = cli.grid_step.map(|step| build_grid(&scene, &bounds, step));
    let mut fitter = PoseFitter::new(&scene).with_settings(FitSettings::default());
    if let Some(grid) = grid.as_ref() {
        println!("Pose grid with {} entries", grid.len());
        fitter = fitter.with_grid(grid);
    }

    let start = Instant::now();
    let result = fitter.fit(&observed, &bounds, None, 1e-2, 1e-1, cli.restarts)?;
    let elapsed = start.elapsed();

    println!("\n📊 Results");
    println!("  true pose:   {:?}", truth.to_array());
    println!("  fitted pose: {:?}", result.pose.to_array());
    println!("  rmse:        {:.6} px", result.rmse);
    println!("  restarts:    {}", result.restarts);
    println!("  evaluations: {}", result.evaluations);
    println!("  at bound:    {}", result.at_bound);
    println!("  time:        {:.2?}", elapsed);
    let stats = result
        .ellipse
        .as_ref()
        .and_then(|ellipse| ResidualStats::from_residuals(&distances_to_ellipse(ellipse, &observed)));
    if let Some(stats) = stats {
        println!(
            "  residuals:   max {:.2e}, mean {:.2e}, median {:.2e} px",
            stats.max, stats.mean, stats.median
        );
    }

    if let Some(output) = cli.output.as_ref() {
        util::export_fit_result(&result, output)?;
        println!("\n💾 Fit result written to {}", output.display());
    }
    Ok(())
}
