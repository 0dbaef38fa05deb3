//! End-to-end smoke run over synthetic frames.
//!
//! Fuses two analytic depth frames of a sphere into a fresh grid, renders the
//! fused volume back with the ray-casting pass, and extracts a surface point
//! cloud. Pass an output path to keep the extracted cloud as a CBOR dump.

use std::path::PathBuf;

use anyhow::{Context, Result};
use glam::Vec3;

use depthfusion::{
    ColorImage, DepthImage, Extrinsic, GridOptions, PinholeIntrinsics, VoxelBlockGrid,
};

const DEPTH_SCALE: f32 = 1000.0;
const DEPTH_MAX: f32 = 3.0;
const RADIUS: f32 = 0.5;

/// Analytic depth frame of a sphere at the origin, viewed head-on from `eye`
/// on its -Z axis.
fn sphere_frame(
    rows: usize,
    cols: usize,
    intrinsics: &PinholeIntrinsics,
    eye: Vec3,
) -> Result<DepthImage> {
    let mut data = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let dir = intrinsics.pixel_ray(c as f32, r as f32);
            let a = dir.dot(dir);
            let b = 2.0 * eye.dot(dir);
            let k = eye.dot(eye) - RADIUS * RADIUS;
            let disc = b * b - 4.0 * a * k;
            if disc >= 0.0 {
                let t = (-b - disc.sqrt()) / (2.0 * a);
                if t > 0.0 {
                    data[r * cols + c] = t * DEPTH_SCALE;
                }
            }
        }
    }
    DepthImage::new(rows, cols, data).context("build synthetic depth frame")
}

fn main() -> Result<()> {
    env_logger::init();

    let (rows, cols) = (240, 320);
    let intrinsics = PinholeIntrinsics::new(760.0, 760.0, cols as f32 * 0.5, rows as f32 * 0.5);
    let color = ColorImage::new(rows, cols, vec![[0.6, 0.7, 0.8]; rows * cols])
        .context("build synthetic color frame")?;

    let mut grid = VoxelBlockGrid::with_default_schema(GridOptions {
        voxel_size: 0.01,
        block_resolution: 16,
        block_capacity: 20_000,
        weight_cap: 128.0,
    })
    .context("construct grid")?;

    let eyes = [Vec3::new(0.0, 0.0, -1.5), Vec3::new(0.0, 0.0, -1.3)];
    let mut last_frame = None;
    for (i, &eye) in eyes.iter().enumerate() {
        let depth = sphere_frame(rows, cols, &intrinsics, eye)?;
        let extrinsic = Extrinsic::look_at(eye, Vec3::ZERO, Vec3::Y);
        let coords = grid
            .touched_block_coordinates(&depth, &intrinsics, &extrinsic, DEPTH_SCALE, DEPTH_MAX)
            .context("touch pass")?;
        grid.integrate(
            &coords,
            &depth,
            Some(&color),
            &intrinsics,
            &extrinsic,
            DEPTH_SCALE,
            DEPTH_MAX,
        )
        .context("integration pass")?;
        println!(
            "frame {i}: touched {} blocks, {} active after integration",
            coords.len(),
            grid.num_active_blocks()
        );
        last_frame = Some((coords, extrinsic));
    }
    let (last_coords, last_extrinsic) = last_frame.context("at least one frame was fused")?;

    let maps = grid
        .ray_cast(
            &last_coords,
            &intrinsics,
            &last_extrinsic,
            cols,
            rows,
            DEPTH_SCALE,
            0.1,
            DEPTH_MAX,
            1.0,
        )
        .context("ray-casting pass")?;
    let hits = maps.depth.iter().filter(|&&d| d > 0.0).count();
    let mean_depth_m: f32 = if hits > 0 {
        maps.depth.iter().filter(|&&d| d > 0.0).sum::<f32>() / hits as f32 / DEPTH_SCALE
    } else {
        0.0
    };
    println!(
        "ray cast: {hits}/{} pixels hit the surface, mean depth {mean_depth_m:.3} m",
        rows * cols
    );

    let cloud = grid
        .extract_surface_points(500_000, 1.0)
        .context("extraction pass")?;
    println!("extracted {} surface points", cloud.len());

    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        cloud.save(&path)?;
        println!("saved point cloud to {}", path.display());
    }

    let stats = grid.stats();
    println!(
        "stats: {} blocks allocated, {} voxel updates, {} rays marched, {} points emitted",
        stats.blocks_allocated,
        stats.voxels_integrated,
        stats.rays_marched,
        stats.surface_points_emitted
    );

    Ok(())
}
