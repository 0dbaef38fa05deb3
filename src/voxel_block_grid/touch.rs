//! Visibility/touch pass.
//!
//! Computes the deduplicated set of block coordinates a new observation could
//! affect, without allocating anything in the permanent index. Depth frames
//! are subsampled, unprojected, inflated by the truncation margin along the
//! viewing ray, and the resulting frustum segments are rasterized into block
//! coordinates through the scratch set. Point clouds rasterize each point's
//! truncation-margin neighborhood instead.

use glam::Vec3;

use crate::camera::{Extrinsic, PinholeIntrinsics};
use crate::image::DepthImage;

use super::block_index::TouchScratch;
use super::parallel_iter;
use super::types::BlockCoord;

/// Stride between sampled depth pixels.
pub(crate) const DEPTH_DOWN_FACTOR: usize = 4;

/// Oversubscription multiplier when sizing the scratch set from an image.
pub(crate) const EST_SAMPLE_MULTIPLIER: usize = 4;

/// Expected touched-block neighborhood per point when sizing from a cloud.
pub(crate) const EST_NEIGHBOR_MULTIPLIER: usize = 8;

pub(crate) struct TouchParams {
    pub voxel_size: f32,
    pub block_resolution: usize,
    pub trunc_margin: f32,
    pub depth_scale: f32,
    pub depth_max: f32,
}

/// Rasterize the frustum segments of a subsampled depth frame into block
/// coordinates. Returns the deduplicated set in unspecified order.
pub(crate) fn depth_touch(
    scratch: &TouchScratch,
    depth: &DepthImage,
    intrinsics: &PinholeIntrinsics,
    extrinsic: &Extrinsic,
    params: &TouchParams,
) -> Vec<BlockCoord> {
    let block_size = params.voxel_size * params.block_resolution as f32;
    let half_block = 0.5 * block_size;
    let cam_to_world = extrinsic.camera_to_world();

    let rows: Vec<usize> = (0..depth.rows()).step_by(DEPTH_DOWN_FACTOR).collect();
    parallel_iter::map_vec(rows, |r| {
        for c in (0..depth.cols()).step_by(DEPTH_DOWN_FACTOR) {
            let d = depth.get(r, c) / params.depth_scale;
            if d <= 0.0 || d > params.depth_max {
                continue;
            }
            let dir = intrinsics.pixel_ray(c as f32, r as f32);
            let t_min = (d - params.trunc_margin).max(0.0);
            let t_max = d + params.trunc_margin;
            // Half-block steps along the inflated segment; the endpoint is
            // always sampled.
            let steps = ((t_max - t_min) / half_block).ceil() as i32;
            for i in 0..=steps {
                let t = (t_min + i as f32 * half_block).min(t_max);
                let p = cam_to_world.transform_point3(dir * t);
                scratch.insert(BlockCoord::of_world_point(p, block_size));
            }
        }
    });

    scratch.coordinates()
}

/// Rasterize each point's truncation-margin neighborhood into block
/// coordinates. Returns the deduplicated set in unspecified order.
pub(crate) fn point_cloud_touch(
    scratch: &TouchScratch,
    points: &[Vec3],
    block_size: f32,
    trunc_margin: f32,
) -> Vec<BlockCoord> {
    parallel_iter::map_vec(points.to_vec(), |p| {
        let lo = BlockCoord::of_world_point(p - Vec3::splat(trunc_margin), block_size);
        let hi = BlockCoord::of_world_point(p + Vec3::splat(trunc_margin), block_size);
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    scratch.insert(BlockCoord::new(x, y, z));
                }
            }
        }
    });

    scratch.coordinates()
}
