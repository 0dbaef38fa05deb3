//! TSDF integration pass.
//!
//! Fuses one depth (and optionally color) frame into the touched blocks.
//! Each voxel center is projected into the frame, the projective signed
//! distance is clamped to the truncation band, and TSDF/color are updated as
//! weighted running averages with a saturating weight cap.
//!
//! Parallelism is partitioned by block ownership: each worker owns the
//! mutable payload chunks of exactly one block slot, so the per-voxel
//! read-modify-write never contends and needs no atomics.

use std::collections::HashMap;

use glam::IVec3;

use crate::camera::{Extrinsic, PinholeIntrinsics};
use crate::image::{ColorImage, DepthImage};

use super::parallel_iter;
use super::types::{voxel_center, BlockCoord, FusionBuffersMut};

pub(crate) struct IntegrateParams {
    pub voxel_size: f32,
    pub block_resolution: usize,
    pub trunc: f32,
    pub depth_scale: f32,
    pub depth_max: f32,
    pub weight_cap: f32,
}

/// Mutable payload of one touched block.
struct BlockWork<'a> {
    coord: BlockCoord,
    tsdf: &'a mut [f32],
    weight: &'a mut [f32],
    color: Option<&'a mut [f32]>,
}

/// Integrate one frame into the given (already activated) blocks.
/// Returns the number of voxels updated.
pub(crate) fn integrate_blocks<'a>(
    touched: &[(BlockCoord, u32)],
    bufs: FusionBuffersMut<'a>,
    depth: &DepthImage,
    color: Option<&ColorImage>,
    intrinsics: &PinholeIntrinsics,
    extrinsic: &Extrinsic,
    params: &IntegrateParams,
) -> u64 {
    let res = params.block_resolution;
    let res3 = res * res * res;

    let slot_to_coord: HashMap<usize, BlockCoord> = touched
        .iter()
        .map(|(coord, slot)| (*slot as usize, *coord))
        .collect();

    // Carve the flat buffers into per-slot chunks; chunk i belongs to slot i,
    // so picking the touched chunks partitions writers by block.
    let FusionBuffersMut {
        tsdf,
        weight,
        color: color_buf,
    } = bufs;
    let mut color_chunks: Box<dyn Iterator<Item = Option<&'a mut [f32]>> + 'a> = match color_buf {
        Some(buf) => Box::new(buf.chunks_mut(3 * res3).map(Some)),
        None => Box::new(std::iter::repeat_with(|| None)),
    };

    let mut work = Vec::with_capacity(touched.len());
    for (slot, (tsdf_chunk, weight_chunk)) in
        tsdf.chunks_mut(res3).zip(weight.chunks_mut(res3)).enumerate()
    {
        let color_chunk = color_chunks.next().flatten();
        if let Some(&coord) = slot_to_coord.get(&slot) {
            work.push(BlockWork {
                coord,
                tsdf: tsdf_chunk,
                weight: weight_chunk,
                color: color_chunk,
            });
        }
    }

    let updated = parallel_iter::map_vec(work, |block| {
        integrate_block(block, depth, color, intrinsics, extrinsic, params)
    });
    updated.into_iter().sum()
}

fn integrate_block(
    mut block: BlockWork<'_>,
    depth: &DepthImage,
    color: Option<&ColorImage>,
    intrinsics: &PinholeIntrinsics,
    extrinsic: &Extrinsic,
    params: &IntegrateParams,
) -> u64 {
    let res = params.block_resolution;
    let base = block.coord.voxel_base(res);
    let rows = depth.rows() as i64;
    let cols = depth.cols() as i64;
    let mut updated = 0u64;

    for z in 0..res {
        for y in 0..res {
            for x in 0..res {
                let v = base + IVec3::new(x as i32, y as i32, z as i32);
                let p_cam = extrinsic.to_camera(voxel_center(v, params.voxel_size));
                let Some((u, v_px)) = intrinsics.project(p_cam) else {
                    continue;
                };
                let (ui, vi) = (u.round() as i64, v_px.round() as i64);
                if ui < 0 || vi < 0 || ui >= cols || vi >= rows {
                    continue;
                }

                let d = depth.get(vi as usize, ui as usize) / params.depth_scale;
                if d <= 0.0 || d > params.depth_max {
                    continue;
                }

                let sdf = d - p_cam.z;
                if sdf < -params.trunc {
                    // Far behind the observed surface: leave the estimate alone.
                    continue;
                }
                let sdf = sdf.min(params.trunc);

                let lin = (z * res + y) * res + x;
                let w_old = block.weight[lin];
                let inv_w = 1.0 / (w_old + 1.0);
                block.tsdf[lin] = (block.tsdf[lin] * w_old + sdf) * inv_w;
                if let (Some(color_chunk), Some(color_img)) = (block.color.as_deref_mut(), color) {
                    let rgb = color_img.get(vi as usize, ui as usize);
                    for ch in 0..3 {
                        let i = lin * 3 + ch;
                        color_chunk[i] = (color_chunk[i] * w_old + rgb[ch]) * inv_w;
                    }
                }
                block.weight[lin] = (w_old + 1.0).min(params.weight_cap);
                updated += 1;
            }
        }
    }

    updated
}
