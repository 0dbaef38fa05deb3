//! Ray-casting pass.
//!
//! Renders vertex/depth/color/normal maps for a virtual camera by marching
//! rays through the sparse block structure. A per-tile `[depth_min,
//! depth_max]` range map, estimated from the projected extents of the
//! candidate blocks, bounds the march; rays outside every block's projection
//! are never marched at all. The first TSDF sign change along a ray is the
//! surface; depth, color and a gradient normal are trilinearly interpolated
//! there, and the 8-voxel interpolation footprint is recorded in the
//! `mask`/`ratio`/`index` maps for replay against other attribute buffers.
//!
//! Unallocated or unobserved voxels read as "unknown", not "empty": a
//! crossing is only reported between two consecutively observed samples.

use glam::{IVec3, Mat4, Vec3};

use crate::camera::{Extrinsic, PinholeIntrinsics};

use super::parallel_iter;
use super::types::{BlockCoord, RangeMap, RayCastMaps, VolumeSampler};

/// Tile size of the range map, in pixels.
pub(crate) const RANGE_DOWN_FACTOR: usize = 8;

pub(crate) struct RayCastParams {
    pub voxel_size: f32,
    pub block_resolution: usize,
    pub depth_scale: f32,
    pub depth_min: f32,
    pub depth_max: f32,
    pub weight_threshold: f32,
    pub width: usize,
    pub height: usize,
}

/// Conservative per-tile marching bounds from the candidate blocks.
///
/// Each block's 8 corners are projected; the block then widens the
/// `[z_min, z_max]` interval of every tile its pixel AABB overlaps. Tiles
/// nothing projects into keep an empty interval.
pub(crate) fn estimate_range(
    block_coords: &[BlockCoord],
    intrinsics: &PinholeIntrinsics,
    extrinsic: &Extrinsic,
    params: &RayCastParams,
) -> RangeMap {
    let df = RANGE_DOWN_FACTOR;
    let tile_rows = (params.height + df - 1) / df;
    let tile_cols = (params.width + df - 1) / df;
    // min starts high and max starts low, so an untouched tile stays empty.
    let mut data = vec![[params.depth_max, params.depth_min]; tile_rows * tile_cols];

    let block_size = params.voxel_size * params.block_resolution as f32;
    for coord in block_coords {
        let corner0 = coord.min_corner(block_size);
        let mut u_min = f32::MAX;
        let mut u_max = f32::MIN;
        let mut v_min = f32::MAX;
        let mut v_max = f32::MIN;
        let mut z_min = f32::MAX;
        let mut z_max = f32::MIN;
        let mut visible = false;
        for k in 0..8 {
            let offset = Vec3::new(
                (k & 1) as f32,
                ((k >> 1) & 1) as f32,
                ((k >> 2) & 1) as f32,
            );
            let p = extrinsic.to_camera(corner0 + offset * block_size);
            let Some((u, v)) = intrinsics.project(p) else {
                continue;
            };
            visible = true;
            u_min = u_min.min(u);
            u_max = u_max.max(u);
            v_min = v_min.min(v);
            v_max = v_max.max(v);
            z_min = z_min.min(p.z);
            z_max = z_max.max(p.z);
        }
        if !visible || u_max < 0.0 || v_max < 0.0 {
            continue;
        }
        if u_min >= params.width as f32 || v_min >= params.height as f32 {
            continue;
        }
        let z_min = z_min.max(params.depth_min);
        let z_max = z_max.min(params.depth_max);
        if z_min > z_max {
            continue;
        }

        let c0 = ((u_min.max(0.0) as usize) / df).min(tile_cols - 1);
        let c1 = ((u_max.max(0.0) as usize) / df).min(tile_cols - 1);
        let r0 = ((v_min.max(0.0) as usize) / df).min(tile_rows - 1);
        let r1 = ((v_max.max(0.0) as usize) / df).min(tile_rows - 1);
        for tr in r0..=r1 {
            for tc in c0..=c1 {
                let tile = &mut data[tr * tile_cols + tc];
                tile[0] = tile[0].min(z_min);
                tile[1] = tile[1].max(z_max);
            }
        }
    }

    RangeMap {
        tile_rows,
        tile_cols,
        down_factor: df,
        data,
    }
}

#[derive(Clone, Copy)]
struct PixelResult {
    vertex: [f32; 3],
    depth: f32,
    color: [f32; 3],
    normal: [f32; 3],
    mask: [bool; 8],
    ratio: [f32; 8],
    index: [i64; 8],
    marched: bool,
}

impl Default for PixelResult {
    fn default() -> Self {
        Self {
            vertex: [0.0; 3],
            depth: 0.0,
            color: [0.0; 3],
            normal: [0.0; 3],
            mask: [false; 8],
            ratio: [0.0; 8],
            index: [0; 8],
            marched: false,
        }
    }
}

/// March every output pixel. Returns the rendered maps and the number of
/// rays that were actually marched.
pub(crate) fn ray_cast(
    sampler: &VolumeSampler<'_>,
    range: RangeMap,
    intrinsics: &PinholeIntrinsics,
    extrinsic: &Extrinsic,
    params: &RayCastParams,
) -> (RayCastMaps, u64) {
    let (width, height) = (params.width, params.height);
    let pose = extrinsic.camera_to_world();

    let results = parallel_iter::map_range(0..height * width, |i| {
        let (row, col) = (i / width, i % width);
        cast_pixel(row, col, sampler, &range, intrinsics, &pose, params)
    });

    let marched = results.iter().filter(|r| r.marched).count() as u64;

    let n = width * height;
    let mut maps = RayCastMaps {
        width,
        height,
        vertex: Vec::with_capacity(n),
        depth: Vec::with_capacity(n),
        color: Vec::with_capacity(n),
        normal: Vec::with_capacity(n),
        mask: Vec::with_capacity(n),
        ratio: Vec::with_capacity(n),
        index: Vec::with_capacity(n),
        range,
    };
    for r in results {
        maps.vertex.push(r.vertex);
        maps.depth.push(r.depth);
        maps.color.push(r.color);
        maps.normal.push(r.normal);
        maps.mask.push(r.mask);
        maps.ratio.push(r.ratio);
        maps.index.push(r.index);
    }
    (maps, marched)
}

fn cast_pixel(
    row: usize,
    col: usize,
    sampler: &VolumeSampler<'_>,
    range: &RangeMap,
    intrinsics: &PinholeIntrinsics,
    pose: &Mat4,
    params: &RayCastParams,
) -> PixelResult {
    let [t_min, t_max] = range.for_pixel(row, col);
    if t_min >= t_max {
        return PixelResult::default();
    }

    let dir_cam = intrinsics.pixel_ray(col as f32, row as f32);
    let origin = pose.transform_point3(Vec3::ZERO);
    // Unit camera z, so advancing t advances z-depth by t.
    let dir = pose.transform_vector3(dir_cam);

    let mut result = PixelResult {
        marched: true,
        ..Default::default()
    };

    let mut prev: Option<(f32, f32)> = None;
    let mut t = t_min;
    while t <= t_max {
        let p = origin + dir * t;
        let v = (p / params.voxel_size).floor().as_ivec3();
        let cur = sampler.observed_tsdf(v);
        if let (Some((t_prev, tsdf_prev)), Some(tsdf_cur)) = (prev, cur) {
            if tsdf_prev > 0.0 && tsdf_cur <= 0.0 {
                let lerp = tsdf_prev / (tsdf_prev - tsdf_cur);
                let t_surf = t_prev + (t - t_prev) * lerp;
                shade_surface(&mut result, origin, dir, t_surf, sampler, params);
                return result;
            }
        }
        prev = cur.map(|tsdf| (t, tsdf));
        t += params.voxel_size;
    }

    result
}

/// Trilinear interpolation of color and gradient normal at the surface
/// crossing, recording the 8-voxel footprint.
fn shade_surface(
    result: &mut PixelResult,
    origin: Vec3,
    dir: Vec3,
    t_surf: f32,
    sampler: &VolumeSampler<'_>,
    params: &RayCastParams,
) {
    let p = origin + dir * t_surf;
    result.vertex = p.to_array();
    result.depth = t_surf * params.depth_scale;

    // Voxel centers form a lattice at (v + 0.5) * voxel_size; shift by half a
    // voxel so the interpolation cell is spanned by 8 centers.
    let gp = p / params.voxel_size - Vec3::splat(0.5);
    let base = gp.floor();
    let frac = gp - base;
    let base = base.as_ivec3();

    let mut color = Vec3::ZERO;
    let mut normal = Vec3::ZERO;
    let mut ratio_sum = 0.0f32;
    for k in 0..8 {
        let offset = IVec3::new(k & 1, (k >> 1) & 1, (k >> 2) & 1);
        let weights = Vec3::new(
            if offset.x == 1 { frac.x } else { 1.0 - frac.x },
            if offset.y == 1 { frac.y } else { 1.0 - frac.y },
            if offset.z == 1 { frac.z } else { 1.0 - frac.z },
        );
        let ratio = weights.x * weights.y * weights.z;
        result.ratio[k as usize] = ratio;

        let v = base + offset;
        let Some(flat) = sampler.locate(v) else {
            continue;
        };
        result.index[k as usize] = flat as i64;
        if sampler.bufs.weight[flat] < params.weight_threshold {
            continue;
        }
        result.mask[k as usize] = true;
        ratio_sum += ratio;
        color += ratio * Vec3::from_array(sampler.color_at(flat));
        normal += ratio * sampler.gradient(v);
    }

    if ratio_sum > 0.0 {
        result.color = (color / ratio_sum).to_array();
    }
    if normal.length_squared() > 1e-12 {
        let mut normal = normal.normalize();
        // Face the camera.
        if normal.dot(dir) > 0.0 {
            normal = -normal;
        }
        result.normal = normal.to_array();
    }
}
