//! Surface extraction pass.
//!
//! Walks every voxel of every active block and inspects its +x/+y/+z edges
//! for TSDF sign changes between observed voxels. Neighbor blocks are
//! resolved once per active-block set through a 27-neighborhood slot table,
//! not per voxel. Each crossing emits a linearly interpolated point with
//! color and gradient normal, under a caller-supplied point budget: once the
//! budget is reserved, further crossings are dropped (the result may
//! undercount near the budget, and never exceeds it).

use std::sync::atomic::{AtomicUsize, Ordering};

use glam::{IVec3, Vec3};

use crate::point_cloud::PointCloud;

use super::parallel_iter;
use super::types::{local_linear, voxel_center, BlockCoord, VolumeSampler};

pub(crate) struct ExtractParams {
    pub voxel_size: f32,
    pub block_resolution: usize,
    pub weight_threshold: f32,
    pub estimated_number: usize,
}

/// Index of a neighbor offset in the 27-neighborhood table.
#[inline]
fn neighbor_slot(dx: i32, dy: i32, dz: i32) -> usize {
    ((dz + 1) * 9 + (dy + 1) * 3 + (dx + 1)) as usize
}

struct SurfacePoint {
    position: [f32; 3],
    color: [f32; 3],
    normal: [f32; 3],
}

pub(crate) fn extract_surface_points(
    sampler: &VolumeSampler<'_>,
    entries: &[(BlockCoord, u32)],
    params: &ExtractParams,
) -> PointCloud {
    let res = params.block_resolution;
    let res3 = res * res * res;

    // Resolve all 27 neighbors of every active block up front; the per-voxel
    // edge walk then only does table lookups for cross-block neighbors.
    let neighbor_table: Vec<[Option<u32>; 27]> =
        parallel_iter::map_vec(entries.to_vec(), |(coord, _)| {
            let mut row = [None; 27];
            for dz in -1..=1 {
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        row[neighbor_slot(dx, dy, dz)] =
                            sampler.index.find_one(coord.offset(dx, dy, dz));
                    }
                }
            }
            row
        });

    let budget = AtomicUsize::new(0);
    let work: Vec<(BlockCoord, u32, [Option<u32>; 27])> = entries
        .iter()
        .zip(&neighbor_table)
        .map(|((coord, slot), row)| (*coord, *slot, *row))
        .collect();

    let per_block = parallel_iter::map_vec(work, |(coord, slot, neighbors)| {
        let mut points = Vec::new();
        let base = coord.voxel_base(res);
        for z in 0..res {
            for y in 0..res {
                for x in 0..res {
                    let lin = (z * res + y) * res + x;
                    let flat = slot as usize * res3 + lin;
                    let weight = sampler.bufs.weight[flat];
                    if weight < params.weight_threshold {
                        continue;
                    }
                    let tsdf = sampler.bufs.tsdf[flat];

                    for axis in 0..3 {
                        let mut local = IVec3::new(x as i32, y as i32, z as i32);
                        local[axis] += 1;
                        let Some(nb_flat) =
                            resolve_edge_neighbor(local, slot, &neighbors, res)
                        else {
                            continue;
                        };
                        if sampler.bufs.weight[nb_flat] < params.weight_threshold {
                            continue;
                        }
                        let tsdf_nb = sampler.bufs.tsdf[nb_flat];
                        if tsdf * tsdf_nb >= 0.0 {
                            continue;
                        }

                        let reserved = budget.fetch_add(1, Ordering::Relaxed);
                        if reserved >= params.estimated_number {
                            return points;
                        }

                        let lerp = tsdf / (tsdf - tsdf_nb);
                        let v = base + IVec3::new(x as i32, y as i32, z as i32);
                        let mut axis_dir = Vec3::ZERO;
                        axis_dir[axis] = 1.0;
                        let position =
                            voxel_center(v, params.voxel_size) + lerp * params.voxel_size * axis_dir;

                        let mut v_nb = v;
                        v_nb[axis] += 1;
                        let grad = sampler.gradient(v).lerp(sampler.gradient(v_nb), lerp);
                        let normal = if grad.length_squared() > 1e-12 {
                            grad.normalize().to_array()
                        } else {
                            [0.0; 3]
                        };

                        let c0 = Vec3::from_array(sampler.color_at(flat));
                        let c1 = Vec3::from_array(sampler.color_at(nb_flat));
                        let color = c0.lerp(c1, lerp).to_array();

                        points.push(SurfacePoint {
                            position: position.to_array(),
                            color,
                            normal,
                        });
                    }
                }
            }
        }
        points
    });

    let mut cloud = PointCloud::with_capacity(per_block.iter().map(Vec::len).sum());
    for points in per_block {
        for p in points {
            cloud.positions.push(p.position);
            cloud.colors.push(p.color);
            cloud.normals.push(p.normal);
        }
    }
    cloud
}

/// Flattened buffer position of a voxel one step along an edge, resolving
/// block crossings through the precomputed neighbor table.
#[inline]
fn resolve_edge_neighbor(
    local: IVec3,
    own_slot: u32,
    neighbors: &[Option<u32>; 27],
    resolution: usize,
) -> Option<usize> {
    let res = resolution as i32;
    let res3 = resolution * resolution * resolution;
    if local.x < res && local.y < res && local.z < res {
        return Some(own_slot as usize * res3 + local_linear(local, resolution));
    }
    let dx = (local.x >= res) as i32;
    let dy = (local.y >= res) as i32;
    let dz = (local.z >= res) as i32;
    let slot = neighbors[neighbor_slot(dx, dy, dz)]?;
    let wrapped = IVec3::new(local.x % res, local.y % res, local.z % res);
    Some(slot as usize * res3 + local_linear(wrapped, resolution))
}
