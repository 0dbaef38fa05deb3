//! Spatially-hashed voxel block grid.
//!
//! The grid stores per-voxel attributes (TSDF value, weight, optional color,
//! plus any extra named attributes) in fixed-size cubic blocks, indexed by a
//! concurrent hash map over integer block coordinates. Four passes operate
//! on it:
//!
//! 1. **Touch** - compute the deduplicated block coordinates a new
//!    observation intersects, through a disposable scratch set.
//! 2. **Integrate** - allocate the touched blocks and fuse a depth/color
//!    frame into their voxels as weighted running averages.
//! 3. **Ray cast** - render vertex/depth/color/normal maps for a virtual
//!    camera by marching rays through the sparse structure.
//! 4. **Extract** - emit a zero-crossing surface point cloud from the active
//!    blocks.
//!
//! Every pass is an order-free parallel map over an independent index set;
//! integration partitions its writers by block so no two workers ever touch
//! the same voxel.

use std::collections::HashMap;

use glam::{IVec3, Vec3};
use log::{debug, warn};

use crate::camera::{Extrinsic, PinholeIntrinsics};
use crate::image::{ColorImage, DepthImage};
use crate::point_cloud::PointCloud;
use crate::FusionError;

pub mod block_index;
pub mod parallel_iter;
pub mod types;

mod extract;
mod integrate;
mod raycast;
mod touch;

#[cfg(test)]
mod tests;

pub use block_index::{BlockIndex, ShardedBlockIndex, TouchScratch};
pub use types::{
    default_attribute_schema, AttrData, AttrDtype, AttributeSpec, BlockCoord, FusionStatsSnapshot,
    GridOptions, RangeMap, RayCastMaps,
};

use types::{
    local_linear, FusionBuffers, FusionBuffersMut, FusionStats, VolumeSampler, ATTR_COLOR,
    ATTR_TSDF, ATTR_WEIGHT,
};

struct Attribute {
    spec: AttributeSpec,
    data: AttrData,
}

/// Sparse TSDF volume over lazily allocated voxel blocks.
pub struct VoxelBlockGrid {
    voxel_size: f32,
    block_resolution: usize,
    weight_cap: f32,
    index: Box<dyn BlockIndex>,
    scratch: TouchScratch,
    attributes: Vec<Attribute>,
    name_to_slot: HashMap<String, usize>,
    stats: FusionStats,
}

impl VoxelBlockGrid {
    /// Create a grid with the given attribute schema over the default
    /// concurrent index backend.
    pub fn new(attributes: Vec<AttributeSpec>, options: GridOptions) -> Result<Self, FusionError> {
        let capacity = options.block_capacity;
        Self::with_index(
            attributes,
            options,
            Box::new(ShardedBlockIndex::new(capacity)),
        )
    }

    /// Create a grid with the fusion kernels' conventional schema
    /// (f32 `tsdf`, `weight`, and RGB `color`).
    pub fn with_default_schema(options: GridOptions) -> Result<Self, FusionError> {
        Self::new(default_attribute_schema(), options)
    }

    /// Create a grid over a caller-chosen index backend.
    pub fn with_index(
        attributes: Vec<AttributeSpec>,
        options: GridOptions,
        index: Box<dyn BlockIndex>,
    ) -> Result<Self, FusionError> {
        if options.voxel_size <= 0.0 {
            return Err(FusionError::InvalidVoxelSize(options.voxel_size));
        }
        if options.block_resolution == 0 {
            return Err(FusionError::InvalidBlockResolution);
        }
        if options.block_capacity == 0 {
            return Err(FusionError::InvalidBlockCapacity);
        }
        if attributes.is_empty() {
            return Err(FusionError::EmptySchema);
        }

        let res3 = options.block_resolution.pow(3);
        let mut name_to_slot = HashMap::with_capacity(attributes.len());
        let mut stored = Vec::with_capacity(attributes.len());
        for (i, spec) in attributes.into_iter().enumerate() {
            if spec.channels == 0 {
                return Err(FusionError::ZeroChannelAttribute(spec.name));
            }
            if name_to_slot.insert(spec.name.clone(), i).is_some() {
                return Err(FusionError::DuplicateAttribute(spec.name));
            }
            let data = AttrData::zeroed(spec.dtype, options.block_capacity * res3 * spec.channels);
            stored.push(Attribute { spec, data });
        }

        Ok(Self {
            voxel_size: options.voxel_size,
            block_resolution: options.block_resolution,
            weight_cap: options.weight_cap,
            index,
            scratch: TouchScratch::new(),
            attributes: stored,
            name_to_slot,
            stats: FusionStats::default(),
        })
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn block_resolution(&self) -> usize {
        self.block_resolution
    }

    pub fn block_capacity(&self) -> usize {
        self.index.capacity()
    }

    pub fn num_active_blocks(&self) -> usize {
        self.index.len()
    }

    /// Half the block edge length: the truncation band used by the touch,
    /// integration and ray-casting passes.
    pub fn truncation_distance(&self) -> f32 {
        self.voxel_size * self.block_resolution as f32 * 0.5
    }

    /// Point-in-time copy of the pass counters.
    pub fn stats(&self) -> FusionStatsSnapshot {
        self.stats.snapshot()
    }

    /// The named attribute buffer, or `None` (with a warning) if the name
    /// was never configured.
    pub fn attribute(&self, name: &str) -> Option<&AttrData> {
        match self.name_to_slot.get(name) {
            Some(&i) => Some(&self.attributes[i].data),
            None => {
                warn!("attribute {name} not found, returning empty result");
                None
            }
        }
    }

    /// The live coordinate/slot table, in unspecified order.
    pub fn active_block_entries(&self) -> Vec<(BlockCoord, u32)> {
        self.index.active_entries()
    }

    /// Global integer voxel coordinates of every voxel in every active
    /// block, in unspecified block order.
    pub fn active_voxel_coordinates(&self) -> Vec<IVec3> {
        let res = self.block_resolution;
        let mut out = Vec::with_capacity(self.index.len() * res.pow(3));
        for (coord, _) in self.index.active_entries() {
            let base = coord.voxel_base(res);
            for z in 0..res as i32 {
                for y in 0..res as i32 {
                    for x in 0..res as i32 {
                        out.push(base + IVec3::new(x, y, z));
                    }
                }
            }
        }
        out
    }

    /// Block coordinates a depth frame's frustum could affect.
    ///
    /// Does not allocate anything in the permanent index. The scratch set is
    /// cleared between calls, so consecutive frames never contaminate each
    /// other; the returned order is unspecified but the set is deterministic.
    pub fn touched_block_coordinates(
        &mut self,
        depth: &DepthImage,
        intrinsics: &PinholeIntrinsics,
        extrinsic: &Extrinsic,
        depth_scale: f32,
        depth_max: f32,
    ) -> Result<Vec<BlockCoord>, FusionError> {
        if depth_scale <= 0.0 {
            return Err(FusionError::InvalidDepthScale(depth_scale));
        }
        if depth_max <= 0.0 {
            return Err(FusionError::InvalidDepthRange {
                min: 0.0,
                max: depth_max,
            });
        }

        let df = touch::DEPTH_DOWN_FACTOR;
        let hint = (depth.rows() / df).max(1)
            * (depth.cols() / df).max(1)
            * touch::EST_SAMPLE_MULTIPLIER;
        self.scratch.prepare(hint);

        let params = touch::TouchParams {
            voxel_size: self.voxel_size,
            block_resolution: self.block_resolution,
            trunc_margin: self.truncation_distance(),
            depth_scale,
            depth_max,
        };
        let coords = touch::depth_touch(&self.scratch, depth, intrinsics, extrinsic, &params);
        debug!(
            "touch: {} blocks from a {}x{} depth frame",
            coords.len(),
            depth.rows(),
            depth.cols()
        );
        Ok(coords)
    }

    /// Block coordinates within the truncation margin of each point.
    ///
    /// An empty input warns and produces an empty result.
    pub fn touched_block_coordinates_from_points(&mut self, points: &[Vec3]) -> Vec<BlockCoord> {
        if points.is_empty() {
            warn!("touch requested for an empty point cloud, returning no blocks");
            return Vec::new();
        }

        self.scratch
            .prepare(points.len() * touch::EST_NEIGHBOR_MULTIPLIER);
        let block_size = self.voxel_size * self.block_resolution as f32;
        let margin =
            (self.voxel_size * (self.block_resolution as f32 * 0.5 - 1.0)).max(0.0);
        let coords = touch::point_cloud_touch(&self.scratch, points, block_size, margin);
        debug!("touch: {} blocks from {} points", coords.len(), points.len());
        coords
    }

    /// Fuse one depth (and optionally color) frame into the given blocks.
    ///
    /// Activates the coordinates first; blocks that do not fit under the
    /// capacity ceiling are dropped with a warning. All input validation
    /// happens before any voxel is written.
    #[allow(clippy::too_many_arguments)]
    pub fn integrate(
        &mut self,
        block_coords: &[BlockCoord],
        depth: &DepthImage,
        color: Option<&ColorImage>,
        intrinsics: &PinholeIntrinsics,
        extrinsic: &Extrinsic,
        depth_scale: f32,
        depth_max: f32,
    ) -> Result<(), FusionError> {
        if depth_scale <= 0.0 {
            return Err(FusionError::InvalidDepthScale(depth_scale));
        }
        if depth_max <= 0.0 {
            return Err(FusionError::InvalidDepthRange {
                min: 0.0,
                max: depth_max,
            });
        }
        if let Some(c) = color {
            if c.rows() != depth.rows() || c.cols() != depth.cols() {
                return Err(FusionError::ColorDepthMismatch {
                    color_rows: c.rows(),
                    color_cols: c.cols(),
                    depth_rows: depth.rows(),
                    depth_cols: depth.cols(),
                });
            }
        }
        self.validate_fusion_schema()?;

        let before = self.index.len();
        let (slots, mask) = self.index.activate(block_coords);
        let allocated = self.index.len() - before;
        self.stats
            .blocks_allocated
            .fetch_add(allocated as u64, std::sync::atomic::Ordering::Relaxed);

        let dropped = mask.iter().filter(|ok| !**ok).count();
        if dropped > 0 {
            warn!(
                "block capacity {} exhausted: dropping {dropped} of {} touched blocks",
                self.index.capacity(),
                block_coords.len()
            );
        }

        let touched: Vec<(BlockCoord, u32)> = block_coords
            .iter()
            .zip(slots.iter().zip(&mask))
            .filter(|(_, (_, ok))| **ok)
            .map(|(coord, (slot, _))| (*coord, *slot))
            .collect();

        let params = integrate::IntegrateParams {
            voxel_size: self.voxel_size,
            block_resolution: self.block_resolution,
            trunc: self.truncation_distance(),
            depth_scale,
            depth_max,
            weight_cap: self.weight_cap,
        };
        let has_color_attr = self.name_to_slot.contains_key(ATTR_COLOR);
        if color.is_some() && !has_color_attr {
            warn!("color frame supplied but no color attribute is configured; fusing depth only");
        }
        let bufs = self.fusion_buffers_mut()?;
        let updated =
            integrate::integrate_blocks(&touched, bufs, depth, color, intrinsics, extrinsic, &params);
        self.stats
            .voxels_integrated
            .fetch_add(updated, std::sync::atomic::Ordering::Relaxed);
        debug!(
            "integrate: {updated} voxels across {} blocks ({allocated} newly allocated)",
            touched.len()
        );
        Ok(())
    }

    /// Render vertex/depth/color/normal maps for a virtual camera.
    ///
    /// `block_coords` are the candidate blocks bounding the march (typically
    /// a touch-pass result for the same camera); `depth` is written in
    /// sensor units (metric times `depth_scale`).
    #[allow(clippy::too_many_arguments)]
    pub fn ray_cast(
        &self,
        block_coords: &[BlockCoord],
        intrinsics: &PinholeIntrinsics,
        extrinsic: &Extrinsic,
        width: usize,
        height: usize,
        depth_scale: f32,
        depth_min: f32,
        depth_max: f32,
        weight_threshold: f32,
    ) -> Result<RayCastMaps, FusionError> {
        if width == 0 || height == 0 {
            return Err(FusionError::InvalidOutputSize { width, height });
        }
        if depth_scale <= 0.0 {
            return Err(FusionError::InvalidDepthScale(depth_scale));
        }
        if depth_min < 0.0 || depth_min >= depth_max {
            return Err(FusionError::InvalidDepthRange {
                min: depth_min,
                max: depth_max,
            });
        }
        self.validate_fusion_schema()?;

        let params = raycast::RayCastParams {
            voxel_size: self.voxel_size,
            block_resolution: self.block_resolution,
            depth_scale,
            depth_min,
            depth_max,
            weight_threshold,
            width,
            height,
        };
        let range = raycast::estimate_range(block_coords, intrinsics, extrinsic, &params);

        let bufs = self.fusion_buffers()?;
        let sampler = VolumeSampler {
            index: self.index.as_ref(),
            bufs: &bufs,
            resolution: self.block_resolution,
            weight_threshold,
        };
        let (maps, marched) = raycast::ray_cast(&sampler, range, intrinsics, extrinsic, &params);
        self.stats
            .rays_marched
            .fetch_add(marched, std::sync::atomic::Ordering::Relaxed);
        debug!("ray cast: {marched} of {} rays marched", width * height);
        Ok(maps)
    }

    /// Extract a zero-crossing surface point cloud from the active blocks.
    ///
    /// At most `estimated_number` points are emitted; once the budget is
    /// reserved, remaining crossings are dropped (the result may undercount
    /// near the budget, and never exceeds it).
    pub fn extract_surface_points(
        &self,
        estimated_number: usize,
        weight_threshold: f32,
    ) -> Result<PointCloud, FusionError> {
        self.validate_fusion_schema()?;

        let entries = self.index.active_entries();
        if entries.is_empty() {
            warn!("surface extraction on an empty grid, returning an empty point cloud");
            return Ok(PointCloud::new());
        }

        let bufs = self.fusion_buffers()?;
        let sampler = VolumeSampler {
            index: self.index.as_ref(),
            bufs: &bufs,
            resolution: self.block_resolution,
            weight_threshold,
        };
        let params = extract::ExtractParams {
            voxel_size: self.voxel_size,
            block_resolution: self.block_resolution,
            weight_threshold,
            estimated_number,
        };
        let cloud = extract::extract_surface_points(&sampler, &entries, &params);
        self.stats
            .surface_points_emitted
            .fetch_add(cloud.len() as u64, std::sync::atomic::Ordering::Relaxed);
        debug!(
            "extract: {} surface points from {} blocks",
            cloud.len(),
            entries.len()
        );
        Ok(cloud)
    }

    /// Flattened buffer position of a global voxel coordinate, if its block
    /// is allocated. Matches the positions reported in the ray-cast `index`
    /// map.
    pub fn locate_voxel(&self, v: IVec3) -> Option<usize> {
        let (block, local) = BlockCoord::of_voxel(v, self.block_resolution);
        let slot = self.index.find_one(block)? as usize;
        Some(slot * self.block_resolution.pow(3) + local_linear(local, self.block_resolution))
    }

    fn require_kernel_attr(
        &self,
        name: &'static str,
        channels: usize,
    ) -> Result<(), FusionError> {
        let Some(&i) = self.name_to_slot.get(name) else {
            return Err(FusionError::MissingKernelAttribute(name));
        };
        let attr = &self.attributes[i];
        if attr.data.dtype() != AttrDtype::F32 {
            return Err(FusionError::KernelAttrDtype {
                name: name.to_string(),
                got: attr.data.dtype(),
                want: AttrDtype::F32,
            });
        }
        if attr.spec.channels != channels {
            return Err(FusionError::KernelAttrChannels {
                name: name.to_string(),
                got: attr.spec.channels,
                want: channels,
            });
        }
        Ok(())
    }

    fn validate_fusion_schema(&self) -> Result<(), FusionError> {
        self.require_kernel_attr(ATTR_TSDF, 1)?;
        self.require_kernel_attr(ATTR_WEIGHT, 1)?;
        if self.name_to_slot.contains_key(ATTR_COLOR) {
            self.require_kernel_attr(ATTR_COLOR, 3)?;
        }
        Ok(())
    }

    fn fusion_buffers(&self) -> Result<FusionBuffers<'_>, FusionError> {
        let mut tsdf = None;
        let mut weight = None;
        let mut color = None;
        for attr in &self.attributes {
            match attr.spec.name.as_str() {
                ATTR_TSDF => tsdf = attr.data.as_f32(),
                ATTR_WEIGHT => weight = attr.data.as_f32(),
                ATTR_COLOR => color = attr.data.as_f32(),
                _ => {}
            }
        }
        Ok(FusionBuffers {
            tsdf: tsdf.ok_or(FusionError::MissingKernelAttribute(ATTR_TSDF))?,
            weight: weight.ok_or(FusionError::MissingKernelAttribute(ATTR_WEIGHT))?,
            color,
        })
    }

    fn fusion_buffers_mut(&mut self) -> Result<FusionBuffersMut<'_>, FusionError> {
        let mut tsdf = None;
        let mut weight = None;
        let mut color = None;
        for attr in self.attributes.iter_mut() {
            match attr.spec.name.as_str() {
                ATTR_TSDF => tsdf = attr.data.as_f32_mut(),
                ATTR_WEIGHT => weight = attr.data.as_f32_mut(),
                ATTR_COLOR => color = attr.data.as_f32_mut(),
                _ => {}
            }
        }
        Ok(FusionBuffersMut {
            tsdf: tsdf.ok_or(FusionError::MissingKernelAttribute(ATTR_TSDF))?,
            weight: weight.ok_or(FusionError::MissingKernelAttribute(ATTR_WEIGHT))?,
            color,
        })
    }
}
