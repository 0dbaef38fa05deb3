//! Type definitions for the voxel block grid.
//!
//! Contains the block coordinate ID, the attribute schema, grid options,
//! pass counters, and the ray-casting output types.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{IVec3, Vec3};

/// Attribute names the fusion kernels operate on.
pub(crate) const ATTR_TSDF: &str = "tsdf";
pub(crate) const ATTR_WEIGHT: &str = "weight";
pub(crate) const ATTR_COLOR: &str = "color";

// =============================================================================
// BLOCK COORDINATES
// =============================================================================

/// Integer coordinate of a voxel block in the infinite block lattice.
///
/// Block `(0, 0, 0)` spans world space `[0, block_size)` on each axis, where
/// `block_size = voxel_size * block_resolution`. Coordinates are signed; the
/// grid has no preferred origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Block containing a world-space point.
    pub fn of_world_point(p: Vec3, block_size: f32) -> Self {
        Self {
            x: (p.x / block_size).floor() as i32,
            y: (p.y / block_size).floor() as i32,
            z: (p.z / block_size).floor() as i32,
        }
    }

    /// Block containing a global voxel coordinate, with the voxel's local
    /// offset inside that block.
    pub fn of_voxel(v: IVec3, resolution: usize) -> (Self, IVec3) {
        let r = resolution as i32;
        let block = Self {
            x: v.x.div_euclid(r),
            y: v.y.div_euclid(r),
            z: v.z.div_euclid(r),
        };
        let local = IVec3::new(v.x.rem_euclid(r), v.y.rem_euclid(r), v.z.rem_euclid(r));
        (block, local)
    }

    /// World-space minimum corner of this block.
    pub fn min_corner(&self, block_size: f32) -> Vec3 {
        Vec3::new(self.x as f32, self.y as f32, self.z as f32) * block_size
    }

    /// Global voxel coordinate of this block's first voxel.
    pub fn voxel_base(&self, resolution: usize) -> IVec3 {
        IVec3::new(self.x, self.y, self.z) * resolution as i32
    }

    pub fn offset(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }
}

/// World-space center of a global voxel coordinate.
#[inline]
pub(crate) fn voxel_center(v: IVec3, voxel_size: f32) -> Vec3 {
    (v.as_vec3() + Vec3::splat(0.5)) * voxel_size
}

/// Linear index of a local voxel offset inside a block payload (x fastest).
#[inline]
pub(crate) fn local_linear(l: IVec3, resolution: usize) -> usize {
    (l.z as usize * resolution + l.y as usize) * resolution + l.x as usize
}

// =============================================================================
// ATTRIBUTE SCHEMA
// =============================================================================

/// Element dtype of a voxel attribute buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrDtype {
    F32,
    U16,
    U8,
}

/// One named per-voxel attribute: dtype plus channels per voxel.
#[derive(Clone, Debug)]
pub struct AttributeSpec {
    pub name: String,
    pub dtype: AttrDtype,
    pub channels: usize,
}

impl AttributeSpec {
    pub fn new(name: impl Into<String>, dtype: AttrDtype, channels: usize) -> Self {
        Self {
            name: name.into(),
            dtype,
            channels,
        }
    }
}

/// The schema the fusion kernels expect: scalar f32 TSDF and weight plus an
/// f32 RGB color.
pub fn default_attribute_schema() -> Vec<AttributeSpec> {
    vec![
        AttributeSpec::new(ATTR_TSDF, AttrDtype::F32, 1),
        AttributeSpec::new(ATTR_WEIGHT, AttrDtype::F32, 1),
        AttributeSpec::new(ATTR_COLOR, AttrDtype::F32, 3),
    ]
}

/// A flat, zero-initialized attribute buffer
/// (`capacity * resolution^3 * channels` elements).
#[derive(Clone, Debug)]
pub enum AttrData {
    F32(Vec<f32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
}

impl AttrData {
    pub fn zeroed(dtype: AttrDtype, len: usize) -> Self {
        match dtype {
            AttrDtype::F32 => AttrData::F32(vec![0.0; len]),
            AttrDtype::U16 => AttrData::U16(vec![0; len]),
            AttrDtype::U8 => AttrData::U8(vec![0; len]),
        }
    }

    pub fn dtype(&self) -> AttrDtype {
        match self {
            AttrData::F32(_) => AttrDtype::F32,
            AttrData::U16(_) => AttrDtype::U16,
            AttrData::U8(_) => AttrDtype::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AttrData::F32(v) => v.len(),
            AttrData::U16(v) => v.len(),
            AttrData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            AttrData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            AttrData::F32(v) => Some(v),
            _ => None,
        }
    }
}

// =============================================================================
// GRID OPTIONS
// =============================================================================

/// Construction-time configuration for a [`super::VoxelBlockGrid`].
#[derive(Clone, Debug)]
pub struct GridOptions {
    /// Edge length of one voxel in world units. Must be positive.
    pub voxel_size: f32,

    /// Voxels per edge of a cubic block. 16 is the usual choice; smaller
    /// blocks allocate tighter around the surface, larger blocks hash less.
    pub block_resolution: usize,

    /// Maximum number of blocks. A hard ceiling: activation beyond it fails
    /// per key via the output mask, and integration drops those blocks.
    pub block_capacity: usize,

    /// Saturation value for the per-voxel integration weight. Once a voxel
    /// reaches the cap its running averages become exponential with window
    /// `weight_cap`, which keeps long-running fusion numerically stable.
    pub weight_cap: f32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            voxel_size: 3.0 / 512.0,
            block_resolution: 16,
            block_capacity: 10_000,
            weight_cap: 128.0,
        }
    }
}

// =============================================================================
// PASS COUNTERS
// =============================================================================

/// Atomic counters updated by the passes (shared-reference safe).
#[derive(Default)]
pub(crate) struct FusionStats {
    pub blocks_allocated: AtomicU64,
    pub voxels_integrated: AtomicU64,
    pub rays_marched: AtomicU64,
    pub surface_points_emitted: AtomicU64,
}

impl FusionStats {
    pub fn snapshot(&self) -> FusionStatsSnapshot {
        FusionStatsSnapshot {
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            voxels_integrated: self.voxels_integrated.load(Ordering::Relaxed),
            rays_marched: self.rays_marched.load(Ordering::Relaxed),
            surface_points_emitted: self.surface_points_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pass counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct FusionStatsSnapshot {
    pub blocks_allocated: u64,
    pub voxels_integrated: u64,
    pub rays_marched: u64,
    pub surface_points_emitted: u64,
}

// =============================================================================
// RAY-CASTING OUTPUT
// =============================================================================

/// Per-tile conservative `[depth_min, depth_max]` marching bounds.
///
/// Tiles cover `down_factor x down_factor` pixel squares. A tile no block
/// projects into keeps its empty initial interval (`min > max`), so its rays
/// are never marched.
#[derive(Clone, Debug)]
pub struct RangeMap {
    pub tile_rows: usize,
    pub tile_cols: usize,
    pub down_factor: usize,
    pub data: Vec<[f32; 2]>,
}

impl RangeMap {
    #[inline]
    pub fn for_pixel(&self, row: usize, col: usize) -> [f32; 2] {
        let tr = (row / self.down_factor).min(self.tile_rows - 1);
        let tc = (col / self.down_factor).min(self.tile_cols - 1);
        self.data[tr * self.tile_cols + tc]
    }
}

/// Rendered maps produced by the ray-casting pass.
///
/// All image-shaped buffers are row-major `height x width`. Pixels whose ray
/// found no zero crossing keep zeroed values and an all-false `mask`.
///
/// `mask`/`ratio`/`index` describe the trilinear interpolation at the surface
/// crossing: for each of the 8 surrounding voxels, whether it resolved to an
/// observed voxel, its interpolation weight, and its flattened position in
/// the per-attribute buffers (`slot * resolution^3 + local`). A caller can
/// replay the identical interpolation against any attribute buffer without
/// re-marching.
#[derive(Clone, Debug)]
pub struct RayCastMaps {
    pub width: usize,
    pub height: usize,
    pub vertex: Vec<[f32; 3]>,
    pub depth: Vec<f32>,
    pub color: Vec<[f32; 3]>,
    pub normal: Vec<[f32; 3]>,
    pub mask: Vec<[bool; 8]>,
    pub ratio: Vec<[f32; 8]>,
    pub index: Vec<[i64; 8]>,
    pub range: RangeMap,
}

// =============================================================================
// SHARED KERNEL VIEWS
// =============================================================================

/// Borrowed fusion attribute buffers for the read-only passes.
pub(crate) struct FusionBuffers<'a> {
    pub tsdf: &'a [f32],
    pub weight: &'a [f32],
    pub color: Option<&'a [f32]>,
}

/// Mutable fusion attribute buffers for the integration pass.
pub(crate) struct FusionBuffersMut<'a> {
    pub tsdf: &'a mut [f32],
    pub weight: &'a mut [f32],
    pub color: Option<&'a mut [f32]>,
}

/// Resolves global voxel coordinates to attribute buffer positions through
/// the block index. Shared by the ray-casting and extraction passes.
pub(crate) struct VolumeSampler<'a> {
    pub index: &'a dyn super::block_index::BlockIndex,
    pub bufs: &'a FusionBuffers<'a>,
    pub resolution: usize,
    pub weight_threshold: f32,
}

impl VolumeSampler<'_> {
    /// Flattened buffer position of a global voxel, if its block is allocated.
    #[inline]
    pub fn locate(&self, v: IVec3) -> Option<usize> {
        let (block, local) = BlockCoord::of_voxel(v, self.resolution);
        let slot = self.index.find_one(block)? as usize;
        let res3 = self.resolution * self.resolution * self.resolution;
        Some(slot * res3 + local_linear(local, self.resolution))
    }

    #[inline]
    pub fn tsdf_weight(&self, v: IVec3) -> Option<(f32, f32)> {
        let i = self.locate(v)?;
        Some((self.bufs.tsdf[i], self.bufs.weight[i]))
    }

    /// TSDF of an observed voxel (weight at or above the threshold).
    #[inline]
    pub fn observed_tsdf(&self, v: IVec3) -> Option<f32> {
        self.tsdf_weight(v)
            .filter(|(_, w)| *w >= self.weight_threshold)
            .map(|(t, _)| t)
    }

    /// Central-difference TSDF gradient at a voxel. Missing or unobserved
    /// neighbors fall back to the center value, degrading to a one-sided
    /// difference at volume borders.
    pub fn gradient(&self, v: IVec3) -> Vec3 {
        let center = self
            .tsdf_weight(v)
            .map(|(t, _)| t)
            .unwrap_or(0.0);
        let mut g = Vec3::ZERO;
        for axis in 0..3 {
            let mut e = IVec3::ZERO;
            e[axis] = 1;
            let fp = self.observed_tsdf(v + e).unwrap_or(center);
            let fm = self.observed_tsdf(v - e).unwrap_or(center);
            g[axis] = fp - fm;
        }
        g
    }

    #[inline]
    pub fn color_at(&self, flat: usize) -> [f32; 3] {
        match self.bufs.color {
            Some(c) => [c[flat * 3], c[flat * 3 + 1], c[flat * 3 + 2]],
            None => [0.0; 3],
        }
    }
}
