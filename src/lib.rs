//! Sparse voxel-block-grid depth fusion.
//!
//! This crate fuses streams of depth (and optionally color) images captured
//! from known camera poses into a spatially-hashed truncated-signed-distance
//! volume, and reconstructs renderable maps or explicit surface points from
//! it. The volume is sparse: voxels live in fixed-size cubic blocks that are
//! allocated lazily, the first time an observation touches them.
//!
//! A typical frame goes through three calls:
//!
//! 1. [`VoxelBlockGrid::touched_block_coordinates`] - find the block
//!    coordinates the new frame's frustum intersects.
//! 2. [`VoxelBlockGrid::integrate`] - fuse the frame into those blocks.
//! 3. On demand, [`VoxelBlockGrid::ray_cast`] for rendered maps or
//!    [`VoxelBlockGrid::extract_surface_points`] for a point cloud.

pub mod camera;
pub mod image;
pub mod point_cloud;
pub mod voxel_block_grid;

pub use camera::{Extrinsic, PinholeIntrinsics};
pub use image::{ColorImage, DepthImage};
pub use point_cloud::PointCloud;
pub use voxel_block_grid::{
    AttrData, AttrDtype, AttributeSpec, BlockCoord, FusionStatsSnapshot, GridOptions, RayCastMaps,
    VoxelBlockGrid,
};

#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("voxel size must be positive, got {0}")]
    InvalidVoxelSize(f32),
    #[error("block resolution must be positive")]
    InvalidBlockResolution,
    #[error("block capacity must be positive")]
    InvalidBlockCapacity,
    #[error("attribute schema is empty")]
    EmptySchema,
    #[error("duplicate attribute name: {0}")]
    DuplicateAttribute(String),
    #[error("attribute {0} has zero channels")]
    ZeroChannelAttribute(String),
    #[error("image data length {got} does not match {rows}x{cols}x{channels}")]
    ImageShape {
        rows: usize,
        cols: usize,
        channels: usize,
        got: usize,
    },
    #[error("image dimensions must be positive, got {rows}x{cols}")]
    EmptyImage { rows: usize, cols: usize },
    #[error(
        "color image is {color_rows}x{color_cols} but depth image is {depth_rows}x{depth_cols}"
    )]
    ColorDepthMismatch {
        color_rows: usize,
        color_cols: usize,
        depth_rows: usize,
        depth_cols: usize,
    },
    #[error("depth scale must be positive, got {0}")]
    InvalidDepthScale(f32),
    #[error("depth range [{min}, {max}] is empty or negative")]
    InvalidDepthRange { min: f32, max: f32 },
    #[error("output size {width}x{height} must be positive")]
    InvalidOutputSize { width: usize, height: usize },
    #[error("fusion kernels require the {0} attribute, which is not configured")]
    MissingKernelAttribute(&'static str),
    #[error("attribute {name} stores {got:?}, fusion kernels require {want:?}")]
    KernelAttrDtype {
        name: String,
        got: AttrDtype,
        want: AttrDtype,
    },
    #[error("attribute {name} has {got} channels, fusion kernels require {want}")]
    KernelAttrChannels {
        name: String,
        got: usize,
        want: usize,
    },
}
