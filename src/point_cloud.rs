//! Extracted surface point clouds, with a versioned CBOR dump format.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const POINT_CLOUD_VERSION: u32 = 1;

/// A surface point cloud keyed by position.
///
/// `colors` and `normals` are either empty or the same length as
/// `positions`; extraction fills all three.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PointCloud {
    pub version: u32,
    pub positions: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self {
            version: POINT_CLOUD_VERSION,
            positions: Vec::new(),
            colors: Vec::new(),
            normals: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            version: POINT_CLOUD_VERSION,
            positions: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
            normals: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("Failed to read point cloud: {}", path.display()))?;
        let cloud: PointCloud =
            serde_cbor::from_slice(&data).context("Failed to decode point cloud CBOR")?;
        Ok(cloud)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_cbor::to_vec(self).context("Failed to encode point cloud CBOR")?;
        fs::write(path, data)
            .with_context(|| format!("Failed to write point cloud: {}", path.display()))
    }
}
