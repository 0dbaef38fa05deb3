//! Depth and color frame containers.
//!
//! Both containers validate their dimensions at construction, so the fusion
//! passes can rely on well-formed row-major data and fail fast before any
//! kernel runs.

use crate::FusionError;

/// A row-major depth frame in raw sensor units.
///
/// Raw values are divided by the caller-supplied `depth_scale` to obtain
/// metric depth (e.g. millimeter sensors use a scale of 1000). Zero and
/// negative values mean "no measurement".
#[derive(Clone, Debug)]
pub struct DepthImage {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl DepthImage {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, FusionError> {
        if rows == 0 || cols == 0 {
            return Err(FusionError::EmptyImage { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(FusionError::ImageShape {
                rows,
                cols,
                channels: 1,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// A row-major RGB frame with channels in `[0, 1]`.
#[derive(Clone, Debug)]
pub struct ColorImage {
    rows: usize,
    cols: usize,
    data: Vec<[f32; 3]>,
}

impl ColorImage {
    pub fn new(rows: usize, cols: usize, data: Vec<[f32; 3]>) -> Result<Self, FusionError> {
        if rows == 0 || cols == 0 {
            return Err(FusionError::EmptyImage { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(FusionError::ImageShape {
                rows,
                cols,
                channels: 3,
                got: data.len() * 3,
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> [f32; 3] {
        self.data[row * self.cols + col]
    }
}
