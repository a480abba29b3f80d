// THEORY:
// A `Shape` is the unit of both training and classification. It bundles the set of
// kernels that describe a target pattern with the pooling parameters every one of
// those kernels is reduced with, and the floor at which reduction stops.
//
// The floor is deliberately configurable per shape. Depending on the kernels and
// the image width, a shape may want to stop once the pooled map holds a handful of
// elements, or once it is narrow enough, and the two rules produce differently
// sized reference rows.

use crate::core_modules::grid::Grid;
use crate::core_modules::kernel::Kernel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Boundary policy of a single max-pooling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingPolicy {
    /// No padding: `floor((d - size) / stride) + 1`, windows never leave the grid.
    #[default]
    Valid,
    /// Pad to cover: `ceil((d - size) / stride) + 1`, border windows are clipped.
    /// Never more than `(d - 1) / stride + 1`, so every window starts inside the grid.
    Cover,
}

impl PoolingPolicy {
    /// Output length of one pooling pass along a dimension of length `d`.
    /// `None` means the pass would produce a non-positive dimension.
    pub fn output_len(&self, d: usize, size: usize, stride: usize) -> Option<usize> {
        if d == 0 || size == 0 || stride == 0 {
            return None;
        }
        match self {
            PoolingPolicy::Valid => {
                if d < size {
                    None
                } else {
                    Some((d - size) / stride + 1)
                }
            }
            PoolingPolicy::Cover => {
                if d <= size {
                    Some(1)
                } else {
                    // A stride wider than the window would otherwise place the last
                    // window start past the edge.
                    let covering = (d - size).div_ceil(stride) + 1;
                    let in_bounds = (d - 1) / stride + 1;
                    Some(covering.min(in_bounds))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolingParams {
    pub size: usize,
    pub stride: usize,
    #[serde(default)]
    pub policy: PoolingPolicy,
}

impl Default for PoolingParams {
    fn default() -> Self {
        Self {
            size: 3,
            stride: 3,
            policy: PoolingPolicy::Valid,
        }
    }
}

/// The point at which iterative pooling stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionFloor {
    /// Stop once the pooled map holds at most this many elements.
    MaxElements(usize),
    /// Stop once the pooled map is at most this many columns wide.
    MaxWidth(usize),
}

impl ReductionFloor {
    pub fn is_reached(&self, grid: &Grid) -> bool {
        match *self {
            ReductionFloor::MaxElements(limit) => grid.len() <= limit,
            ReductionFloor::MaxWidth(limit) => grid.width() <= limit,
        }
    }
}

impl Default for ReductionFloor {
    fn default() -> Self {
        ReductionFloor::MaxElements(9)
    }
}

/// A named target pattern: its kernels plus the shared pooling parameters.
#[derive(Debug, Clone)]
pub struct Shape {
    pub name: String,
    pub kernels: Vec<Arc<Kernel>>,
    pub pooling: PoolingParams,
    pub floor: ReductionFloor,
    /// Sub-directory of a training root holding this shape's sample images.
    pub training_dir: String,
}

impl Shape {
    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn kernel_ids(&self) -> impl Iterator<Item = &str> {
        self.kernels.iter().map(|k| k.id.as_str())
    }
}
