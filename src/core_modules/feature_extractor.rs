// THEORY:
// The `feature_extractor` turns a normalized intensity grid into a compact numeric
// signature for one kernel. It is a fixed, hand-built version of the classic
// convolution -> activation -> pooling stack:
//
// 1.  **Convolution**: the kernel is slid across the grid in "valid" mode with a
//     stride of 1. Every output cell is the product-sum of the kernel against the
//     aligned window. No padding is introduced, so the output shrinks by
//     `kernel - 1` along each dimension.
// 2.  **Rectification**: negative responses are clamped to zero. A kernel only
//     reports where its pattern is present, never where its inverse is.
// 3.  **Iterative Pooling**: max-pooling is applied again and again until the map
//     falls at or below the shape's reduction floor. Each pass must strictly shrink
//     the map, and the output dimensions are computed before the pass runs so a
//     bad configuration fails with a clear error instead of an out-of-bounds read.
//
// The extractor is stateless. `extract` is a pure function of the grid, the kernel
// and the pooling parameters.

use crate::core_modules::grid::{Grid, IntensityGrid, PooledMap};
use crate::core_modules::kernel::Kernel;
use crate::core_modules::shape::{PoolingParams, ReductionFloor};
use crate::error::{Result, ShapeVisionError};

pub mod feature_extractor {
    use super::*;
    use tracing::trace;

    /// Upper bound on pooling passes. Realistic configurations need at most five.
    pub const MAX_POOLING_PASSES: usize = 16;

    /// Dimensions observed at every stage of one extraction.
    #[derive(Debug, Clone, PartialEq)]
    pub struct ExtractionReport {
        pub grid_dims: (usize, usize),
        pub kernel_dims: (usize, usize),
        pub feature_dims: (usize, usize),
        /// Dimensions after rectification, before the first pooling pass.
        pub activated_dims: (usize, usize),
        pub pooled_dims: (usize, usize),
        pub pooling_passes: usize,
    }

    /// Runs the full pipeline for one kernel and returns the pooled map.
    pub fn extract(
        grid: &IntensityGrid,
        kernel: &Kernel,
        pooling: PoolingParams,
        floor: ReductionFloor,
    ) -> Result<PooledMap> {
        extract_with_report(grid, kernel, pooling, floor).map(|(pooled, _)| pooled)
    }

    /// Same as `extract`, also returning the dimensions seen along the way.
    pub fn extract_with_report(
        grid: &IntensityGrid,
        kernel: &Kernel,
        pooling: PoolingParams,
        floor: ReductionFloor,
    ) -> Result<(PooledMap, ExtractionReport)> {
        let mut feature_map = convolve(grid, &kernel.weights)?;
        let feature_dims = (feature_map.height(), feature_map.width());
        rectify(&mut feature_map);
        let activated_dims = (feature_map.height(), feature_map.width());

        let mut current = feature_map;
        let mut passes = 0;
        loop {
            let pooled = max_pool(&current, pooling)?;
            if pooled.len() >= current.len() {
                return Err(ShapeVisionError::NoPoolingProgress(format!(
                    "pass {} kept {} at {} elements (pool {} stride {})",
                    passes + 1,
                    current.dims(),
                    pooled.len(),
                    pooling.size,
                    pooling.stride
                )));
            }
            passes += 1;
            trace!(kernel = %kernel.id, pass = passes, dims = %pooled.dims(), "pooled");
            current = pooled;

            if floor.is_reached(&current) {
                break;
            }
            if passes >= MAX_POOLING_PASSES {
                return Err(ShapeVisionError::NoPoolingProgress(format!(
                    "floor {:?} not reached after {} passes, map is {}",
                    floor,
                    passes,
                    current.dims()
                )));
            }
        }

        let report = ExtractionReport {
            grid_dims: (grid.height(), grid.width()),
            kernel_dims: (kernel.height(), kernel.width()),
            feature_dims,
            activated_dims,
            pooled_dims: (current.height(), current.width()),
            pooling_passes: passes,
        };
        Ok((current, report))
    }

    /// "Valid" mode 2-D convolution with stride 1.
    pub fn convolve(grid: &Grid, weights: &Grid) -> Result<Grid> {
        if weights.height() > grid.height() || weights.width() > grid.width() {
            return Err(ShapeVisionError::Dimension(format!(
                "kernel {} does not fit grid {}",
                weights.dims(),
                grid.dims()
            )));
        }
        let out_h = grid.height() - weights.height() + 1;
        let out_w = grid.width() - weights.width() + 1;
        let mut output = Grid::zeros(out_w, out_h);

        for i in 0..out_h {
            for j in 0..out_w {
                let mut sum = 0.0;
                for (ki, kernel_row) in weights.rows().enumerate() {
                    let window = &grid.row(i + ki)[j..j + weights.width()];
                    sum += window
                        .iter()
                        .zip(kernel_row)
                        .map(|(v, w)| v * w)
                        .sum::<f64>();
                }
                output.set(i, j, sum);
            }
        }
        Ok(output)
    }

    /// Clamps negative responses to zero in place.
    pub fn rectify(grid: &mut Grid) {
        for value in grid.values_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// A single max-pooling pass. The output dimensions are checked before any
    /// window is read.
    pub fn max_pool(grid: &Grid, pooling: PoolingParams) -> Result<Grid> {
        let PoolingParams {
            size,
            stride,
            policy,
        } = pooling;
        let (out_h, out_w) = match (
            policy.output_len(grid.height(), size, stride),
            policy.output_len(grid.width(), size, stride),
        ) {
            (Some(h), Some(w)) => (h, w),
            _ => {
                return Err(ShapeVisionError::Dimension(format!(
                    "pooling {} with window {} and stride {} ({:?}) yields a non-positive size",
                    grid.dims(),
                    size,
                    stride,
                    policy
                )));
            }
        };

        let mut output = Grid::zeros(out_w, out_h);
        for i in 0..out_h {
            let y0 = i * stride;
            let y1 = (y0 + size).min(grid.height());
            for j in 0..out_w {
                let x0 = j * stride;
                let x1 = (x0 + size).min(grid.width());
                let mut max = f64::NEG_INFINITY;
                for y in y0..y1 {
                    for &value in &grid.row(y)[x0..x1] {
                        if value > max {
                            max = value;
                        }
                    }
                }
                output.set(i, j, max);
            }
        }
        Ok(output)
    }
}
