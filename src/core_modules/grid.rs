// THEORY:
// The `Grid` is the single numeric container that flows through the whole engine.
// The same row-major layout is used for three different roles:
//
// 1.  **IntensityGrid**: the normalized grayscale image handed to us by the image
//     preprocessing layer. Every value is in [0, 1].
// 2.  **Kernel weights**: the small, hand-authored filter that is slid across the image.
// 3.  **PooledMap**: the tiny grid left over after convolution, rectification and
//     repeated max-pooling. Its rows are what we store and compare.
//
// A `Grid` is a "dumb" data container. It knows its dimensions and how to hand out
// rows, but it does not know how to convolve or pool itself. Those operations live in
// the stateless `feature_extractor`.

use crate::error::{Result, ShapeVisionError};

/// A dense 2-D grid of real values stored row by row.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

/// The normalized grayscale image fed into extraction.
pub type IntensityGrid = Grid;

/// The output of one kernel applied to one image after full pooling reduction.
pub type PooledMap = Grid;

impl Grid {
    /// Builds a grid from flat row-major data. Both dimensions must be non-zero
    /// and the data length must match them exactly.
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(ShapeVisionError::Dimension(format!(
                "grid must have non-zero dimensions, got {}x{}",
                height, width
            )));
        }
        if data.len() != width * height {
            return Err(ShapeVisionError::Dimension(format!(
                "grid of {}x{} needs {} values, got {}",
                height,
                width,
                width * height,
                data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Builds a grid from nested rows. Rows must all have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(ragged) = rows.iter().position(|row| row.len() != width) {
            return Err(ShapeVisionError::Dimension(format!(
                "row {} has {} values, expected {}",
                ragged,
                rows[ragged].len(),
                width
            )));
        }
        Self::new(width, height, rows.concat())
    }

    pub(crate) fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, y: usize, x: usize) -> f64 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub(crate) fn set(&mut self, y: usize, x: usize, value: f64) {
        self.data[y * self.width + x] = value;
    }

    /// One row as a slice.
    pub fn row(&self, y: usize) -> &[f64] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks(self.width)
    }

    /// Rows copied out as owned vectors, the shape reference rows are stored in.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.rows().map(<[f64]>::to_vec).collect()
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn values_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// "height x width", the way dimensions are reported in logs.
    pub fn dims(&self) -> String {
        format!("{}x{}", self.height, self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_row_major() {
        let grid = Grid::new(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(grid.row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(grid.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(grid.get(1, 2), 6.0);
        assert_eq!(grid.rows().count(), 2);
        assert_eq!(grid.dims(), "2x3");
    }

    #[test]
    fn rejects_length_mismatch() {
        assert!(matches!(
            Grid::new(3, 3, vec![0.0; 8]),
            Err(ShapeVisionError::Dimension(_))
        ));
    }

    #[test]
    fn rejects_zero_dimension() {
        assert!(Grid::new(0, 3, vec![]).is_err());
        assert!(Grid::from_rows(&[]).is_err());
    }

    #[test]
    fn rejects_ragged_rows() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            Grid::from_rows(&rows),
            Err(ShapeVisionError::Dimension(_))
        ));
    }

    #[test]
    fn from_rows_round_trips_to_rows() {
        let rows = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        let grid = Grid::from_rows(&rows).unwrap();
        assert_eq!(grid.to_rows(), rows);
    }
}
