use crate::core_modules::grid::Grid;
use crate::error::{Result, ShapeVisionError};

/// A fixed, hand-authored filter. Kernels are never trained; only the reference
/// rows captured with them grow over time.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    /// Identifier the reference rows for this kernel are stored under.
    pub id: String,
    pub weights: Grid,
}

impl Kernel {
    pub fn new(id: impl Into<String>, weights: Grid) -> Self {
        Self {
            id: id.into(),
            weights,
        }
    }

    pub fn from_rows(id: impl Into<String>, rows: &[Vec<f64>]) -> Result<Self> {
        let id = id.into();
        let weights = Grid::from_rows(rows)
            .map_err(|e| ShapeVisionError::InvalidConfig(format!("kernel '{}': {}", id, e)))?;
        Ok(Self { id, weights })
    }

    pub fn height(&self) -> usize {
        self.weights.height()
    }

    pub fn width(&self) -> usize {
        self.weights.width()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_rows() {
        let kernel = Kernel::from_rows(
            "vertical",
            &[vec![-1.0, 2.0, -1.0], vec![-1.0, 2.0, -1.0]],
        )
        .unwrap();
        assert_eq!(kernel.height(), 2);
        assert_eq!(kernel.width(), 3);
    }

    #[test]
    fn ragged_weights_are_a_config_error() {
        let err = Kernel::from_rows("bad", &[vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert!(matches!(err, ShapeVisionError::InvalidConfig(msg) if msg.contains("bad")));
    }
}
