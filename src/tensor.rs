//! Shape-carrying tensor wrapper
//!
//! Kernels run on raw `&[f32]` slices; `Tensor` is the boundary type that
//! pairs a flat row-major buffer with its shape and validates the pairing
//! once, at construction. Dense projection weights and the embedding table
//! enter the forward pass through it, so a dimension disagreement surfaces
//! at load time instead of inside a kernel.

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};

/// Row-major N-dimensional array with a validated shape
///
/// # Examples
///
/// ```
/// use inferir::Tensor;
///
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.row(1), &[4.0, 5.0, 6.0]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    data: Vec<T>,
    shape: Vec<usize>,
}

impl<T: Num + Clone> Tensor<T> {
    /// Wrap a flat buffer, checking that it fills the shape exactly
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for an empty shape or a zero dimension,
    /// `DataShapeMismatch` when the data length disagrees with the shape.
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(InferirError::InvalidShape {
                reason: format!("tensor shape {shape:?} holds no elements"),
            });
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(InferirError::DataShapeMismatch {
                data_size: data.len(),
                shape,
                expected,
            });
        }
        Ok(Self { data, shape })
    }

    /// Zero-filled tensor of the given shape
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for an empty shape or a zero dimension.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let len = shape.iter().product();
        Self::from_vec(shape, vec![T::zero(); len])
    }

    /// Shape, outermost dimension first
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total element count
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Flat row-major view
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable flat view; the shape stays fixed
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Unwrap into the flat buffer
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Row `index` of a rank-2 tensor as a contiguous slice
    ///
    /// This is the embedding-table lookup: one row per token id.
    ///
    /// # Panics
    ///
    /// Panics when the tensor is not rank 2 or `index` is out of range.
    #[must_use]
    pub fn row(&self, index: usize) -> &[T] {
        assert_eq!(self.shape.len(), 2, "row lookup needs a rank-2 tensor");
        let cols = self.shape[1];
        &self.data[index * cols..(index + 1) * cols]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_and_row() {
        let t = Tensor::from_vec(vec![3, 2], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.size(), 6);
        assert_eq!(t.row(0), &[0.0, 1.0]);
        assert_eq!(t.row(2), &[4.0, 5.0]);
    }

    #[test]
    fn test_zeros() {
        let t = Tensor::<f32>::zeros(vec![3, 4]).unwrap();
        assert_eq!(t.size(), 12);
        assert!(t.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rejects_degenerate_shapes() {
        assert!(matches!(
            Tensor::from_vec(vec![], vec![1.0]).unwrap_err(),
            InferirError::InvalidShape { .. }
        ));
        assert!(Tensor::<f32>::from_vec(vec![2, 0], vec![]).is_err());
    }

    #[test]
    fn test_rejects_length_mismatch() {
        assert!(matches!(
            Tensor::from_vec(vec![2, 3], vec![1.0, 2.0]).unwrap_err(),
            InferirError::DataShapeMismatch {
                data_size: 2,
                expected: 6,
                ..
            }
        ));
    }

    #[test]
    #[should_panic(expected = "rank-2")]
    fn test_row_requires_rank_two() {
        let t = Tensor::from_vec(vec![4], vec![0.0; 4]).unwrap();
        let _ = t.row(0);
    }

    #[test]
    fn test_data_mut_keeps_shape() {
        let mut t = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        t.data_mut()[0] = 5.0;
        assert_eq!(t.data(), &[5.0, 2.0]);
        assert_eq!(t.shape(), &[2]);
    }
}
