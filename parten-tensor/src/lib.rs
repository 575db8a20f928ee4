//! Dense row-major tensors for the parten inference engine.
//!
//! [`Tensor`] is intentionally minimal: a shape plus a contiguous buffer.
//! All data movement (slicing, transposition, broadcasting) is performed by
//! backend kernels operating on the raw buffer, so there are no view or
//! stride-permutation types here.

pub mod test_util;

use std::ops::{Index, IndexMut};

/// An N-dimensional array with a contiguous row-major buffer.
///
/// The element count of a tensor is the product of its dimensions, so a
/// scalar (rank 0) holds exactly one element.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Create a tensor from a shape and elements in row-major order.
    ///
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_data(shape: &[usize], data: Vec<T>) -> Tensor<T> {
        let expected: usize = shape.iter().product();
        assert!(
            data.len() == expected,
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        Tensor {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Create a 1-D tensor from a vector of elements.
    pub fn from_vec(data: Vec<T>) -> Tensor<T> {
        let len = data.len();
        Tensor {
            shape: vec![len],
            data,
        }
    }

    /// Create a rank-0 tensor holding a single value.
    pub fn scalar(value: T) -> Tensor<T> {
        Tensor {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Return the size of each dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Return the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the size of dimension `dim`.
    pub fn size(&self, dim: usize) -> usize {
        self.shape[dim]
    }

    /// Return the total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Return true if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the elements in row-major order.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Return a mutable slice of the elements in row-major order.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consume the tensor and return its elements.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Return an iterator over elements in row-major order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    /// Return the row-major stride of each dimension, in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for dim in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * self.shape[dim + 1];
        }
        strides
    }

    /// Return the linear offset of the element at `index`.
    ///
    /// Panics if `index` has the wrong length or is out of bounds.
    pub fn offset(&self, index: &[usize]) -> usize {
        assert!(
            index.len() == self.shape.len(),
            "index length {} does not match rank {}",
            index.len(),
            self.shape.len()
        );
        let mut offset = 0;
        let mut stride = 1;
        for dim in (0..self.shape.len()).rev() {
            assert!(
                index[dim] < self.shape[dim],
                "index {:?} out of bounds for shape {:?}",
                index,
                self.shape
            );
            offset += index[dim] * stride;
            stride *= self.shape[dim];
        }
        offset
    }

    /// Consume the tensor and return one with the same elements and a new
    /// shape.
    ///
    /// Panics if the new shape has a different element count.
    pub fn into_shape(self, shape: &[usize]) -> Tensor<T> {
        let expected: usize = shape.iter().product();
        assert!(
            self.data.len() == expected,
            "cannot reshape {} elements to shape {:?}",
            self.data.len(),
            shape
        );
        Tensor {
            shape: shape.to_vec(),
            data: self.data,
        }
    }

    /// Return a new tensor with the same shape and each element mapped
    /// through `f`.
    pub fn map<U, F: Fn(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Clone> Tensor<T> {
    /// Create a tensor with every element set to `value`.
    pub fn full(shape: &[usize], value: T) -> Tensor<T> {
        let len = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; len],
        }
    }
}

impl<T: Clone + Default> Tensor<T> {
    /// Create a tensor filled with the default value (zero for numbers).
    pub fn zeros(shape: &[usize]) -> Tensor<T> {
        Self::full(shape, T::default())
    }
}

impl<T, const N: usize> Index<[usize; N]> for Tensor<T> {
    type Output = T;

    fn index(&self, index: [usize; N]) -> &T {
        &self.data[self.offset(&index)]
    }
}

impl<T, const N: usize> IndexMut<[usize; N]> for Tensor<T> {
    fn index_mut(&mut self, index: [usize; N]) -> &mut T {
        let offset = self.offset(&index);
        &mut self.data[offset]
    }
}

impl<'a, T> IntoIterator for &'a Tensor<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use parten_testing::TestCases;

    use super::Tensor;

    #[test]
    fn test_from_data() {
        let tensor = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.ndim(), 2);
        assert_eq!(tensor.len(), 6);
        assert_eq!(tensor.size(1), 3);
        assert_eq!(tensor.data(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    #[should_panic(expected = "data length 5 does not match shape [2, 3]")]
    fn test_from_data_length_mismatch() {
        Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_scalar() {
        let tensor = Tensor::scalar(42.0);
        assert_eq!(tensor.ndim(), 0);
        assert_eq!(tensor.len(), 1);
        assert_eq!(tensor[[]], 42.0);
    }

    #[test]
    fn test_strides_and_offset() {
        #[derive(Debug)]
        struct Case {
            shape: Vec<usize>,
            index: Vec<usize>,
            expected: usize,
        }

        let cases = [
            Case {
                shape: vec![2, 3, 4],
                index: vec![0, 0, 0],
                expected: 0,
            },
            Case {
                shape: vec![2, 3, 4],
                index: vec![1, 2, 3],
                expected: 23,
            },
            Case {
                shape: vec![5],
                index: vec![3],
                expected: 3,
            },
        ];

        cases.test_each(|case| {
            let tensor = Tensor::<i32>::zeros(&case.shape);
            assert_eq!(tensor.offset(&case.index), case.expected);
        });

        let tensor = Tensor::<i32>::zeros(&[2, 3, 4]);
        assert_eq!(tensor.strides(), &[12, 4, 1]);
    }

    #[test]
    fn test_indexing() {
        let mut tensor = Tensor::from_data(&[2, 2], vec![1, 2, 3, 4]);
        assert_eq!(tensor[[0, 1]], 2);
        assert_eq!(tensor[[1, 0]], 3);
        tensor[[1, 1]] = 9;
        assert_eq!(tensor.data(), &[1, 2, 3, 9]);
    }

    #[test]
    fn test_into_shape() {
        let tensor = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        let reshaped = tensor.into_shape(&[3, 2]);
        assert_eq!(reshaped.shape(), &[3, 2]);
        assert_eq!(reshaped.data(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_map() {
        let tensor = Tensor::from_data(&[2, 2], vec![1, 2, 3, 4]);
        let doubled = tensor.map(|x| x * 2);
        assert_eq!(doubled.shape(), &[2, 2]);
        assert_eq!(doubled.data(), &[2, 4, 6, 8]);
    }

    #[test]
    fn test_full_and_zeros() {
        let full = Tensor::full(&[3], 7.5);
        assert_eq!(full.data(), &[7.5, 7.5, 7.5]);
        let zeros = Tensor::<f32>::zeros(&[2, 2]);
        assert_eq!(zeros.data(), &[0., 0., 0., 0.]);
    }
}
