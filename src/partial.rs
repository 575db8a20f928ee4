//! Partially known tensors used during shape inference.

use std::fmt;
use std::fmt::Display;

use crate::dim::SymDim;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

/// Maximum number of elements for which a [`PartialTensor`] tracks
/// per-element knowledge.
///
/// Element tracking exists so that small shape-carrying tensors (the
/// outputs of `Shape`, constants feeding `Reshape` and friends) stay
/// informative. Beyond this size the per-element bookkeeping buys nothing.
pub const MAX_PARTIAL_ELEMENTS: usize = 64;

static UNKNOWN_ELEM: PartialElem = PartialElem::Unknown;

/// A single element of a [`PartialTensor`] whose value may be unknown,
/// known, or a named parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum PartialElem {
    Unknown,
    Int(i32),
    Float(f32),
    Param(String),
}

impl PartialElem {
    /// Convert a symbolic dimension into an element, as the `Shape` layer
    /// does when it reifies a shape into an int tensor.
    pub fn from_dim(dim: &SymDim) -> PartialElem {
        match dim {
            SymDim::Unknown => PartialElem::Unknown,
            SymDim::Value(size) => PartialElem::Int(*size),
            SymDim::Param(name) => PartialElem::Param(name.clone()),
        }
    }

    /// Convert an element back into a symbolic dimension.
    ///
    /// Float elements do not describe dimensions and map to unknown.
    pub fn to_dim(&self) -> SymDim {
        match self {
            PartialElem::Unknown | PartialElem::Float(_) => SymDim::Unknown,
            PartialElem::Int(value) => SymDim::Value(*value),
            PartialElem::Param(name) => SymDim::Param(name.clone()),
        }
    }

    pub fn add(&self, other: &PartialElem) -> PartialElem {
        match (self, other) {
            (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int(a + b),
            (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Float(a + b),
            (x, PartialElem::Int(0)) | (PartialElem::Int(0), x) => x.clone(),
            (x, PartialElem::Float(z)) | (PartialElem::Float(z), x) if *z == 0. => x.clone(),
            _ => PartialElem::Unknown,
        }
    }

    pub fn sub(&self, other: &PartialElem) -> PartialElem {
        match (self, other) {
            (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int(a - b),
            (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Float(a - b),
            (x, PartialElem::Int(0)) => x.clone(),
            (x, PartialElem::Float(z)) if *z == 0. => x.clone(),
            _ => PartialElem::Unknown,
        }
    }

    pub fn mul(&self, other: &PartialElem) -> PartialElem {
        match (self, other) {
            (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int(a * b),
            (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Float(a * b),
            (x, PartialElem::Int(1)) | (PartialElem::Int(1), x) => x.clone(),
            (x, PartialElem::Float(o)) | (PartialElem::Float(o), x) if *o == 1. => x.clone(),
            (_, PartialElem::Int(0)) | (PartialElem::Int(0), _) => PartialElem::Int(0),
            (_, PartialElem::Float(z)) | (PartialElem::Float(z), _) if *z == 0. => {
                PartialElem::Float(0.)
            }
            _ => PartialElem::Unknown,
        }
    }

    /// Divide elements. Int division truncates.
    pub fn div(&self, other: &PartialElem) -> PartialElem {
        match (self, other) {
            (PartialElem::Int(a), PartialElem::Int(b)) if *b != 0 => PartialElem::Int(a / b),
            (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Float(a / b),
            (x, PartialElem::Int(1)) => x.clone(),
            (x, PartialElem::Float(o)) if *o == 1. => x.clone(),
            _ => PartialElem::Unknown,
        }
    }

    /// Compare elements for equality.
    ///
    /// Two identical params compare equal even though their value is
    /// unknown. A param compared against anything else is undecidable.
    pub fn equal(&self, other: &PartialElem) -> PartialElem {
        match (self, other) {
            (PartialElem::Unknown, _) | (_, PartialElem::Unknown) => PartialElem::Unknown,
            (a, b) if a == b => PartialElem::Int(1),
            (PartialElem::Param(_), _) | (_, PartialElem::Param(_)) => PartialElem::Unknown,
            _ => PartialElem::Int(0),
        }
    }
}

/// A tensor whose dtype, shape and (for small tensors) element values are
/// each independently either known or unknown.
///
/// This is the type of layer inputs and outputs during shape inference.
/// Besides the symbolic shape, a partial tensor of at most
/// [`MAX_PARTIAL_ELEMENTS`] elements also tracks what is known about each
/// element, which lets shape-carrying int tensors flow through arithmetic
/// into layers like `Reshape` without losing information.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialTensor {
    dtype: DataType,
    shape: SymShape,
    elems: Option<Vec<PartialElem>>,
}

impl PartialTensor {
    /// Create a partial tensor with the given dtype and shape and no
    /// element knowledge.
    ///
    /// If the shape is fully known and small, per-element tracking is
    /// enabled with every element unknown.
    pub fn new(dtype: DataType, shape: SymShape) -> PartialTensor {
        let elems = shape.to_concrete().and_then(|sizes| {
            let len: usize = sizes.iter().product();
            (len <= MAX_PARTIAL_ELEMENTS).then(|| vec![PartialElem::Unknown; len])
        });
        PartialTensor {
            dtype,
            shape,
            elems,
        }
    }

    /// Create a partial tensor about which only the dtype is known.
    pub fn unknown(dtype: DataType) -> PartialTensor {
        PartialTensor {
            dtype,
            shape: SymShape::unknown(),
            elems: None,
        }
    }

    /// Create a partial tensor with known shape and the given elements.
    ///
    /// Panics if the shape is not fully known or the element count does
    /// not match it.
    pub fn from_elems(dtype: DataType, shape: SymShape, elems: Vec<PartialElem>) -> PartialTensor {
        let len: usize = shape
            .to_concrete()
            .map(|sizes| sizes.iter().product())
            .expect("shape must be fully known");
        assert!(
            len == elems.len(),
            "element count {} does not match shape {}",
            elems.len(),
            shape
        );
        PartialTensor {
            dtype,
            shape,
            elems: Some(elems),
        }
    }

    /// Create a fully known rank-1 int tensor.
    pub fn from_ints(values: &[i32]) -> PartialTensor {
        PartialTensor::from_elems(
            DataType::Int,
            SymShape::fixed(&[values.len()]),
            values.iter().map(|&v| PartialElem::Int(v)).collect(),
        )
    }

    /// Create a rank-1 int tensor whose elements mirror the given
    /// dimensions, as produced by the `Shape` layer.
    pub fn from_dims(dims: &[SymDim]) -> PartialTensor {
        PartialTensor::from_elems(
            DataType::Int,
            SymShape::fixed(&[dims.len()]),
            dims.iter().map(PartialElem::from_dim).collect(),
        )
    }

    /// Create a partial tensor that fully describes a concrete value.
    ///
    /// Elements are tracked only for small values.
    pub fn from_value(value: &Value) -> PartialTensor {
        let shape = SymShape::fixed(value.shape());
        let elems = (value.len() <= MAX_PARTIAL_ELEMENTS).then(|| match value {
            Value::Float(t) => t.iter().map(|&x| PartialElem::Float(x)).collect(),
            Value::Int(t) => t.iter().map(|&x| PartialElem::Int(x)).collect(),
        });
        PartialTensor {
            dtype: value.dtype(),
            shape,
            elems,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &SymShape {
        &self.shape
    }

    /// Return the tracked elements, if this tensor tracks any.
    pub fn elems(&self) -> Option<&[PartialElem]> {
        self.elems.as_deref()
    }

    /// Return what is known about element `index`.
    pub fn elem(&self, index: usize) -> &PartialElem {
        self.elems
            .as_ref()
            .and_then(|elems| elems.get(index))
            .unwrap_or(&UNKNOWN_ELEM)
    }

    /// Return true if any per-element knowledge is tracked.
    pub fn is_partially_known(&self) -> bool {
        self.elems.is_some()
    }

    /// Return true if the value of every element is known.
    pub fn is_fully_known(&self) -> bool {
        self.elems.as_ref().is_some_and(|elems| {
            elems
                .iter()
                .all(|e| matches!(e, PartialElem::Int(_) | PartialElem::Float(_)))
        })
    }

    /// Return the elements as concrete ints if all of them are known.
    ///
    /// This is how shape-consuming layers (`Reshape`, `Expand`, `Tile`,
    /// `Slice`, ...) read their shape arguments during inference.
    pub fn as_i32s(&self) -> Option<Vec<i32>> {
        self.elems.as_ref().and_then(|elems| {
            elems
                .iter()
                .map(|e| match e {
                    PartialElem::Int(v) => Some(*v),
                    _ => None,
                })
                .collect()
        })
    }

    /// Interpret this tensor as a shape.
    ///
    /// A rank-1 tensor maps element-wise to dimensions, preserving params.
    /// A rank-1 tensor of known length but untracked elements maps to a
    /// shape of that rank with unknown dimensions. Anything else maps to a
    /// fully unknown shape.
    pub fn to_shape(&self) -> SymShape {
        if self.shape.rank() != Some(1) {
            return SymShape::unknown();
        }
        if let Some(elems) = self.elems() {
            elems.iter().map(PartialElem::to_dim).collect()
        } else if let Some(len) = self.shape.dim(0).as_value() {
            SymShape::unknown_of_rank(len as usize)
        } else {
            SymShape::unknown()
        }
    }

    /// Return this tensor with a new shape, keeping element knowledge when
    /// the element count is unchanged.
    pub fn reshaped(&self, shape: SymShape) -> PartialTensor {
        match (&self.elems, shape.to_concrete()) {
            (Some(elems), Some(sizes)) if sizes.iter().product::<usize>() == elems.len() => {
                PartialTensor {
                    dtype: self.dtype,
                    shape,
                    elems: Some(elems.clone()),
                }
            }
            _ => PartialTensor::new(self.dtype, shape),
        }
    }

    /// Return this tensor converted to another dtype.
    ///
    /// Known elements convert numerically (float to int truncates). Param
    /// elements do not survive a dtype change.
    pub fn cast_to(&self, dtype: DataType) -> PartialTensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let elems = self.elems.as_ref().map(|elems| {
            elems
                .iter()
                .map(|e| match (e, dtype) {
                    (PartialElem::Int(v), DataType::Float) => PartialElem::Float(*v as f32),
                    (PartialElem::Float(x), DataType::Int) => PartialElem::Int(*x as i32),
                    _ => PartialElem::Unknown,
                })
                .collect()
        });
        PartialTensor {
            dtype,
            shape: self.shape.clone(),
            elems,
        }
    }
}

impl Display for PartialTensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.dtype, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use super::{PartialElem, PartialTensor, MAX_PARTIAL_ELEMENTS};
    use crate::dim::SymDim;
    use crate::shape::SymShape;
    use crate::value::{DataType, Value};

    #[test]
    fn test_new_allocates_small_tensors() {
        let small = PartialTensor::new(DataType::Float, SymShape::fixed(&[2, 3]));
        assert!(small.is_partially_known());
        assert_eq!(small.elems().map(|e| e.len()), Some(6));
        assert_eq!(small.elem(0), &PartialElem::Unknown);

        let large = PartialTensor::new(
            DataType::Float,
            SymShape::fixed(&[MAX_PARTIAL_ELEMENTS + 1]),
        );
        assert!(!large.is_partially_known());
        assert_eq!(large.elem(0), &PartialElem::Unknown);

        let symbolic = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec![SymDim::param("batch")]),
        );
        assert!(!symbolic.is_partially_known());
    }

    #[test]
    fn test_from_ints_round_trip() {
        let partial = PartialTensor::from_ints(&[2, 3, 4]);
        assert_eq!(partial.dtype(), DataType::Int);
        assert_eq!(partial.as_i32s(), Some(vec![2, 3, 4]));
        assert!(partial.is_fully_known());
        assert_eq!(partial.to_shape(), SymShape::fixed(&[2, 3, 4]));
    }

    #[test]
    fn test_from_dims_preserves_params() {
        let dims = [
            SymDim::param("batch"),
            SymDim::Value(3),
            SymDim::Unknown,
        ];
        let partial = PartialTensor::from_dims(&dims);

        // Params are not concrete ints.
        assert_eq!(partial.as_i32s(), None);

        // But they survive the round trip back into a shape.
        assert_eq!(partial.to_shape(), SymShape::from_dims(dims.to_vec()));
    }

    #[test]
    fn test_to_shape_without_elements() {
        let vec5 = PartialTensor {
            dtype: DataType::Int,
            shape: SymShape::fixed(&[5]),
            elems: None,
        };
        assert_eq!(vec5.to_shape(), SymShape::unknown_of_rank(5));

        let matrix = PartialTensor::new(DataType::Int, SymShape::fixed(&[2, 2]));
        assert_eq!(matrix.to_shape(), SymShape::unknown());
    }

    #[test]
    fn test_from_value() {
        let value: Value = Tensor::from_vec(vec![1, 2, 3]).into();
        let partial = PartialTensor::from_value(&value);
        assert_eq!(partial.dtype(), DataType::Int);
        assert_eq!(partial.shape(), &SymShape::fixed(&[3]));
        assert_eq!(partial.as_i32s(), Some(vec![1, 2, 3]));

        let big: Value = Tensor::from_data(&[100], vec![0.; 100]).into();
        let partial = PartialTensor::from_value(&big);
        assert_eq!(partial.shape(), &SymShape::fixed(&[100]));
        assert!(!partial.is_partially_known());
    }

    #[test]
    fn test_elem_arithmetic() {
        #[derive(Debug)]
        struct Case {
            result: PartialElem,
            expected: PartialElem,
        }

        let batch = || PartialElem::Param("batch".to_string());

        let cases = [
            Case {
                result: PartialElem::Int(3).add(&PartialElem::Int(4)),
                expected: PartialElem::Int(7),
            },
            Case {
                result: PartialElem::Float(1.5).mul(&PartialElem::Float(2.)),
                expected: PartialElem::Float(3.),
            },
            Case {
                result: batch().add(&PartialElem::Int(0)),
                expected: batch(),
            },
            Case {
                result: batch().sub(&PartialElem::Int(0)),
                expected: batch(),
            },
            Case {
                result: batch().mul(&PartialElem::Int(1)),
                expected: batch(),
            },
            Case {
                result: batch().mul(&PartialElem::Int(0)),
                expected: PartialElem::Int(0),
            },
            Case {
                result: batch().div(&PartialElem::Int(1)),
                expected: batch(),
            },
            Case {
                result: PartialElem::Int(7).div(&PartialElem::Int(2)),
                expected: PartialElem::Int(3),
            },
            Case {
                result: PartialElem::Int(1).div(&PartialElem::Int(0)),
                expected: PartialElem::Unknown,
            },
            Case {
                result: batch().add(&PartialElem::Int(2)),
                expected: PartialElem::Unknown,
            },
            Case {
                result: PartialElem::Unknown.mul(&PartialElem::Int(2)),
                expected: PartialElem::Unknown,
            },
        ];

        cases.test_each(|case| {
            assert_eq!(case.result, case.expected);
        })
    }

    #[test]
    fn test_elem_equal() {
        let batch = || PartialElem::Param("batch".to_string());
        let seq = || PartialElem::Param("seq".to_string());

        // The same param is equal to itself even though its value is
        // unknown.
        assert_eq!(batch().equal(&batch()), PartialElem::Int(1));
        assert_eq!(batch().equal(&seq()), PartialElem::Unknown);
        assert_eq!(batch().equal(&PartialElem::Int(3)), PartialElem::Unknown);
        assert_eq!(
            PartialElem::Int(3).equal(&PartialElem::Int(3)),
            PartialElem::Int(1)
        );
        assert_eq!(
            PartialElem::Int(3).equal(&PartialElem::Int(4)),
            PartialElem::Int(0)
        );
        assert_eq!(
            PartialElem::Unknown.equal(&PartialElem::Int(4)),
            PartialElem::Unknown
        );
    }

    #[test]
    fn test_reshaped() {
        let partial = PartialTensor::from_ints(&[1, 2, 3, 4]);
        let reshaped = partial.reshaped(SymShape::fixed(&[2, 2]));
        assert_eq!(reshaped.shape(), &SymShape::fixed(&[2, 2]));
        assert_eq!(reshaped.as_i32s(), Some(vec![1, 2, 3, 4]));

        // Reshaping to a symbolic shape drops element knowledge.
        let symbolic = partial.reshaped(SymShape::from_dims(vec![SymDim::param("n")]));
        assert!(!symbolic.is_partially_known());
    }

    #[test]
    fn test_cast() {
        let ints = PartialTensor::from_ints(&[1, 2]);
        let floats = ints.cast_to(DataType::Float);
        assert_eq!(floats.dtype(), DataType::Float);
        assert_eq!(floats.elem(0), &PartialElem::Float(1.));

        let back = floats.cast_to(DataType::Int);
        assert_eq!(back.as_i32s(), Some(vec![1, 2]));

        // Params do not survive a dtype change.
        let dims = PartialTensor::from_dims(&[SymDim::param("batch")]);
        let cast = dims.cast_to(DataType::Float);
        assert_eq!(cast.elem(0), &PartialElem::Unknown);
    }
}
