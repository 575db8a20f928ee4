//! Symbolic tensor shapes.

use std::fmt;
use std::fmt::Display;
use std::ops::Index;

use crate::dim::SymDim;
use crate::error::LayerError;

/// A tensor shape in which the rank itself may be unknown, and each
/// dimension is a [`SymDim`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymShape {
    /// `None` if even the rank of the tensor is unknown.
    dims: Option<Vec<SymDim>>,
}

impl SymShape {
    /// Create a shape about which nothing is known, not even the rank.
    pub fn unknown() -> SymShape {
        SymShape { dims: None }
    }

    /// Create a shape of known rank where every dimension is unknown.
    pub fn unknown_of_rank(rank: usize) -> SymShape {
        SymShape {
            dims: Some(vec![SymDim::Unknown; rank]),
        }
    }

    /// Create a shape from dimensions.
    pub fn from_dims(dims: Vec<SymDim>) -> SymShape {
        SymShape { dims: Some(dims) }
    }

    /// Create a fully known shape.
    pub fn fixed(sizes: &[usize]) -> SymShape {
        SymShape {
            dims: Some(sizes.iter().map(|&size| SymDim::from(size)).collect()),
        }
    }

    /// Return the rank, or `None` if the rank is unknown.
    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(|dims| dims.len())
    }

    /// Return the dimensions, or `None` if the rank is unknown.
    pub fn dims(&self) -> Option<&[SymDim]> {
        self.dims.as_deref()
    }

    /// Return the dimension at `index`, or [`SymDim::Unknown`] if the rank
    /// is unknown or `index` is out of range.
    pub fn dim(&self, index: usize) -> SymDim {
        self.dims
            .as_ref()
            .and_then(|dims| dims.get(index))
            .cloned()
            .unwrap_or(SymDim::Unknown)
    }

    /// Require this shape to have rank `rank`.
    ///
    /// If the rank is unknown, the result has `rank` unknown dimensions.
    /// If the rank is known and differs, this fails with `RankMismatch`.
    pub fn declare_rank(&self, rank: usize) -> Result<SymShape, LayerError> {
        match self.rank() {
            None => Ok(SymShape::unknown_of_rank(rank)),
            Some(actual) if actual == rank => Ok(self.clone()),
            Some(actual) => Err(LayerError::RankMismatch {
                expected: rank,
                actual,
            }),
        }
    }

    /// Resolve a possibly negative axis to a dimension index.
    ///
    /// Fails with `ValueError` if the rank is unknown, or `AxisOutOfRange`
    /// if the axis does not name a dimension.
    pub fn axis(&self, axis: i32) -> Result<usize, LayerError> {
        let rank = self
            .rank()
            .ok_or(LayerError::ValueError("axis requires a known rank"))?;
        let resolved = if axis < 0 { axis + rank as i32 } else { axis };
        if resolved >= 0 && (resolved as usize) < rank {
            Ok(resolved as usize)
        } else {
            Err(LayerError::AxisOutOfRange { axis, rank })
        }
    }

    /// Broadcast two shapes following numpy rules.
    ///
    /// Shapes are right-aligned; missing leading dimensions are treated as
    /// 1. If either rank is unknown the result has unknown rank.
    pub fn broadcast(&self, other: &SymShape) -> Result<SymShape, LayerError> {
        let (Some(a), Some(b)) = (self.dims(), other.dims()) else {
            return Ok(SymShape::unknown());
        };
        let rank = a.len().max(b.len());
        let one = SymDim::Value(1);
        let mut dims = Vec::with_capacity(rank);
        for i in 0..rank {
            // Right-aligned index into each operand.
            let dim_a = i
                .checked_sub(rank - a.len())
                .map(|ai| &a[ai])
                .unwrap_or(&one);
            let dim_b = i
                .checked_sub(rank - b.len())
                .map(|bi| &b[bi])
                .unwrap_or(&one);
            dims.push(dim_a.broadcast(dim_b)?);
        }
        Ok(SymShape::from_dims(dims))
    }

    /// Merge two shapes that are required to be equal, dimension by
    /// dimension.
    pub fn unify(&self, other: &SymShape) -> Result<SymShape, LayerError> {
        let (Some(a), Some(b)) = (self.dims(), other.dims()) else {
            // One side has unknown rank; the other side is the merge.
            return Ok(if self.dims.is_some() {
                self.clone()
            } else {
                other.clone()
            });
        };
        if a.len() != b.len() {
            return Err(LayerError::RankMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        let dims: Result<Vec<_>, _> = a.iter().zip(b).map(|(da, db)| da.unify(db)).collect();
        Ok(SymShape::from_dims(dims?))
    }

    /// Return true if the rank and every dimension size are known.
    pub fn is_fully_known(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|dims| dims.iter().all(|dim| dim.as_value().is_some()))
    }

    /// Return the concrete sizes if the shape is fully known.
    pub fn to_concrete(&self) -> Option<Vec<usize>> {
        self.dims.as_ref().and_then(|dims| {
            dims.iter()
                .map(|dim| dim.as_value().map(|size| size as usize))
                .collect()
        })
    }

    /// Return the number of elements as a symbolic dimension.
    ///
    /// A known zero dimension makes the product zero even if other
    /// dimensions are unknown.
    pub fn size(&self) -> SymDim {
        let Some(dims) = self.dims() else {
            return SymDim::Unknown;
        };
        dims.iter()
            .fold(SymDim::Value(1), |product, dim| product * dim.clone())
    }
}

impl From<Vec<SymDim>> for SymShape {
    fn from(dims: Vec<SymDim>) -> SymShape {
        SymShape::from_dims(dims)
    }
}

impl FromIterator<SymDim> for SymShape {
    fn from_iter<I: IntoIterator<Item = SymDim>>(iter: I) -> SymShape {
        SymShape::from_dims(iter.into_iter().collect())
    }
}

impl Index<usize> for SymShape {
    type Output = SymDim;

    /// Return the dimension at `index`.
    ///
    /// Panics if the rank is unknown or `index` is out of range. Use
    /// [`dim`](SymShape::dim) for a non-panicking variant.
    fn index(&self, index: usize) -> &SymDim {
        &self.dims.as_ref().expect("rank is unknown")[index]
    }
}

impl Display for SymShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.dims() {
            None => write!(f, "unknown"),
            Some(dims) => {
                write!(f, "[")?;
                for (i, dim) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", dim)?;
                }
                write!(f, "]")
            }
        }
    }
}
