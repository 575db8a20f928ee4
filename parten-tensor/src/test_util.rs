//! Helpers for comparing tensors in tests.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::iter::zip;

use crate::Tensor;

/// Trait that tests whether two values are approximately equal.
///
/// The comparison accounts for both absolute and relative difference, with
/// defaults matching `torch.allclose` and `np.allclose`.
pub trait ApproxEq: Sized {
    /// Return the default absolute tolerance.
    fn default_abs_tolerance() -> Self;

    /// Return the default relative tolerance.
    fn default_rel_tolerance() -> Self;

    /// Test whether `self` is close to `other` according to:
    ///
    /// ```text
    /// (self - other).abs() <= atol + rtol * other.abs()
    /// ```
    fn approx_eq_with_atol_rtol(&self, other: &Self, atol: Self, rtol: Self) -> bool;

    /// Test if `other` is approximately equal to `self` with the default
    /// tolerances for this type.
    fn approx_eq(&self, other: &Self) -> bool {
        self.approx_eq_with_atol_rtol(
            other,
            Self::default_abs_tolerance(),
            Self::default_rel_tolerance(),
        )
    }
}

impl ApproxEq for f32 {
    #[inline]
    fn default_abs_tolerance() -> f32 {
        1e-8
    }

    #[inline]
    fn default_rel_tolerance() -> f32 {
        1e-5
    }

    #[inline]
    fn approx_eq_with_atol_rtol(&self, other: &f32, atol: f32, rtol: f32) -> bool {
        (self - other).abs() <= atol + rtol * other.abs()
    }
}

impl ApproxEq for i32 {
    #[inline]
    fn default_abs_tolerance() -> i32 {
        0
    }

    #[inline]
    fn default_rel_tolerance() -> i32 {
        0
    }

    #[inline]
    fn approx_eq_with_atol_rtol(&self, other: &i32, atol: i32, rtol: i32) -> bool {
        (self - other).abs() <= atol + rtol * other.abs()
    }
}

#[derive(Debug)]
pub enum ExpectEqualError {
    ShapeMismatch(String),
    ValueMismatch(String),
}

impl Display for ExpectEqualError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectEqualError::ShapeMismatch(details) => write!(f, "{}", details),
            ExpectEqualError::ValueMismatch(details) => write!(f, "{}", details),
        }
    }
}

impl Error for ExpectEqualError {}

/// Check that two tensors have equal shapes and approximately equal contents.
///
/// Returns an `Err` describing the first few mismatched elements otherwise.
pub fn expect_equal<T: Clone + Debug + ApproxEq>(
    x: &Tensor<T>,
    y: &Tensor<T>,
) -> Result<(), ExpectEqualError> {
    expect_equal_with_tolerance(x, y, T::default_abs_tolerance(), T::default_rel_tolerance())
}

/// Like [`expect_equal`] but with custom absolute and relative tolerances.
pub fn expect_equal_with_tolerance<T: Clone + Debug + ApproxEq>(
    x: &Tensor<T>,
    y: &Tensor<T>,
    atol: T,
    rtol: T,
) -> Result<(), ExpectEqualError> {
    if x.shape() != y.shape() {
        return Err(ExpectEqualError::ShapeMismatch(format!(
            "Tensors have different shapes. {:?} vs. {:?}",
            x.shape(),
            y.shape()
        )));
    }

    let mismatches: Vec<_> = zip(x.iter(), y.iter())
        .enumerate()
        .filter_map(|(i, (xi, yi))| {
            if !xi.approx_eq_with_atol_rtol(yi, atol.clone(), rtol.clone()) {
                Some((i, xi.clone(), yi.clone()))
            } else {
                None
            }
        })
        .collect();

    if mismatches.is_empty() {
        return Ok(());
    }

    let max_examples = 16;
    Err(ExpectEqualError::ValueMismatch(format!(
        "Tensor values differ at {} of {} indexes: {:?}{}",
        mismatches.len(),
        x.len(),
        &mismatches[..mismatches.len().min(max_examples)],
        if mismatches.len() > max_examples {
            "..."
        } else {
            ""
        }
    )))
}
