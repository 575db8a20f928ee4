//! Symbolic tensor dimensions.

use std::fmt;
use std::fmt::Display;
use std::ops::{Add, Div, Mul, Sub};

use crate::error::LayerError;

/// Padding policy for convolution and pooling windows.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AutoPad {
    /// Use the explicit padding amounts supplied by the layer.
    #[default]
    NotSet,
    /// No padding. The window never leaves the input.
    Valid,
    /// Pad so the output size is `ceil(input / stride)`, with any extra
    /// padding added at the end of the dimension.
    SameUpper,
    /// Like [`SameUpper`](AutoPad::SameUpper) but extra padding is added at
    /// the start of the dimension.
    SameLower,
}

/// A tensor dimension whose size may be unknown, known, or a named
/// parameter such as "batch".
///
/// Dimensions have value semantics. Arithmetic between two [`Value`]s
/// produces a [`Value`]; an operation involving [`Unknown`] or [`Param`]
/// produces [`Unknown`] unless the other operand is a neutral element for
/// that operation (`x + 0`, `x - 0`, `x * 1`, `x / 1` preserve `x`, and
/// `x * 0` is zero).
///
/// [`Value`]: SymDim::Value
/// [`Unknown`]: SymDim::Unknown
/// [`Param`]: SymDim::Param
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymDim {
    /// Nothing is known about this dimension.
    Unknown,
    /// The dimension has a known size.
    Value(i32),
    /// The dimension is a named parameter, fixed at runtime but unknown
    /// while the graph is analyzed.
    Param(String),
}

impl SymDim {
    /// Create a named parameter dimension.
    pub fn param(name: impl Into<String>) -> SymDim {
        SymDim::Param(name.into())
    }

    /// Return the size if this dimension is a known value.
    pub fn as_value(&self) -> Option<i32> {
        match self {
            SymDim::Value(size) => Some(*size),
            _ => None,
        }
    }

    /// Return true unless this dimension is [`SymDim::Unknown`].
    ///
    /// Note a [`SymDim::Param`] counts as defined even though its size is
    /// not known until runtime.
    pub fn is_defined(&self) -> bool {
        !matches!(self, SymDim::Unknown)
    }

    /// Merge two dimensions that are required to be equal.
    ///
    /// The better-known dimension wins. Fails with `ShapeMismatch` if both
    /// are known values that differ.
    pub fn unify(&self, other: &SymDim) -> Result<SymDim, LayerError> {
        match (self, other) {
            (a, b) if a == b => Ok(a.clone()),
            (SymDim::Unknown, b) => Ok(b.clone()),
            (a, SymDim::Unknown) => Ok(a.clone()),
            (SymDim::Value(a), SymDim::Value(b)) => {
                debug_assert!(a != b);
                Err(LayerError::ShapeMismatch(
                    "dimensions that must be equal have different sizes",
                ))
            }
            (SymDim::Value(size), SymDim::Param(_)) | (SymDim::Param(_), SymDim::Value(size)) => {
                Ok(SymDim::Value(*size))
            }
            // Two different params. Neither can be verified, keep the left.
            (a, _) => Ok(a.clone()),
        }
    }

    /// Return the better-known of two dimensions that are assumed equal.
    ///
    /// Unlike [`unify`](SymDim::unify) this never fails; a known value wins
    /// over a param, which wins over unknown.
    pub fn max_defined(&self, other: &SymDim) -> SymDim {
        match (self, other) {
            (SymDim::Value(_), _) => self.clone(),
            (_, SymDim::Value(_)) => other.clone(),
            (SymDim::Param(_), _) => self.clone(),
            (_, SymDim::Param(_)) => other.clone(),
            _ => SymDim::Unknown,
        }
    }

    /// Broadcast two dimensions following numpy rules.
    ///
    /// A size-1 dimension expands to the other operand. Fails with
    /// `ShapeMismatch` if both sizes are known, differ and neither is 1.
    /// When one side could still turn out to be 1 at runtime (params and
    /// unknowns), the result is the most informative size that does not
    /// over-claim.
    pub fn broadcast(&self, other: &SymDim) -> Result<SymDim, LayerError> {
        match (self, other) {
            (a, b) if a == b => Ok(a.clone()),
            (SymDim::Value(1), b) => Ok(b.clone()),
            (a, SymDim::Value(1)) => Ok(a.clone()),
            (SymDim::Value(a), SymDim::Value(b)) => {
                debug_assert!(a != b);
                Err(LayerError::ShapeMismatch(
                    "operand dimensions cannot be broadcast together",
                ))
            }
            // The param or unknown side must be 1 or equal at runtime, so
            // the known size is safe to claim.
            (SymDim::Value(size), _) | (_, SymDim::Value(size)) => Ok(SymDim::Value(*size)),
            (SymDim::Param(name), SymDim::Unknown) | (SymDim::Unknown, SymDim::Param(name)) => {
                Ok(SymDim::Param(name.clone()))
            }
            // Two different params: either one could be 1.
            _ => Ok(SymDim::Unknown),
        }
    }

    /// Compute the output size of a pooling or convolution window applied
    /// along this dimension.
    ///
    /// `pads` is the total padding across both ends of the dimension and is
    /// only used with [`AutoPad::NotSet`].
    pub fn pool(
        &self,
        kernel: i32,
        stride: i32,
        pads: i32,
        dilation: i32,
        ceil_mode: bool,
        auto_pad: AutoPad,
    ) -> SymDim {
        let window = dilation * (kernel - 1) + 1;
        match auto_pad {
            AutoPad::NotSet => {
                if window == 1 && stride == 1 && pads == 0 {
                    return self.clone();
                }
                match self.as_value() {
                    Some(size) => {
                        let span = size + pads - window;
                        let out = if ceil_mode {
                            div_ceil(span, stride)
                        } else {
                            span.div_euclid(stride)
                        };
                        SymDim::Value(out + 1)
                    }
                    None => SymDim::Unknown,
                }
            }
            AutoPad::Valid => {
                if window == 1 && stride == 1 {
                    return self.clone();
                }
                match self.as_value() {
                    Some(size) => SymDim::Value(div_ceil(size - window + 1, stride)),
                    None => SymDim::Unknown,
                }
            }
            AutoPad::SameUpper | AutoPad::SameLower => {
                if stride == 1 {
                    return self.clone();
                }
                match self.as_value() {
                    Some(size) => SymDim::Value(div_ceil(size, stride)),
                    None => SymDim::Unknown,
                }
            }
        }
    }

    /// Compute the output size of a transposed convolution along this
    /// dimension. The inverse of [`pool`](SymDim::pool).
    pub fn unpool(
        &self,
        kernel: i32,
        stride: i32,
        pads: i32,
        dilation: i32,
        output_padding: i32,
        auto_pad: AutoPad,
    ) -> SymDim {
        let window = dilation * (kernel - 1) + 1;
        match auto_pad {
            AutoPad::SameUpper | AutoPad::SameLower => {
                if stride == 1 {
                    return self.clone();
                }
                match self.as_value() {
                    Some(size) => SymDim::Value(size * stride),
                    None => SymDim::Unknown,
                }
            }
            AutoPad::NotSet | AutoPad::Valid => {
                let pads = if auto_pad == AutoPad::Valid { 0 } else { pads };
                if window == 1 && stride == 1 && pads == 0 && output_padding == 0 {
                    return self.clone();
                }
                match self.as_value() {
                    Some(size) => {
                        SymDim::Value((size - 1) * stride + output_padding + window - pads)
                    }
                    None => SymDim::Unknown,
                }
            }
        }
    }
}

fn div_ceil(a: i32, b: i32) -> i32 {
    (a + b - 1).div_euclid(b)
}

impl From<i32> for SymDim {
    fn from(size: i32) -> SymDim {
        SymDim::Value(size)
    }
}

impl From<usize> for SymDim {
    fn from(size: usize) -> SymDim {
        SymDim::Value(size as i32)
    }
}

impl From<&str> for SymDim {
    fn from(name: &str) -> SymDim {
        SymDim::Param(name.to_string())
    }
}

impl Add for SymDim {
    type Output = SymDim;

    fn add(self, rhs: SymDim) -> SymDim {
        match (&self, &rhs) {
            (SymDim::Value(a), SymDim::Value(b)) => SymDim::Value(a + b),
            (_, SymDim::Value(0)) => self,
            (SymDim::Value(0), _) => rhs,
            _ => SymDim::Unknown,
        }
    }
}

impl Sub for SymDim {
    type Output = SymDim;

    fn sub(self, rhs: SymDim) -> SymDim {
        match (&self, &rhs) {
            (SymDim::Value(a), SymDim::Value(b)) => SymDim::Value(a - b),
            (_, SymDim::Value(0)) => self,
            _ => SymDim::Unknown,
        }
    }
}

impl Mul for SymDim {
    type Output = SymDim;

    fn mul(self, rhs: SymDim) -> SymDim {
        match (&self, &rhs) {
            (SymDim::Value(a), SymDim::Value(b)) => SymDim::Value(a * b),
            (_, SymDim::Value(1)) => self,
            (SymDim::Value(1), _) => rhs,
            (_, SymDim::Value(0)) | (SymDim::Value(0), _) => SymDim::Value(0),
            _ => SymDim::Unknown,
        }
    }
}

/// Division truncates. Layers that require exact division validate it
/// themselves before dividing.
impl Div for SymDim {
    type Output = SymDim;

    fn div(self, rhs: SymDim) -> SymDim {
        match (&self, &rhs) {
            (SymDim::Value(a), SymDim::Value(b)) if *b != 0 => SymDim::Value(a / b),
            (_, SymDim::Value(1)) => self,
            _ => SymDim::Unknown,
        }
    }
}

impl Display for SymDim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SymDim::Unknown => write!(f, "?"),
            SymDim::Value(size) => write!(f, "{}", size),
            SymDim::Param(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use parten_testing::TestCases;

    use super::{AutoPad, SymDim};
    use crate::error::LayerError;

    #[test]
    fn test_arithmetic() {
        #[derive(Debug)]
        struct Case {
            expr: SymDim,
            expected: SymDim,
        }

        let batch = || SymDim::param("batch");
        let val = SymDim::Value;

        let cases = [
            // Two known values.
            Case {
                expr: val(3) + val(4),
                expected: val(7),
            },
            Case {
                expr: val(3) - val(4),
                expected: val(-1),
            },
            Case {
                expr: val(3) * val(4),
                expected: val(12),
            },
            Case {
                expr: val(9) / val(2),
                expected: val(4),
            },
            // Neutral elements preserve params.
            Case {
                expr: batch() + val(0),
                expected: batch(),
            },
            Case {
                expr: batch() - val(0),
                expected: batch(),
            },
            Case {
                expr: batch() * val(1),
                expected: batch(),
            },
            Case {
                expr: batch() / val(1),
                expected: batch(),
            },
            Case {
                expr: val(0) + batch(),
                expected: batch(),
            },
            // Zero absorbs multiplication.
            Case {
                expr: batch() * val(0),
                expected: val(0),
            },
            Case {
                expr: SymDim::Unknown * val(0),
                expected: val(0),
            },
            // Everything else degrades to unknown.
            Case {
                expr: batch() + val(2),
                expected: SymDim::Unknown,
            },
            Case {
                expr: batch() + batch(),
                expected: SymDim::Unknown,
            },
            Case {
                expr: SymDim::Unknown + val(3),
                expected: SymDim::Unknown,
            },
            Case {
                expr: batch() * val(2),
                expected: SymDim::Unknown,
            },
            Case {
                expr: val(6) / SymDim::Unknown,
                expected: SymDim::Unknown,
            },
        ];

        cases.test_each(|case| {
            assert_eq!(case.expr, case.expected);
        })
    }

    #[test]
    fn test_unify() {
        #[derive(Debug)]
        struct Case {
            a: SymDim,
            b: SymDim,
            expected: Result<SymDim, LayerError>,
        }

        let cases = [
            Case {
                a: SymDim::Value(3),
                b: SymDim::Value(3),
                expected: Ok(SymDim::Value(3)),
            },
            Case {
                a: SymDim::Unknown,
                b: SymDim::param("batch"),
                expected: Ok(SymDim::param("batch")),
            },
            Case {
                a: SymDim::Value(7),
                b: SymDim::Unknown,
                expected: Ok(SymDim::Value(7)),
            },
            Case {
                a: SymDim::param("batch"),
                b: SymDim::Value(2),
                expected: Ok(SymDim::Value(2)),
            },
            Case {
                a: SymDim::param("batch"),
                b: SymDim::param("batch"),
                expected: Ok(SymDim::param("batch")),
            },
            Case {
                a: SymDim::param("batch"),
                b: SymDim::param("seq"),
                expected: Ok(SymDim::param("batch")),
            },
            Case {
                a: SymDim::Value(3),
                b: SymDim::Value(4),
                expected: Err(LayerError::ShapeMismatch(
                    "dimensions that must be equal have different sizes",
                )),
            },
        ];

        cases.test_each(|case| {
            assert_eq!(case.a.unify(&case.b), case.expected);
        })
    }

    #[test]
    fn test_broadcast() {
        #[derive(Debug)]
        struct Case {
            a: SymDim,
            b: SymDim,
            expected: Option<SymDim>,
        }

        let cases = [
            Case {
                a: SymDim::Value(5),
                b: SymDim::Value(5),
                expected: Some(SymDim::Value(5)),
            },
            Case {
                a: SymDim::Value(1),
                b: SymDim::Value(5),
                expected: Some(SymDim::Value(5)),
            },
            Case {
                a: SymDim::param("batch"),
                b: SymDim::Value(1),
                expected: Some(SymDim::param("batch")),
            },
            Case {
                a: SymDim::Value(5),
                b: SymDim::param("batch"),
                expected: Some(SymDim::Value(5)),
            },
            Case {
                a: SymDim::Unknown,
                b: SymDim::param("batch"),
                expected: Some(SymDim::param("batch")),
            },
            Case {
                a: SymDim::param("batch"),
                b: SymDim::param("batch"),
                expected: Some(SymDim::param("batch")),
            },
            Case {
                a: SymDim::param("batch"),
                b: SymDim::param("seq"),
                expected: Some(SymDim::Unknown),
            },
            Case {
                a: SymDim::Value(3),
                b: SymDim::Value(4),
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let result = case.a.broadcast(&case.b).ok();
            assert_eq!(result, case.expected);

            // Broadcasting is commutative.
            let swapped = case.b.broadcast(&case.a).ok();
            assert_eq!(swapped, case.expected);
        })
    }

    #[test]
    fn test_max_defined() {
        let batch = SymDim::param("batch");
        assert_eq!(
            SymDim::Value(4).max_defined(&batch),
            SymDim::Value(4),
        );
        assert_eq!(batch.max_defined(&SymDim::Value(4)), SymDim::Value(4));
        assert_eq!(batch.max_defined(&SymDim::Unknown), batch.clone());
        assert_eq!(
            SymDim::Unknown.max_defined(&SymDim::Unknown),
            SymDim::Unknown
        );
    }

    #[test]
    fn test_pool() {
        #[derive(Debug)]
        struct Case {
            input: SymDim,
            kernel: i32,
            stride: i32,
            pads: i32,
            dilation: i32,
            ceil_mode: bool,
            auto_pad: AutoPad,
            expected: SymDim,
        }

        let cases = [
            // floor((10 + 0 - 1*(3-1) - 1) / 2) + 1 == 4
            Case {
                input: SymDim::Value(10),
                kernel: 3,
                stride: 2,
                pads: 0,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Value(4),
            },
            // Same window with padding 1 on both sides.
            Case {
                input: SymDim::Value(10),
                kernel: 3,
                stride: 2,
                pads: 2,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Value(5),
            },
            // Ceil mode rounds the division up.
            Case {
                input: SymDim::Value(10),
                kernel: 2,
                stride: 3,
                pads: 0,
                dilation: 1,
                ceil_mode: true,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Value(4),
            },
            // Dilation enlarges the effective window.
            Case {
                input: SymDim::Value(10),
                kernel: 3,
                stride: 1,
                pads: 0,
                dilation: 2,
                ceil_mode: false,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Value(6),
            },
            // A 1x1 window with stride 1 passes any dimension through.
            Case {
                input: SymDim::param("width"),
                kernel: 1,
                stride: 1,
                pads: 0,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::param("width"),
            },
            Case {
                input: SymDim::Value(10),
                kernel: 3,
                stride: 2,
                pads: 0,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::Valid,
                expected: SymDim::Value(4),
            },
            // Same padding: out = ceil(in / stride).
            Case {
                input: SymDim::Value(10),
                kernel: 3,
                stride: 2,
                pads: 0,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::SameUpper,
                expected: SymDim::Value(5),
            },
            // Same padding with stride 1 preserves params.
            Case {
                input: SymDim::param("width"),
                kernel: 5,
                stride: 1,
                pads: 0,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::SameLower,
                expected: SymDim::param("width"),
            },
            Case {
                input: SymDim::Unknown,
                kernel: 3,
                stride: 2,
                pads: 0,
                dilation: 1,
                ceil_mode: false,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Unknown,
            },
        ];

        cases.test_each(|case| {
            let out = case.input.pool(
                case.kernel,
                case.stride,
                case.pads,
                case.dilation,
                case.ceil_mode,
                case.auto_pad,
            );
            assert_eq!(out, case.expected);
        })
    }

    #[test]
    fn test_unpool() {
        #[derive(Debug)]
        struct Case {
            input: SymDim,
            kernel: i32,
            stride: i32,
            pads: i32,
            output_padding: i32,
            auto_pad: AutoPad,
            expected: SymDim,
        }

        let cases = [
            // (4 - 1) * 2 + 3 == 9
            Case {
                input: SymDim::Value(4),
                kernel: 3,
                stride: 2,
                pads: 0,
                output_padding: 0,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Value(9),
            },
            Case {
                input: SymDim::Value(4),
                kernel: 3,
                stride: 2,
                pads: 2,
                output_padding: 1,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Value(8),
            },
            Case {
                input: SymDim::Value(4),
                kernel: 3,
                stride: 2,
                pads: 0,
                output_padding: 0,
                auto_pad: AutoPad::SameUpper,
                expected: SymDim::Value(8),
            },
            Case {
                input: SymDim::param("seq"),
                kernel: 1,
                stride: 1,
                pads: 0,
                output_padding: 0,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::param("seq"),
            },
            Case {
                input: SymDim::Unknown,
                kernel: 3,
                stride: 2,
                pads: 0,
                output_padding: 0,
                auto_pad: AutoPad::NotSet,
                expected: SymDim::Unknown,
            },
        ];

        cases.test_each(|case| {
            let out = case.input.unpool(
                case.kernel,
                case.stride,
                case.pads,
                1,
                case.output_padding,
                case.auto_pad,
            );
            assert_eq!(out, case.expected);
        })
    }
}
